//! Firmware device paths: the node list a boot entry uses to locate its loader.
//!
//! Only the nodes this tool creates are decoded into typed variants, and only
//! when their encoding is the canonical one; anything else is carried as raw
//! bytes so that entries written by firmware or other tools survive a
//! decode/encode cycle unchanged.

use std::fmt::{self, Display, Write as _};

use uuid::Uuid;

const MEDIA_DEVICE_PATH: u8 = 0x04;
const MEDIA_HARD_DRIVE: u8 = 0x01;
const MEDIA_FILE_PATH: u8 = 0x04;
const END_DEVICE_PATH: u8 = 0x7F;
const END_ENTIRE: u8 = 0xFF;
const END_INSTANCE: u8 = 0x01;

const NODE_HEADER_LEN: usize = 4;
/// Total size of a hard-drive media node, header included.
pub(crate) const HARD_DRIVE_NODE_LEN: usize = 42;

const FORMAT_MBR: u8 = 0x01;
const FORMAT_GPT: u8 = 0x02;
const SIGNATURE_MBR: u8 = 0x01;
const SIGNATURE_GUID: u8 = 0x02;

/// The disk/partition signature recorded in a hard-drive node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskSignature {
    /// 32-bit MBR disk signature.
    Mbr(u32),
    /// GPT unique partition GUID.
    Gpt(Uuid),
}

/// A hard-drive media node: which partition of which disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardDriveNode {
    /// 1-based partition number.
    pub partition_number: u32,
    /// First logical block of the partition.
    pub partition_start: u64,
    /// Size in logical blocks.
    pub partition_size: u64,
    /// Disk identity.
    pub signature: DiskSignature,
}

/// One node of a device path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePathNode {
    /// Hard-drive media node (4/1).
    HardDrive(HardDriveNode),
    /// File path media node (4/4), in backslash form.
    FilePath(String),
    /// End of this instance; another follows (0x7F/0x01).
    EndInstance,
    /// End of the entire device path (0x7F/0xFF).
    End,
    /// Any node kept verbatim.
    Other {
        /// Node type.
        node_type: u8,
        /// Node subtype.
        sub_type: u8,
        /// Node payload, header excluded.
        data: Vec<u8>,
    },
}

/// A device path that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed device path at offset {offset}: {reason}")]
pub struct MalformedDevicePath {
    /// Byte offset of the offending node.
    pub offset: usize,
    /// What was wrong.
    pub reason: &'static str,
}

/// A decoded device path list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePath {
    nodes: Vec<DevicePathNode>,
}

/// Sequential little-endian reader over a byte slice that never reads out of bounds.
#[derive(Debug)]
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub(crate) fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let r = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(r)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    pub(crate) fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|b| b[0])
    }

    pub(crate) fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_le_bytes)
    }

    pub(crate) fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_le_bytes)
    }

    pub(crate) fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_le_bytes)
    }
}

/// Append `s` as UTF-16LE with a terminating NUL.
pub(crate) fn encode_ucs2(s: &str, out: &mut Vec<u8>) {
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&[0, 0]);
}

/// Length in bytes of [`encode_ucs2`] output.
pub(crate) fn ucs2_len(s: &str) -> usize {
    (s.encode_utf16().count() + 1) * 2
}

/// Read code units up to (and consuming) a NUL terminator. `None` if the
/// input ends first.
pub(crate) fn read_ucs2_until_nul(r: &mut ByteReader<'_>) -> Option<Vec<u16>> {
    let mut units = Vec::new();
    loop {
        match r.u16()? {
            0 => return Some(units),
            u => units.push(u),
        }
    }
}

/// Convert a path to the form firmware expects: backslash separators and a
/// leading backslash.
pub fn normalize_file_path(path: &str) -> String {
    let p = path.replace('/', "\\");
    if p.starts_with('\\') {
        p
    } else {
        format!("\\{p}")
    }
}

impl HardDriveNode {
    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != HARD_DRIVE_NODE_LEN - NODE_HEADER_LEN {
            return None;
        }
        let mut r = ByteReader::new(data);
        let partition_number = r.u32()?;
        let partition_start = r.u64()?;
        let partition_size = r.u64()?;
        let sig: [u8; 16] = r.array()?;
        let format = r.u8()?;
        let sigtype = r.u8()?;
        let signature = match (format, sigtype) {
            (FORMAT_MBR, SIGNATURE_MBR) if sig[4..].iter().all(|&b| b == 0) => {
                DiskSignature::Mbr(u32::from_le_bytes([sig[0], sig[1], sig[2], sig[3]]))
            }
            (FORMAT_GPT, SIGNATURE_GUID) => DiskSignature::Gpt(Uuid::from_bytes_le(sig)),
            _ => return None,
        };
        Some(Self {
            partition_number,
            partition_start,
            partition_size,
            signature,
        })
    }

    fn encode_data(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.partition_number.to_le_bytes());
        out.extend_from_slice(&self.partition_start.to_le_bytes());
        out.extend_from_slice(&self.partition_size.to_le_bytes());
        let (sig, format, sigtype) = match self.signature {
            DiskSignature::Mbr(v) => {
                let mut sig = [0u8; 16];
                sig[..4].copy_from_slice(&v.to_le_bytes());
                (sig, FORMAT_MBR, SIGNATURE_MBR)
            }
            DiskSignature::Gpt(g) => (g.to_bytes_le(), FORMAT_GPT, SIGNATURE_GUID),
        };
        out.extend_from_slice(&sig);
        out.push(format);
        out.push(sigtype);
    }
}

fn decode_file_path(data: &[u8]) -> Option<String> {
    let mut r = ByteReader::new(data);
    let units = read_ucs2_until_nul(&mut r)?;
    if !r.remaining().is_empty() {
        return None;
    }
    String::from_utf16(&units).ok()
}

impl DevicePathNode {
    fn decode(node_type: u8, sub_type: u8, data: &[u8]) -> Self {
        let typed = match (node_type, sub_type) {
            (MEDIA_DEVICE_PATH, MEDIA_HARD_DRIVE) => {
                HardDriveNode::decode(data).map(DevicePathNode::HardDrive)
            }
            (MEDIA_DEVICE_PATH, MEDIA_FILE_PATH) => {
                decode_file_path(data).map(DevicePathNode::FilePath)
            }
            (END_DEVICE_PATH, END_ENTIRE) if data.is_empty() => Some(DevicePathNode::End),
            (END_DEVICE_PATH, END_INSTANCE) if data.is_empty() => Some(DevicePathNode::EndInstance),
            _ => None,
        };
        typed.unwrap_or_else(|| DevicePathNode::Other {
            node_type,
            sub_type,
            data: data.to_vec(),
        })
    }

    fn type_and_subtype(&self) -> (u8, u8) {
        match self {
            DevicePathNode::HardDrive(_) => (MEDIA_DEVICE_PATH, MEDIA_HARD_DRIVE),
            DevicePathNode::FilePath(_) => (MEDIA_DEVICE_PATH, MEDIA_FILE_PATH),
            DevicePathNode::EndInstance => (END_DEVICE_PATH, END_INSTANCE),
            DevicePathNode::End => (END_DEVICE_PATH, END_ENTIRE),
            DevicePathNode::Other {
                node_type,
                sub_type,
                ..
            } => (*node_type, *sub_type),
        }
    }

    /// Encoded size including the header.
    pub fn encoded_len(&self) -> usize {
        NODE_HEADER_LEN
            + match self {
                DevicePathNode::HardDrive(_) => HARD_DRIVE_NODE_LEN - NODE_HEADER_LEN,
                DevicePathNode::FilePath(p) => ucs2_len(p),
                DevicePathNode::EndInstance | DevicePathNode::End => 0,
                DevicePathNode::Other { data, .. } => data.len(),
            }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let (t, s) = self.type_and_subtype();
        out.push(t);
        out.push(s);
        // Callers check lengths via DevicePath::check_lengths first
        let len = u16::try_from(self.encoded_len()).unwrap_or(u16::MAX);
        out.extend_from_slice(&len.to_le_bytes());
        match self {
            DevicePathNode::HardDrive(hd) => hd.encode_data(out),
            DevicePathNode::FilePath(p) => encode_ucs2(p, out),
            DevicePathNode::EndInstance | DevicePathNode::End => {}
            DevicePathNode::Other { data, .. } => out.extend_from_slice(data),
        }
    }
}

impl Display for DevicePathNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePathNode::HardDrive(hd) => {
                write!(f, "HD({},", hd.partition_number)?;
                match hd.signature {
                    DiskSignature::Mbr(v) => write!(f, "MBR,0x{v:x}")?,
                    DiskSignature::Gpt(g) => write!(f, "GPT,{g}")?,
                }
                write!(f, ",0x{:x},0x{:x})", hd.partition_start, hd.partition_size)
            }
            DevicePathNode::FilePath(p) => write!(f, "File({p})"),
            DevicePathNode::EndInstance => f.write_char(','),
            DevicePathNode::End => Ok(()),
            DevicePathNode::Other {
                node_type,
                sub_type,
                data,
            } => write!(f, "Path({node_type},{sub_type},{})", hex::encode(data)),
        }
    }
}

impl DevicePath {
    /// Construct from nodes as given; no terminator is added.
    pub fn new(nodes: Vec<DevicePathNode>) -> Self {
        Self { nodes }
    }

    /// The short-form path `HD(..)/File(..)/End` used for entries this tool creates.
    pub fn hard_drive_file(hd: HardDriveNode, file_path: &str) -> Self {
        Self::new(vec![
            DevicePathNode::HardDrive(hd),
            DevicePathNode::FilePath(normalize_file_path(file_path)),
            DevicePathNode::End,
        ])
    }

    /// The nodes in order.
    pub fn nodes(&self) -> &[DevicePathNode] {
        &self.nodes
    }

    /// The first hard-drive node.
    pub fn hard_drive(&self) -> Option<&HardDriveNode> {
        self.nodes.iter().find_map(|n| match n {
            DevicePathNode::HardDrive(hd) => Some(hd),
            _ => None,
        })
    }

    /// The first file path node.
    pub fn file_path(&self) -> Option<&str> {
        self.nodes.iter().find_map(|n| match n {
            DevicePathNode::FilePath(p) => Some(p.as_str()),
            _ => None,
        })
    }

    /// Decode a complete file path list.
    pub fn decode(buf: &[u8]) -> Result<Self, MalformedDevicePath> {
        let mut r = ByteReader::new(buf);
        let mut nodes = Vec::new();
        while !r.remaining().is_empty() {
            let offset = r.pos();
            let malformed = |reason| MalformedDevicePath { offset, reason };
            let (Some(node_type), Some(sub_type), Some(len)) = (r.u8(), r.u8(), r.u16()) else {
                return Err(malformed("truncated node header"));
            };
            let len = usize::from(len);
            if len < NODE_HEADER_LEN {
                return Err(malformed("node length shorter than header"));
            }
            let data = r
                .take(len - NODE_HEADER_LEN)
                .ok_or_else(|| malformed("node extends past end of list"))?;
            nodes.push(DevicePathNode::decode(node_type, sub_type, data));
        }
        Ok(Self { nodes })
    }

    /// Total encoded size.
    pub fn encoded_len(&self) -> usize {
        self.nodes.iter().map(DevicePathNode::encoded_len).sum()
    }

    /// Verify the path fits the 16-bit length fields of the load option format.
    pub fn check_lengths(&self) -> Result<(), String> {
        let len = self.encoded_len();
        if len > usize::from(u16::MAX) {
            return Err(format!("device path too long ({len} bytes)"));
        }
        Ok(())
    }

    /// Encode into the firmware binary form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        for node in &self.nodes {
            node.encode(&mut out);
        }
        out
    }
}

impl Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut need_sep = false;
        for node in &self.nodes {
            match node {
                DevicePathNode::End => {}
                DevicePathNode::EndInstance => {
                    write!(f, "{node}")?;
                    need_sep = false;
                }
                n => {
                    if need_sep {
                        f.write_char('/')?;
                    }
                    write!(f, "{n}")?;
                    need_sep = true;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    static_assertions::const_assert_eq!(HARD_DRIVE_NODE_LEN, 4 + 4 + 8 + 8 + 16 + 1 + 1);

    fn gpt_node() -> HardDriveNode {
        HardDriveNode {
            partition_number: 1,
            partition_start: 0x800,
            partition_size: 0x80000,
            signature: DiskSignature::Gpt(
                Uuid::parse_str("0d2b3c1e-6f8a-4b0e-9b7a-3f2e1d0c9b8a").unwrap(),
            ),
        }
    }

    #[test]
    fn test_hard_drive_encoding() {
        let path = DevicePath::hard_drive_file(gpt_node(), "/EFI/MX/grubx64.efi");
        let buf = path.encode();
        assert_eq!(&buf[0..4], &[0x04, 0x01, 42, 0]);
        // Partition number then start
        assert_eq!(&buf[4..8], &[1, 0, 0, 0]);
        assert_eq!(&buf[8..16], &0x800u64.to_le_bytes());
        // Mixed-endian GUID layout
        assert_eq!(&buf[24..28], &[0x1e, 0x3c, 0x2b, 0x0d]);
        assert_eq!(&buf[40..42], &[FORMAT_GPT, SIGNATURE_GUID]);
        assert_eq!(&buf[buf.len() - 4..], &[0x7F, 0xFF, 4, 0]);
        assert_eq!(buf.len(), path.encoded_len());
        assert_eq!(DevicePath::decode(&buf).unwrap(), path);
        assert_eq!(path.file_path(), Some("\\EFI\\MX\\grubx64.efi"));
    }

    #[test]
    fn test_display() {
        let path = DevicePath::hard_drive_file(gpt_node(), "\\EFI\\MX\\grubx64.efi");
        assert_eq!(
            path.to_string(),
            "HD(1,GPT,0d2b3c1e-6f8a-4b0e-9b7a-3f2e1d0c9b8a,0x800,0x80000)/File(\\EFI\\MX\\grubx64.efi)"
        );
        let mbr = HardDriveNode {
            signature: DiskSignature::Mbr(0x5c7d2e1f),
            ..gpt_node()
        };
        assert!(DevicePath::hard_drive_file(mbr, "x.efi")
            .to_string()
            .starts_with("HD(1,MBR,0x5c7d2e1f,0x800,"));
    }

    #[test]
    fn test_unknown_nodes_preserved() {
        // A PCI node (1/1) followed by a file path with trailing garbage, then end
        let mut buf = vec![0x01, 0x01, 6, 0, 0x02, 0x1f];
        buf.extend_from_slice(&[0x04, 0x04, 10, 0, b'a', 0, 0, 0, 0xAA, 0xBB]);
        buf.extend_from_slice(&[0x7F, 0xFF, 4, 0]);
        let path = DevicePath::decode(&buf).unwrap();
        assert_eq!(path.nodes().len(), 3);
        assert!(matches!(
            path.nodes()[1],
            DevicePathNode::Other {
                node_type: 4,
                sub_type: 4,
                ..
            }
        ));
        assert!(path.file_path().is_none());
        assert_eq!(path.encode(), buf);
    }

    #[test]
    fn test_malformed() {
        // Declares 42 bytes but only a header is present
        let e = DevicePath::decode(&[0x04, 0x01, 42, 0]).unwrap_err();
        assert_eq!(e.offset, 0);
        let e = DevicePath::decode(&[0x7F, 0xFF, 4, 0, 0x04, 0x04, 2, 0]).unwrap_err();
        assert_eq!(e.offset, 4);
        assert!(DevicePath::decode(&[0x7F, 0xFF]).is_err());
        assert_eq!(DevicePath::decode(&[]).unwrap(), DevicePath::default());
    }

    #[test]
    fn test_noncanonical_hard_drive() {
        // MBR format with a GUID signature type is kept raw
        let mut buf = DevicePath::new(vec![DevicePathNode::HardDrive(gpt_node())]).encode();
        buf[40] = FORMAT_MBR;
        let path = DevicePath::decode(&buf).unwrap();
        assert!(path.hard_drive().is_none());
        assert_eq!(path.encode(), buf);
    }

    #[test]
    fn test_normalize_file_path() {
        assert_eq!(normalize_file_path("EFI/MX/vmlinuz"), "\\EFI\\MX\\vmlinuz");
        assert_eq!(normalize_file_path("\\EFI\\MX\\vmlinuz"), "\\EFI\\MX\\vmlinuz");
    }
}
