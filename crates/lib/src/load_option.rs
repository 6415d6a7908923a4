//! The binary `EFI_LOAD_OPTION` layout stored in each `Boot####` variable.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::device_path::{encode_ucs2, read_ucs2_until_nul, ByteReader, DevicePath};
use crate::errors::{Error, Result};

/// The entry may be booted automatically.
pub const LOAD_OPTION_ACTIVE: u32 = 0x0000_0001;

/// The 16-bit slot number of a boot entry; `Boot####` in hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BootId(pub u16);

impl Display for BootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl Serialize for BootId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Failed to parse a [`BootId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid boot entry number '{0}': expected 1 to 4 hex digits")]
pub struct ParseBootIdError(String);

impl FromStr for BootId {
    type Err = ParseBootIdError;

    /// Accepts `0001`, `1`, `1a` or `Boot001A`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let digits = s.strip_prefix("Boot").unwrap_or(s);
        if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(ParseBootIdError(s.to_string()));
        }
        u16::from_str_radix(digits, 16)
            .map(BootId)
            .map_err(|_| ParseBootIdError(s.to_string()))
    }
}

/// One firmware boot entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    /// Slot number.
    pub id: BootId,
    /// Human readable label.
    pub description: String,
    /// Where the loader lives.
    pub device_path: DevicePath,
    /// Whether [`LOAD_OPTION_ACTIVE`] is set.
    pub active: bool,
    /// Every other attribute bit, preserved as read.
    pub attributes: u32,
    /// Optional data passed to the loader; never `Some` of an empty buffer.
    pub payload: Option<Vec<u8>>,
}

impl BootEntry {
    /// Construct an active entry with no extra attributes.
    pub fn new(
        id: BootId,
        description: impl Into<String>,
        device_path: DevicePath,
        payload: Option<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            description: description.into(),
            device_path,
            active: true,
            attributes: 0,
            payload: payload.filter(|p| !p.is_empty()),
        }
    }

    /// Check the entry can be represented in the binary format.
    pub fn validate(&self) -> Result<()> {
        if self.description.contains('\0') {
            return Err(Error::InvalidDescription(format!(
                "{:?} contains a NUL character",
                self.description
            )));
        }
        self.device_path
            .check_lengths()
            .map_err(|reason| Error::CorruptEntry {
                name: format!("Boot{}", self.id),
                reason,
            })
    }

    /// The payload interpreted as a UCS-2 kernel command line, when it is one.
    pub fn payload_text(&self) -> Option<String> {
        let payload = self.payload.as_deref()?;
        if payload.len() % 2 != 0 {
            return None;
        }
        let units: Vec<u16> = payload
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let units = units.strip_suffix(&[0u16]).unwrap_or(&units);
        let s = String::from_utf16(units).ok()?;
        s.chars()
            .all(|c| !c.is_control())
            .then_some(s)
    }
}

/// Decode a load option read from `Boot{id}`.
pub fn decode(id: BootId, buf: &[u8]) -> Result<BootEntry> {
    let corrupt = |reason: &str| Error::CorruptEntry {
        name: format!("Boot{id}"),
        reason: reason.to_string(),
    };
    let mut r = ByteReader::new(buf);
    let attrs = r.u32().ok_or_else(|| corrupt("truncated attributes"))?;
    let dp_len = r
        .u16()
        .ok_or_else(|| corrupt("truncated device path length"))?;
    let units = read_ucs2_until_nul(&mut r).ok_or_else(|| corrupt("unterminated description"))?;
    let description = String::from_utf16(&units).unwrap_or_else(|_| {
        tracing::warn!("Boot{id}: description is not valid UTF-16");
        String::from_utf16_lossy(&units)
    });
    let dp = r
        .take(usize::from(dp_len))
        .ok_or_else(|| corrupt("device path list shorter than declared"))?;
    let device_path = DevicePath::decode(dp).map_err(|e| corrupt(&e.to_string()))?;
    let payload = Some(r.remaining().to_vec()).filter(|p| !p.is_empty());
    Ok(BootEntry {
        id,
        description,
        device_path,
        active: attrs & LOAD_OPTION_ACTIVE != 0,
        attributes: attrs & !LOAD_OPTION_ACTIVE,
        payload,
    })
}

/// Encode an entry. The caller is expected to have run [`BootEntry::validate`].
pub fn encode(entry: &BootEntry) -> Vec<u8> {
    let mut attrs = entry.attributes & !LOAD_OPTION_ACTIVE;
    if entry.active {
        attrs |= LOAD_OPTION_ACTIVE;
    }
    let dp = entry.device_path.encode();
    let dp_len = u16::try_from(dp.len()).unwrap_or(u16::MAX);
    let mut out = Vec::with_capacity(6 + dp.len());
    out.extend_from_slice(&attrs.to_le_bytes());
    out.extend_from_slice(&dp_len.to_le_bytes());
    encode_ucs2(&entry.description, &mut out);
    out.extend_from_slice(&dp);
    if let Some(payload) = entry.payload.as_deref() {
        out.extend_from_slice(payload);
    }
    out
}

#[cfg(test)]
mod test {
    use quickcheck::{quickcheck, TestResult};
    use uuid::Uuid;

    use super::*;
    use crate::device_path::{DevicePathNode, DiskSignature, HardDriveNode};

    fn sample() -> BootEntry {
        let hd = HardDriveNode {
            partition_number: 2,
            partition_start: 526336,
            partition_size: 209715200,
            signature: DiskSignature::Gpt(
                Uuid::parse_str("5e4d3c2b-1a09-4f8e-b7d6-c5b4a3928170").unwrap(),
            ),
        };
        BootEntry::new(
            BootId(3),
            "MX Linux",
            DevicePath::hard_drive_file(hd, "\\EFI\\MX\\grubx64.efi"),
            None,
        )
    }

    #[test]
    fn test_boot_id() {
        assert_eq!(BootId(0x1a).to_string(), "001A");
        assert_eq!("Boot001A".parse::<BootId>().unwrap(), BootId(0x1a));
        assert_eq!("1a".parse::<BootId>().unwrap(), BootId(0x1a));
        assert_eq!("FFFF".parse::<BootId>().unwrap(), BootId(0xffff));
        for bad in ["", "Boot", "10000", "0x1", "+1", "g"] {
            assert!(bad.parse::<BootId>().is_err(), "{bad}");
        }
        assert_eq!(serde_json::to_string(&BootId(7)).unwrap(), "\"0007\"");
    }

    #[test]
    fn test_layout() {
        let e = sample();
        let buf = encode(&e);
        assert_eq!(&buf[0..4], &[1, 0, 0, 0]);
        let dp_len = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        assert_eq!(dp_len, e.device_path.encoded_len());
        // "MX Linux" plus terminator
        assert_eq!(buf.len(), 6 + 18 + dp_len);
        assert_eq!(&buf[6..8], &[b'M', 0]);
        assert_eq!(decode(e.id, &buf).unwrap(), e);
    }

    #[test]
    fn test_attributes_preserved() {
        let mut e = sample();
        e.active = false;
        // LOAD_OPTION_HIDDEN and a category bit
        e.attributes = 0x0000_0008 | 0x0000_0100;
        let d = decode(e.id, &encode(&e)).unwrap();
        assert!(!d.active);
        assert_eq!(d.attributes, 0x108);
    }

    #[test]
    fn test_empty_payload_normalized() {
        let e = BootEntry::new(BootId(1), "", DevicePath::default(), Some(vec![]));
        assert!(e.payload.is_none());
        let buf = encode(&e);
        assert_eq!(buf, vec![1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(decode(BootId(1), &buf).unwrap(), e);
    }

    #[test]
    fn test_corrupt() {
        let buf = encode(&sample());
        for (len, reason) in [
            (3, "truncated attributes"),
            (5, "truncated device path length"),
            (10, "unterminated description"),
            (buf.len() - 1, "device path list shorter than declared"),
        ] {
            match decode(BootId(3), &buf[..len]) {
                Err(Error::CorruptEntry { name, reason: r }) => {
                    assert_eq!(name, "Boot0003");
                    assert_eq!(r, reason);
                }
                o => panic!("Unexpected result for {len}: {o:?}"),
            }
        }
        // A node that claims more bytes than the list holds
        let mut bad = vec![1, 0, 0, 0, 4, 0, 0, 0];
        bad.extend_from_slice(&[0x04, 0x04, 0xFF, 0x00]);
        assert!(matches!(
            decode(BootId(3), &bad),
            Err(Error::CorruptEntry { .. })
        ));
    }

    #[test]
    fn test_payload_text() {
        let mut payload = Vec::new();
        encode_ucs2("root=UUID=abc quiet", &mut payload);
        let mut e = sample();
        e.payload = Some(payload);
        assert_eq!(e.payload_text().as_deref(), Some("root=UUID=abc quiet"));
        e.payload = Some(vec![0x01, 0x02, 0x03]);
        assert!(e.payload_text().is_none());
    }

    #[test]
    fn test_validate() {
        let mut e = sample();
        e.validate().unwrap();
        e.description = "bad\0label".into();
        assert!(matches!(e.validate(), Err(Error::InvalidDescription(_))));
        e.description = "ok".into();
        e.device_path = DevicePath::new(vec![DevicePathNode::Other {
            node_type: 1,
            sub_type: 1,
            data: vec![0; 70000],
        }]);
        assert!(matches!(e.validate(), Err(Error::CorruptEntry { .. })));
    }

    quickcheck! {
        fn prop_roundtrip(
            description: String,
            file: String,
            payload: Vec<u8>,
            active: bool,
            geometry: (u32, u64, u64),
            guid: u128,
            mbr: Option<u32>
        ) -> TestResult {
            if description.contains('\0') || file.contains('\0') {
                return TestResult::discard();
            }
            let (partition_number, partition_start, partition_size) = geometry;
            let signature = match mbr {
                Some(v) => DiskSignature::Mbr(v),
                None => DiskSignature::Gpt(Uuid::from_u128(guid)),
            };
            let hd = HardDriveNode { partition_number, partition_start, partition_size, signature };
            let mut e = BootEntry::new(
                BootId(partition_number as u16),
                description,
                DevicePath::hard_drive_file(hd, &file),
                Some(payload),
            );
            e.active = active;
            if e.validate().is_err() {
                return TestResult::discard();
            }
            TestResult::from_bool(decode(e.id, &encode(&e)).unwrap() == e)
        }
    }
}
