//! Mapping between firmware device paths and live partitions.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::device_path::{DevicePath, DiskSignature, HardDriveNode};
use crate::errors::{Error, Result};
use crate::services::{PartitionSource, Unlocker};

/// GPT type GUID of an EFI system partition.
pub const ESP_PARTTYPE_GPT: &str = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b";
/// MBR type byte of an EFI system partition, as lsblk prints it.
pub const ESP_PARTTYPE_MBR: &str = "0xef";

const LUKS_FSTYPE: &str = "crypto_LUKS";

/// A concrete partition as the firmware and the OS each see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionIdentity {
    /// What a hard-drive node records.
    #[serde(serialize_with = "serialize_signature")]
    pub disk: DiskSignature,
    /// 1-based.
    pub partition_number: u32,
    /// UUID of the filesystem on the partition (or of the LUKS header).
    pub filesystem_uuid: Option<String>,
    /// Block device, e.g. `/dev/nvme0n1p2`; a `/dev/mapper` path once unlocked.
    pub device: Utf8PathBuf,
    /// Whole-disk device.
    pub parent: Utf8PathBuf,
    /// First logical block.
    pub start: u64,
    /// Size in logical blocks.
    pub size: u64,
    /// Filesystem type.
    pub fstype: Option<String>,
    /// Partition type GUID or MBR type byte.
    pub parttype: Option<String>,
}

fn serialize_signature<S: serde::Serializer>(
    sig: &DiskSignature,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match sig {
        DiskSignature::Mbr(v) => s.collect_str(&format_args!("{v:08x}")),
        DiskSignature::Gpt(g) => s.collect_str(g),
    }
}

impl PartitionIdentity {
    /// Whether this is a LUKS container that must be unlocked to be used.
    pub fn is_encrypted(&self) -> bool {
        self.fstype.as_deref() == Some(LUKS_FSTYPE)
    }

    /// Whether this is a FAT-formatted EFI system partition.
    pub fn is_esp(&self) -> bool {
        let esp_type = self
            .parttype
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(ESP_PARTTYPE_GPT) || t == ESP_PARTTYPE_MBR);
        esp_type && self.fstype.as_deref() == Some("vfat")
    }

    /// The hard-drive node firmware uses to find this partition.
    pub fn hard_drive_node(&self) -> HardDriveNode {
        HardDriveNode {
            partition_number: self.partition_number,
            partition_start: self.start,
            partition_size: self.size,
            signature: self.disk,
        }
    }
}

/// Resolves device paths against the partitions currently present.
#[derive(Debug)]
pub struct Resolver<'a> {
    source: &'a dyn PartitionSource,
}

impl<'a> Resolver<'a> {
    /// Resolve against `source`.
    pub fn new(source: &'a dyn PartitionSource) -> Self {
        Self { source }
    }

    /// The partition enumeration collaborator.
    pub fn source(&self) -> &'a dyn PartitionSource {
        self.source
    }

    /// Every partition currently present.
    pub fn partitions(&self) -> Result<Vec<PartitionIdentity>> {
        Ok(self.source.list_partitions()?)
    }

    /// Find the partition a device path points at. GPT partitions match by
    /// partition GUID, MBR partitions by disk signature and start sector.
    pub fn resolve(&self, path: &DevicePath) -> Result<PartitionIdentity> {
        let unresolvable = |reason: String| Error::Unresolvable {
            path: path.to_string(),
            reason,
        };
        let hd = path
            .hard_drive()
            .ok_or_else(|| unresolvable("no hard drive node".into()))?;
        let found = self.partitions()?.into_iter().find(|p| match hd.signature {
            DiskSignature::Gpt(_) => p.disk == hd.signature,
            DiskSignature::Mbr(_) => p.disk == hd.signature && p.start == hd.partition_start,
        });
        let Some(found) = found else {
            return Err(unresolvable("no matching partition present".into()));
        };
        if found.partition_number != hd.partition_number {
            return Err(Error::InconsistentPartitionNumber {
                device: found.device,
                recorded: hd.partition_number,
                live: found.partition_number,
            });
        }
        tracing::debug!("Resolved {path} to {}", found.device);
        Ok(found)
    }

    /// Look up a partition by block device, accepting `sda2` or `/dev/sda2`.
    pub fn resolve_device(&self, device: &str) -> Result<PartitionIdentity> {
        let device = if device.starts_with('/') {
            Utf8PathBuf::from(device)
        } else {
            Utf8Path::new("/dev").join(device)
        };
        self.partitions()?
            .into_iter()
            .find(|p| p.device == device)
            .ok_or_else(|| Error::Unresolvable {
                path: device.to_string(),
                reason: "no such partition".into(),
            })
    }

    /// The device path for a loader file on `identity`.
    pub fn build(identity: &PartitionIdentity, file_path: &str) -> DevicePath {
        DevicePath::hard_drive_file(identity.hard_drive_node(), file_path)
    }

    /// Unlock `identity` through `unlocker` if it is encrypted; otherwise
    /// return it unchanged.
    pub fn unlock_if_encrypted(
        identity: &PartitionIdentity,
        unlocker: &dyn Unlocker,
        passphrase: Option<Vec<u8>>,
    ) -> Result<PartitionIdentity> {
        if !identity.is_encrypted() {
            return Ok(identity.clone());
        }
        let Some(passphrase) = passphrase else {
            return Err(Error::PassphraseRequired(identity.device.to_string()));
        };
        unlocker.unlock(identity, passphrase)
    }
}
