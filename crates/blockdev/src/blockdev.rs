//! Block device enumeration via `lsblk`, flattened into the per-partition
//! view needed to build and resolve firmware device paths.

use std::process::Command;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;
use serde::Deserialize;

use uefimgr_utils::CommandRunExt;

pub mod luks;

/// Logical sector size assumed when lsblk does not report one.
const DEFAULT_SECTOR_SIZE: u64 = 512;

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A block device as reported by `lsblk -J -b -O`.
#[derive(Debug, Deserialize)]
pub struct Device {
    pub name: String,
    pub serial: Option<String>,
    pub model: Option<String>,
    pub partlabel: Option<String>,
    pub parttype: Option<String>,
    pub partuuid: Option<String>,
    /// Partition table identifier: a GUID for GPT, an 8 hex digit signature for MBR.
    pub ptuuid: Option<String>,
    pub pttype: Option<String>,
    // Not available on older util-linux.
    pub partn: Option<u32>,
    pub children: Option<Vec<Device>>,
    pub size: u64,
    #[serde(rename = "maj:min")]
    pub maj_min: Option<String>,
    /// In 512-byte units, regardless of the logical sector size.
    pub start: Option<u64>,
    #[serde(rename = "log-sec")]
    pub log_sec: Option<u64>,
    #[serde(rename = "type")]
    pub devtype: Option<String>,

    // Filesystem-related properties
    pub label: Option<String>,
    pub fstype: Option<String>,
    pub uuid: Option<String>,
    pub path: Option<String>,
}

impl Device {
    // Older lsblk doesn't have PATH, so we do it
    pub fn path(&self) -> String {
        self.path.clone().unwrap_or(format!("/dev/{}", &self.name))
    }

    pub fn has_children(&self) -> bool {
        self.children.as_ref().is_some_and(|v| !v.is_empty())
    }

    fn read_sysfs_u64(&self, attr: &str) -> Result<Option<u64>> {
        let Some(majmin) = self.maj_min.as_deref() else {
            return Ok(None);
        };
        let path = format!("/sys/dev/block/{majmin}/{attr}");
        if !Utf8Path::new(&path).try_exists()? {
            return Ok(None);
        }
        let v = std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
        let v = v
            .trim()
            .parse()
            .with_context(|| format!("Parsing sysfs {attr} property"))?;
        tracing::debug!("backfilled {attr} of {} to {v}", self.name);
        Ok(Some(v))
    }

    /// Older versions of util-linux may be missing some properties. Backfill them if they're missing.
    pub fn backfill_missing(&mut self) -> Result<()> {
        if self.start.is_none() {
            self.start = self.read_sysfs_u64("start")?;
        }
        if self.partn.is_none() {
            self.partn = self
                .read_sysfs_u64("partition")?
                .map(u32::try_from)
                .transpose()
                .context("sysfs partition number out of range")?;
        }
        for child in self.children.iter_mut().flatten() {
            child.backfill_missing()?;
        }
        Ok(())
    }

    fn is_partition(&self) -> bool {
        match self.devtype.as_deref() {
            Some(t) => t == "part",
            None => self.partuuid.is_some() || self.partn.is_some(),
        }
    }
}

fn lsblk(dev: Option<&Utf8Path>) -> Result<Vec<Device>> {
    let mut cmd = Command::new("lsblk");
    cmd.args(["-J", "-b", "-O"]);
    if let Some(dev) = dev {
        cmd.arg(dev);
    }
    let mut devs: DevicesOutput = cmd.log_debug().run_and_parse_json()?;
    for dev in devs.blockdevices.iter_mut() {
        dev.backfill_missing()?;
    }
    Ok(devs.blockdevices)
}

#[context("Listing device {dev}")]
pub fn list_dev(dev: &Utf8Path) -> Result<Device> {
    lsblk(Some(dev))?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"))
}

/// All top-level block devices with their children.
#[context("Listing block devices")]
pub fn list_all() -> Result<Vec<Device>> {
    lsblk(None)
}

/// The kind of partition table a disk carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionTableType {
    Gpt,
    Dos,
    Unknown(String),
}

impl PartitionTableType {
    fn from_lsblk(s: &str) -> Self {
        match s {
            "gpt" => Self::Gpt,
            "dos" => Self::Dos,
            o => Self::Unknown(o.to_string()),
        }
    }
}

/// One partition with its geometry expressed in logical blocks of the parent disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub path: Utf8PathBuf,
    pub parent: Utf8PathBuf,
    /// 1-based.
    pub partn: u32,
    pub start_lba: u64,
    pub size_lba: u64,
    pub partuuid: Option<String>,
    pub ptuuid: Option<String>,
    pub pttype: Option<PartitionTableType>,
    pub parttype: Option<String>,
    pub uuid: Option<String>,
    pub fstype: Option<String>,
}

impl PartitionEntry {
    fn from_device(disk: &Device, part: &Device) -> Result<Self> {
        let path = Utf8PathBuf::from(part.path());
        let partn = match part.partn {
            Some(n) => n,
            None => split_partition_name(&part.name)
                .map(|(_, n)| n)
                .ok_or_else(|| anyhow!("Cannot determine partition number of {path}"))?,
        };
        let sector = part
            .log_sec
            .or(disk.log_sec)
            .filter(|&v| v > 0)
            .unwrap_or(DEFAULT_SECTOR_SIZE);
        let start = part
            .start
            .ok_or_else(|| anyhow!("Missing start offset for {path}"))?;
        let ptuuid = part.ptuuid.clone().or_else(|| disk.ptuuid.clone());
        let pttype = part
            .pttype
            .as_deref()
            .or(disk.pttype.as_deref())
            .map(PartitionTableType::from_lsblk);
        Ok(Self {
            parent: Utf8PathBuf::from(disk.path()),
            partn,
            start_lba: start * DEFAULT_SECTOR_SIZE / sector,
            size_lba: part.size / sector,
            partuuid: part.partuuid.as_deref().map(str::to_ascii_lowercase),
            ptuuid: ptuuid.map(|v| v.to_ascii_lowercase()),
            pttype,
            parttype: part.parttype.as_deref().map(str::to_ascii_lowercase),
            uuid: part.uuid.clone(),
            fstype: part.fstype.clone(),
            path,
        })
    }
}

/// Flatten disks into the list of their partitions.
pub fn partitions(devices: &[Device]) -> Result<Vec<PartitionEntry>> {
    let mut r = Vec::new();
    for disk in devices {
        for child in disk.children.iter().flatten() {
            if !child.is_partition() {
                continue;
            }
            r.push(PartitionEntry::from_device(disk, child)?);
        }
    }
    Ok(r)
}

/// Enumerate every partition on the system.
pub fn list_partitions() -> Result<Vec<PartitionEntry>> {
    partitions(&list_all()?)
}

/// Split a kernel partition name such as `nvme0n1p2` into its disk name and
/// partition number. Returns `None` for whole-disk names.
pub fn split_partition_name(name: &str) -> Option<(&str, u32)> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    // Disks whose own name ends in a digit separate the partition with `p`
    let regex = REGEX.get_or_init(|| {
        Regex::new(r"^(?:((?:nvme\d+n\d+|mmcblk\d+|loop\d+))p|(.*\D))(\d+)$")
            .expect("static regex")
    });
    let caps = regex.captures(name)?;
    let disk = caps.get(1).or_else(|| caps.get(2))?.as_str();
    if disk.starts_with("nvme") || disk.starts_with("mmcblk") || disk.starts_with("loop") {
        // e.g. `nvme0n` from `nvme0n1` is not a disk
        if caps.get(1).is_none() {
            return None;
        }
    }
    let partn = caps.get(3)?.as_str().parse().ok()?;
    Some((disk, partn))
}

/// The whole-disk device name for a partition name, or the input itself if it
/// already names a disk.
pub fn disk_of(name: &str) -> &str {
    split_partition_name(name).map_or(name, |(d, _)| d)
}
