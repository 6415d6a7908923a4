//! External collaborators of the boot entry manager and their system
//! implementations: partition enumeration and mounting, LUKS unlocking, and
//! privilege escalation.

use std::cell::RefCell;
use std::ffi::OsString;
use std::fmt::Debug;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use uuid::Uuid;

use uefimgr_blockdev::luks;
use uefimgr_blockdev::{PartitionEntry, PartitionTableType};
use uefimgr_mount::TempMounts;
use uefimgr_utils::CommandRunExt;

use crate::device_path::DiskSignature;
use crate::resolver::PartitionIdentity;

/// Enumerates partitions and mounts them on request.
pub trait PartitionSource: Debug {
    /// Every partition currently present.
    fn list_partitions(&self) -> Result<Vec<PartitionIdentity>>;
    /// Mount the partition (if needed) and return where.
    fn mount(&self, partition: &PartitionIdentity) -> Result<Utf8PathBuf>;
}

/// Opens encrypted containers.
pub trait Unlocker: Debug {
    /// Unlock `partition`, returning the identity of the unlocked device. A
    /// rejected passphrase is [`crate::Error::WrongPassphrase`].
    fn unlock(
        &self,
        partition: &PartitionIdentity,
        passphrase: Vec<u8>,
    ) -> crate::Result<PartitionIdentity>;
}

/// Result of a command run with elevated privileges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElevatedOutput {
    /// Exit code; -1 if killed by a signal.
    pub code: i32,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl ElevatedOutput {
    /// pkexec exits 126 when authorization is dismissed and 127 when it is
    /// not obtained.
    pub fn elevation_refused(&self) -> bool {
        matches!(self.code, 126 | 127)
    }
}

/// Runs a command line as root.
pub trait Elevator: Debug {
    /// Run `argv` (program first) elevated and wait for it.
    fn run_elevated(&self, argv: &[OsString]) -> Result<ElevatedOutput>;
}

fn identity_from_entry(p: PartitionEntry) -> Result<Option<PartitionIdentity>> {
    let disk = match p.pttype {
        Some(PartitionTableType::Gpt) => {
            let Some(partuuid) = p.partuuid.as_deref() else {
                return Ok(None);
            };
            let guid = Uuid::parse_str(partuuid)
                .with_context(|| format!("Parsing partition GUID of {}", p.path))?;
            DiskSignature::Gpt(guid)
        }
        Some(PartitionTableType::Dos) => {
            let Some(ptuuid) = p.ptuuid.as_deref() else {
                return Ok(None);
            };
            let sig = u32::from_str_radix(ptuuid, 16)
                .with_context(|| format!("Parsing disk signature of {}", p.parent))?;
            DiskSignature::Mbr(sig)
        }
        o => {
            tracing::debug!("Skipping {} with partition table {o:?}", p.path);
            return Ok(None);
        }
    };
    Ok(Some(PartitionIdentity {
        disk,
        partition_number: p.partn,
        filesystem_uuid: p.uuid,
        device: p.path,
        parent: p.parent,
        start: p.start_lba,
        size: p.size_lba,
        fstype: p.fstype,
        parttype: p.parttype,
    }))
}

/// Partitions from `lsblk`, mounted with `mount` beneath a private directory
/// and unmounted again on drop.
#[derive(Debug)]
pub struct SystemPartitions {
    mounts: RefCell<TempMounts>,
}

impl SystemPartitions {
    /// Mount on demand beneath `mount_base`.
    pub fn new(mount_base: &Utf8Path) -> Self {
        Self {
            mounts: RefCell::new(TempMounts::new(mount_base)),
        }
    }
}

impl PartitionSource for SystemPartitions {
    #[context("Enumerating partitions")]
    fn list_partitions(&self) -> Result<Vec<PartitionIdentity>> {
        let mut r = Vec::new();
        for p in uefimgr_blockdev::list_partitions()? {
            r.extend(identity_from_entry(p)?);
        }
        Ok(r)
    }

    fn mount(&self, partition: &PartitionIdentity) -> Result<Utf8PathBuf> {
        self.mounts.borrow_mut().ensure_mounted(&partition.device)
    }
}

/// Unlocks LUKS containers with `cryptsetup`; mappings it created are closed
/// on drop, so it must outlive any mounts of them.
#[derive(Debug, Default)]
pub struct CryptsetupUnlocker {
    opened: RefCell<Vec<String>>,
}

impl CryptsetupUnlocker {
    /// A new unlocker with no open mappings.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Unlocker for CryptsetupUnlocker {
    fn unlock(
        &self,
        partition: &PartitionIdentity,
        passphrase: Vec<u8>,
    ) -> crate::Result<PartitionIdentity> {
        let dev = &partition.device;
        if !luks::is_luks(dev)? {
            return Err(anyhow::anyhow!("{dev} is not a LUKS device").into());
        }
        let mapping = match luks::open(dev, passphrase)? {
            Ok(m) => m,
            Err(luks::BadPassphrase) => return Err(crate::Error::WrongPassphrase(dev.to_string())),
        };
        if mapping.created {
            self.opened.borrow_mut().push(mapping.name.clone());
        }
        let inner = uefimgr_blockdev::list_dev(&mapping.path)?;
        Ok(PartitionIdentity {
            device: mapping.path,
            filesystem_uuid: inner.uuid,
            fstype: inner.fstype,
            ..partition.clone()
        })
    }
}

impl Drop for CryptsetupUnlocker {
    fn drop(&mut self) {
        for name in self.opened.get_mut().drain(..).rev() {
            if let Err(e) = luks::close(&name) {
                tracing::warn!("{e:#}");
            }
        }
    }
}

/// Elevates through the first available of a list of helpers such as
/// `pkexec` or `gksu`.
#[derive(Debug)]
pub struct PkexecElevator {
    program: Utf8PathBuf,
}

fn find_in_path(program: &str) -> Option<Utf8PathBuf> {
    if program.contains('/') {
        let p = Utf8PathBuf::from(program);
        return p.exists().then_some(p);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .filter_map(|d| Utf8PathBuf::from_path_buf(d).ok())
        .map(|d| d.join(program))
        .find(|p| p.is_file())
}

impl PkexecElevator {
    /// Use the first of `candidates` found in `$PATH`.
    pub fn detect<S: AsRef<str>>(candidates: &[S]) -> Option<Self> {
        let program = candidates
            .iter()
            .find_map(|c| find_in_path(c.as_ref()))?;
        tracing::debug!("Using {program} for elevation");
        Some(Self { program })
    }

    /// The helper in use.
    pub fn program(&self) -> &Utf8Path {
        &self.program
    }
}

impl Elevator for PkexecElevator {
    fn run_elevated(&self, argv: &[OsString]) -> Result<ElevatedOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(argv);
        let out = cmd
            .log_debug()
            .output()
            .with_context(|| format!("Spawning {}", self.program))?;
        Ok(ElevatedOutput {
            code: out.status.code().unwrap_or(-1),
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }
}
