//! Helpers for interacting with mountpoints

use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use rustix::mount::UnmountFlags;
use serde::Deserialize;

use uefimgr_utils::CommandRunExt;

/// A mounted filesystem as reported by `findmnt`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[allow(missing_docs)]
pub struct Filesystem {
    // Note if you add an entry to this list, you need to change the --output invocation below too
    pub source: String,
    pub target: String,
    #[serde(rename = "maj:min")]
    pub maj_min: Option<String>,
    pub fstype: String,
    pub options: String,
    pub uuid: Option<String>,
    pub children: Option<Vec<Filesystem>>,
}

/// Top-level output of `findmnt -J`.
#[derive(Deserialize, Debug, Default)]
#[allow(missing_docs)]
pub struct Findmnt {
    pub filesystems: Vec<Filesystem>,
}

const FINDMNT_OUTPUT: &str = "SOURCE,TARGET,MAJ:MIN,FSTYPE,OPTIONS,UUID";

/// findmnt exits with this when nothing matched.
const FINDMNT_NO_MATCH: i32 = 1;

fn findmnt_cmd(args: &[&str], path: Option<&str>) -> Command {
    let mut cmd = Command::new("findmnt");
    cmd.args(["-J", "-v", "--output", FINDMNT_OUTPUT])
        .args(args)
        .args(path);
    cmd
}

/// Run `findmnt` with the given extra arguments, failing if nothing matched.
pub fn run_findmnt(args: &[&str], path: Option<&str>) -> Result<Findmnt> {
    let o: Findmnt = findmnt_cmd(args, path).log_debug().run_and_parse_json()?;
    Ok(o)
}

/// Find where (if anywhere) a block device is mounted.
#[context("Finding mount of {source}")]
pub fn find_mount_of_source(source: &Utf8Path) -> Result<Option<Filesystem>> {
    let out = findmnt_cmd(&["-S", source.as_str()], None)
        .log_debug()
        .output()
        .context("Spawning findmnt")?;
    match out.status.code() {
        Some(0) => {}
        Some(FINDMNT_NO_MATCH) => return Ok(None),
        _ => anyhow::bail!(
            "findmnt failed: {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        ),
    }
    let o: Findmnt = serde_json::from_slice(&out.stdout).context("Parsing findmnt output")?;
    Ok(o.filesystems.into_iter().next())
}

/// Mount a block device, letting `mount` detect the filesystem type.
#[context("Mounting {dev} at {target}")]
pub fn mount(dev: &Utf8Path, target: &Utf8Path) -> Result<()> {
    Command::new("mount")
        .args([dev.as_str(), target.as_str()])
        .log_debug()
        .run_capture_stderr()
}

/// Unmount a filesystem.
#[context("Unmounting {target}")]
pub fn unmount(target: &Utf8Path) -> Result<()> {
    tracing::debug!("Unmounting {target}");
    rustix::mount::unmount(target.as_std_path(), UnmountFlags::empty())?;
    Ok(())
}

/// Filesystems mounted on demand beneath a common base directory; they are
/// unmounted and their mountpoints removed on drop, most recent first.
#[derive(Debug)]
pub struct TempMounts {
    base: Utf8PathBuf,
    mounted: Vec<Utf8PathBuf>,
}

impl TempMounts {
    /// Create an empty set rooted at `base`; the directory is created lazily.
    pub fn new(base: impl Into<Utf8PathBuf>) -> Self {
        Self {
            base: base.into(),
            mounted: Vec::new(),
        }
    }

    /// The base directory.
    pub fn base(&self) -> &Utf8Path {
        &self.base
    }

    /// Return a directory where `dev` is mounted, mounting it beneath the base
    /// directory if it is not already mounted somewhere.
    pub fn ensure_mounted(&mut self, dev: &Utf8Path) -> Result<Utf8PathBuf> {
        if let Some(fs) = find_mount_of_source(dev)? {
            tracing::debug!("{dev} already mounted at {}", fs.target);
            return Ok(fs.target.into());
        }
        let name = dev
            .file_name()
            .ok_or_else(|| anyhow!("Invalid device path {dev}"))?;
        let target = self.base.join(name);
        std::fs::create_dir_all(&target).with_context(|| format!("Creating {target}"))?;
        if let Err(e) = mount(dev, &target) {
            let _ = std::fs::remove_dir(&target);
            return Err(e);
        }
        self.mounted.push(target.clone());
        Ok(target)
    }

    /// Unmount everything mounted so far.
    pub fn release(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(target) = self.mounted.pop() {
            let r = unmount(&target).and_then(|()| {
                std::fs::remove_dir(&target).with_context(|| format!("Removing {target}"))
            });
            if let Err(e) = r {
                tracing::warn!("{e:#}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for TempMounts {
    fn drop(&mut self) {
        // Best effort; failures were already logged
        let _ = self.release();
    }
}
