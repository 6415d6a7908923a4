//! Opening LUKS containers with `cryptsetup`.

use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use uefimgr_utils::CommandRunExt;

/// `cryptsetup` exits with this code when no key slot matched.
const EXIT_BAD_PASSPHRASE: i32 = 2;

/// Byte pattern written over passphrase buffers once they are no longer needed.
const SCRUB_BYTE: u8 = 0xA5;

const MAPPER_DIR: &str = "/dev/mapper";

/// The passphrase did not unlock any key slot.
#[derive(Debug)]
pub struct BadPassphrase;

/// An open device-mapper mapping of a LUKS container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// `luks-<uuid>`.
    pub name: String,
    /// `/dev/mapper/<name>`.
    pub path: Utf8PathBuf,
    /// False if the mapping already existed and was reused.
    pub created: bool,
}

/// The outer error is an operational failure; the inner one a rejected passphrase.
pub type OpenResult = Result<std::result::Result<Mapping, BadPassphrase>>;

/// Whether the device carries a LUKS header.
pub fn is_luks(dev: &Utf8Path) -> Result<bool> {
    let st = Command::new("cryptsetup")
        .args(["isLuks", dev.as_str()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("Spawning cryptsetup")?;
    Ok(st.success())
}

/// The LUKS header UUID of a device.
#[context("Reading LUKS UUID of {dev}")]
pub fn luks_uuid(dev: &Utf8Path) -> Result<String> {
    let uuid = Command::new("cryptsetup")
        .args(["luksUUID", dev.as_str()])
        .run_get_string()?;
    let uuid = uuid.trim();
    if uuid.is_empty() {
        anyhow::bail!("Empty LUKS UUID");
    }
    Ok(uuid.to_string())
}

/// The device-mapper name used for a container: `luks-<uuid>`.
pub fn mapping_name(uuid: &str) -> String {
    format!("luks-{uuid}")
}

/// Overwrite a secret in place.
pub fn scrub(buf: &mut [u8]) {
    buf.fill(SCRUB_BYTE);
    let _ = std::hint::black_box(buf);
}

/// Open the container on `dev`, returning the mapped device path. An existing
/// mapping for the same container is reused without asking for the passphrase.
///
/// The passphrase buffer is scrubbed before returning, whatever the outcome.
#[context("Opening LUKS device {dev}")]
pub fn open(dev: &Utf8Path, mut passphrase: Vec<u8>) -> OpenResult {
    let r = open_impl(dev, &passphrase);
    scrub(&mut passphrase);
    r
}

fn open_impl(dev: &Utf8Path, passphrase: &[u8]) -> OpenResult {
    let name = mapping_name(&luks_uuid(dev)?);
    let path = Utf8Path::new(MAPPER_DIR).join(&name);
    if path.try_exists()? {
        tracing::debug!("Reusing existing mapping {path}");
        return Ok(Ok(Mapping {
            name,
            path,
            created: false,
        }));
    }
    let mut input = passphrase.to_vec();
    let out = Command::new("cryptsetup")
        .args(["luksOpen", "--allow-discards", dev.as_str(), name.as_str(), "-"])
        .log_debug()
        .run_with_input(&input);
    scrub(&mut input);
    let out = out?;
    match out.status.code() {
        Some(0) => {
            tracing::debug!("Opened {dev} as {path}");
            Ok(Ok(Mapping {
                name,
                path,
                created: true,
            }))
        }
        Some(EXIT_BAD_PASSPHRASE) => Ok(Err(BadPassphrase)),
        _ => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            anyhow::bail!("cryptsetup failed: {}: {}", out.status, stderr.trim())
        }
    }
}

/// Close a mapping created by [`open`].
#[context("Closing {name}")]
pub fn close(name: &str) -> Result<()> {
    Command::new("cryptsetup")
        .args(["close", name])
        .log_debug()
        .run_capture_stderr()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub() {
        let mut secret = b"hunter2".to_vec();
        scrub(&mut secret);
        assert!(secret.iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn test_mapping_name() {
        assert_eq!(
            mapping_name("b7a1c2d3-e4f5-4061-8728-394a5b6c7d8e"),
            "luks-b7a1c2d3-e4f5-4061-8728-394a5b6c7d8e"
        );
    }
}
