//! Installing a kernel as an EFI stub: the kernel and its initrds are copied
//! to `EFI/<distro>/<stub|frugal>/` on the ESP and booted directly by the
//! firmware, with the command line stored as the entry's load options.

use std::cmp::Ordering;
use std::fmt::Debug;
use std::io;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use regex::Regex;
use serde::Serialize;

use crate::device_path::encode_ucs2;
use crate::efivars::VariableStore;
use crate::load_option::BootEntry;
use crate::registry::Registry;
use crate::resolver::{PartitionIdentity, Resolver};

/// Distribution name used when none can be determined.
pub const FALLBACK_DISTRO: &str = "Linux";

/// Where the kernel comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StubKind {
    /// An installed system's `/boot`.
    Stub,
    /// A frugal install directory.
    Frugal,
}

impl StubKind {
    /// Subdirectory of `EFI/<distro>` the files go to.
    pub fn dir_name(self) -> &'static str {
        match self {
            StubKind::Stub => "stub",
            StubKind::Frugal => "frugal",
        }
    }
}

/// A directory holding a kernel and initrd to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubSource {
    /// The directory.
    pub dir: Utf8PathBuf,
    /// How files in it are named.
    pub kind: StubKind,
    /// Kernel version for `vmlinuz-<version>` style names.
    pub kernel_version: Option<String>,
}

/// Files placed on the ESP, as firmware paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstalledStub {
    /// The kernel, e.g. `\EFI\MX\stub\vmlinuz`.
    pub loader: String,
    /// Initrds in load order, microcode first.
    pub initrds: Vec<String>,
}

impl InstalledStub {
    /// `initrd=` kernel arguments for every initrd.
    pub fn initrd_args(&self) -> String {
        self.initrds
            .iter()
            .map(|i| format!("initrd={i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Copies loader files onto an ESP.
pub trait StubInstaller: Debug {
    /// Install from `source` into the ESP mounted at `esp`.
    fn install(&self, esp: &Utf8Path, distro: &str, source: &StubSource) -> Result<InstalledStub>;
}

/// One file to install: candidate source names in order of preference and
/// the name on the ESP.
struct Payload {
    candidates: Vec<String>,
    target: &'static str,
    optional: bool,
}

fn payloads(kind: StubKind, version: Option<&str>) -> Vec<Payload> {
    let (kernel, initrd) = match (kind, version) {
        (StubKind::Frugal, _) => (vec!["vmlinuz".to_string()], vec!["initrd.gz".to_string()]),
        (StubKind::Stub, Some(v)) => (
            vec![format!("vmlinuz-{v}")],
            vec![format!("initrd.img-{v}"), format!("initramfs-{v}.img")],
        ),
        (StubKind::Stub, None) => (
            vec!["vmlinuz".to_string()],
            vec!["initrd.img".to_string()],
        ),
    };
    // Arch names its kernel and initramfs after the package
    let with_fallback = |mut v: Vec<String>, fallback: &str| {
        v.push(fallback.to_string());
        v
    };
    vec![
        Payload {
            candidates: with_fallback(kernel, "vmlinuz-linux"),
            target: "vmlinuz",
            optional: false,
        },
        Payload {
            candidates: vec!["amd-ucode.img".into()],
            target: "amducode.img",
            optional: true,
        },
        Payload {
            candidates: vec!["intel-ucode.img".into()],
            target: "intucode.img",
            optional: true,
        },
        Payload {
            candidates: with_fallback(initrd, "initramfs-linux.img"),
            target: "initrd.img",
            optional: false,
        },
    ]
}

fn free_space(path: &Utf8Path) -> Result<u64> {
    let st = rustix::fs::statvfs(path.as_std_path()).with_context(|| format!("statvfs {path}"))?;
    Ok(st.f_bavail.saturating_mul(st.f_frsize))
}

/// Copies with `cap-std`, replacing each file atomically.
#[derive(Debug, Default)]
pub struct EspStubInstaller {
    /// Skip the free space check.
    pub skip_space_check: bool,
}

impl StubInstaller for EspStubInstaller {
    #[context("Installing {} from {} to {esp}", source.kind.dir_name(), source.dir)]
    fn install(&self, esp: &Utf8Path, distro: &str, source: &StubSource) -> Result<InstalledStub> {
        let src = Dir::open_ambient_dir(&source.dir, cap_std::ambient_authority())?;
        let mut files = Vec::new();
        for p in payloads(source.kind, source.kernel_version.as_deref()) {
            let mut found = None;
            for c in &p.candidates {
                if let Some(f) = src.open_optional(c)? {
                    found = Some((c.clone(), f));
                    break;
                }
            }
            match found {
                Some((name, f)) => files.push((name, f, p.target)),
                None if p.optional => {}
                None => anyhow::bail!(
                    "None of {} found in {}",
                    p.candidates.join(", "),
                    source.dir
                ),
            }
        }

        let needed = files.iter().try_fold(0u64, |acc, (_, f, _)| {
            f.metadata().map(|m| acc.saturating_add(m.len()))
        })?;
        if !self.skip_space_check {
            let available = free_space(esp)?;
            if needed > available {
                anyhow::bail!("Not enough space on ESP: {needed} bytes needed, {available} available");
            }
        }

        let esp_dir = Dir::open_ambient_dir(esp, cap_std::ambient_authority())?;
        let subdir = format!("EFI/{distro}/{}", source.kind.dir_name());
        esp_dir.create_dir_all(&subdir)?;
        let target = esp_dir.open_dir(&subdir)?;
        let firmware_dir = format!("\\EFI\\{distro}\\{}", source.kind.dir_name());
        let mut installed = InstalledStub {
            loader: String::new(),
            initrds: Vec::new(),
        };
        // Leftovers from an earlier install would otherwise go unused
        for p in payloads(source.kind, None).iter().filter(|p| p.optional) {
            if !files.iter().any(|(_, _, t)| *t == p.target) && target.remove_file_optional(p.target)? {
                tracing::debug!("Removed stale {subdir}/{}", p.target);
            }
        }
        for (name, mut f, target_name) in files {
            tracing::debug!("Copying {name} to {subdir}/{target_name}");
            target
                .atomic_replace_with(target_name, |w| io::copy(&mut f, w))
                .with_context(|| format!("Copying {name}"))?;
            let path = format!("{firmware_dir}\\{target_name}");
            if target_name == "vmlinuz" {
                installed.loader = path;
            } else {
                installed.initrds.push(path);
            }
        }
        tracing::info!("Installed {} to {esp}/{subdir}", installed.loader);
        Ok(installed)
    }
}

/// Command line for a stub install: user options then `initrd=` arguments.
pub fn stub_load_options(options: &str, stub: &InstalledStub) -> String {
    [options.trim(), stub.initrd_args().as_str()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Kernel arguments for booting the root filesystem under `root`: `root=`
/// from its UUID plus `GRUB_CMDLINE_LINUX` and `GRUB_CMDLINE_LINUX_DEFAULT`
/// from `/etc/default/grub`.
pub fn fallback_options(root: &Dir, root_uuid: Option<&str>) -> String {
    let mut r: Vec<String> = root_uuid.map(|u| format!("root=UUID={u}")).into_iter().collect();
    let grub = root.read_to_string("etc/default/grub").unwrap_or_default();
    for key in ["GRUB_CMDLINE_LINUX=", "GRUB_CMDLINE_LINUX_DEFAULT="] {
        let value = grub
            .lines()
            .find_map(|l| l.trim().strip_prefix(key))
            .map(|v| v.trim().trim_matches(|c| c == '"' || c == '\'').trim());
        if let Some(v) = value.filter(|v| !v.is_empty()) {
            r.push(v.to_string());
        }
    }
    r.join(" ")
}

/// Order two kernel versions (or file names containing one) oldest first.
/// Names without a version sort after all versioned ones.
pub fn compare_kernel_versions(a: &str, b: &str) -> Ordering {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| {
        Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?(-([a-z0-9]+[^-]*)?)?(-.*)?").expect("static regex")
    });
    let key = |s: &str| {
        regex.captures(s).map(|c| {
            let num = |i: usize| {
                c.get(i)
                    .map_or(0, |m| m.as_str().parse::<u64>().unwrap_or(u64::MAX))
            };
            let suffix = c.get(4).map_or("", |m| m.as_str()).to_string();
            (num(1), num(2), num(3), suffix)
        })
    };
    match (key(a), key(b)) {
        (Some(ka), Some(kb)) => ka.cmp(&kb),
        (None, None) => a.cmp(b),
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
    }
}

/// Sort kernel versions in place, newest first when `newest_first` is set.
pub fn sort_kernel_versions(versions: &mut [String], newest_first: bool) {
    if newest_first {
        versions.sort_by(|a, b| compare_kernel_versions(b, a));
    } else {
        versions.sort_by(|a, b| compare_kernel_versions(a, b));
    }
}

/// Versions of the `vmlinuz-<version>` kernels in `boot`, newest first.
#[context("Listing kernels")]
pub fn kernel_versions(boot: &Dir) -> Result<Vec<String>> {
    let mut r = Vec::new();
    for entry in boot.entries()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if let Some(v) = name.strip_prefix("vmlinuz-").filter(|v| !v.is_empty()) {
            r.push(v.to_string());
        }
    }
    sort_kernel_versions(&mut r, true);
    Ok(r)
}

/// The release of the running kernel, as `uname -r` prints it.
pub fn running_kernel() -> Option<String> {
    rustix::system::uname()
        .release()
        .to_str()
        .ok()
        .map(str::to_owned)
}

/// The kernel to install from `boot`: `running` if it is there, else the
/// newest one. `None` when `boot` has no versioned kernels.
pub fn select_kernel(boot: &Dir, running: Option<&str>) -> Result<Option<String>> {
    let versions = kernel_versions(boot)?;
    if let Some(v) = running.filter(|r| versions.iter().any(|v| v == r)) {
        return Ok(Some(v.to_string()));
    }
    Ok(versions.into_iter().next())
}

/// Arguments of the first `linux` line in `grub/grub.cfg` under `boot` that
/// loads `<kernel_dir>/<vmlinuz>` with a `root=` matching one of
/// `root_patterns`.
pub fn grub_cfg_options(
    boot: &Dir,
    kernel_dir: &str,
    vmlinuz: &str,
    root_patterns: &[String],
) -> Option<String> {
    let cfg = boot.read_to_string("grub/grub.cfg").ok()?;
    let wanted = format!("{kernel_dir}/{vmlinuz}");
    let roots: Vec<String> = root_patterns
        .iter()
        .map(|p| format!("root={}", p.to_lowercase()))
        .collect();
    cfg.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix("linux")?;
        if !rest.starts_with(char::is_whitespace) {
            return None;
        }
        let rest = rest.trim_start();
        let (path, args) = rest.split_once(char::is_whitespace)?;
        // btrfs installs prefix the subvolume
        let path = path.strip_prefix("/@").unwrap_or(path);
        if path != wanted {
            return None;
        }
        let lower = args.to_lowercase();
        roots
            .iter()
            .any(|r| lower.contains(r.as_str()))
            .then(|| args.trim().to_string())
    })
}

/// Load options are passed to the kernel as a NUL-terminated UCS-2 string.
pub fn encode_load_options(options: &str) -> Vec<u8> {
    let mut r = Vec::new();
    encode_ucs2(options, &mut r);
    r
}

/// The `ID=` of the os-release file under `root`.
pub fn distro_id(root: &Dir) -> String {
    let contents = ["etc/os-release", "usr/lib/os-release"]
        .into_iter()
        .find_map(|p| root.read_to_string(p).ok());
    contents
        .as_deref()
        .and_then(|c| {
            c.lines()
                .find_map(|l| l.strip_prefix("ID="))
                .map(|v| v.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| FALLBACK_DISTRO.to_string())
}

/// Create the firmware entry for an installed stub on `esp`.
pub fn register_stub<S: VariableStore>(
    registry: &mut Registry<S>,
    esp: &PartitionIdentity,
    label: &str,
    stub: &InstalledStub,
    load_options: &str,
) -> crate::Result<BootEntry> {
    let device_path = Resolver::build(esp, &stub.loader);
    registry.add(label, device_path, Some(encode_load_options(load_options)))
}
