//! Frugal installs: a live system's `vmlinuz`, `initrd.gz` and `linuxfs`
//! copied into a directory of an existing filesystem and booted via a GRUB
//! stanza kept next to them in `grub.entry`.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use fn_error_context::context;
use serde::Serialize;

use crate::parsers::grub_menuconfig::parse_grub_menuentry_file;

/// Files that must be present in a frugal install directory.
pub const REQUIRED_FILES: &[&str] = &["vmlinuz", "linuxfs", "grub.entry"];

/// The GRUB stanza describing how to boot the install.
pub const GRUB_ENTRY: &str = "grub.entry";

/// Boot parameter tokens selecting a persistence mode, and the mode each
/// one means. Several legacy spellings map to the same mode.
const PERSISTENCE_TOKENS: &[(&str, &str)] = &[
    ("persist_all", "persist_all"),
    ("persist_root", "persist_root"),
    ("persist_static", "persist_static"),
    ("persist_static_root", "persist_static_root"),
    ("p_static_root", "persist_static_root"),
    ("persist_home", "persist_home"),
    ("frugal_persist", "persist_all"),
    ("frugal_root", "persist_root"),
    ("frugal_static", "persist_static"),
    ("frugal_static_root", "persist_static_root"),
    ("f_static_root", "persist_static_root"),
    ("frugal_home", "persist_home"),
    ("frugal_only", "frugal_only"),
];

/// The canonical persistence modes.
pub const PERSISTENCE_MODES: &[&str] = &[
    "persist_all",
    "persist_root",
    "persist_static",
    "persist_static_root",
    "persist_home",
    "frugal_only",
];

/// The canonical persistence mode a boot parameter selects, if it is one.
pub fn normalize_persistence(token: &str) -> Option<&'static str> {
    PERSISTENCE_TOKENS
        .iter()
        .find(|(t, _)| *t == token)
        .map(|(_, mode)| *mode)
}

/// What a frugal install's `grub.entry` says about it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FrugalInstall {
    /// Menu entry title; the label of its firmware entry.
    pub label: String,
    /// Filesystem UUID of the partition holding the install (`buuid=`).
    pub uuid: Option<String>,
    /// Install directory relative to the partition root (`bdir=`).
    pub bdir: Option<String>,
    /// Canonical persistence mode.
    pub persistence: Option<String>,
    /// Remaining kernel parameters, space separated.
    pub options: String,
    /// Initrd named by the stanza, relative to the partition root.
    pub initrd: Option<String>,
}

impl FrugalInstall {
    /// Interpret the first menuentry of a `grub.entry` file.
    pub fn parse(contents: &str) -> Result<Self> {
        let entries = parse_grub_menuentry_file(contents)?;
        let entry = entries
            .first()
            .ok_or_else(|| anyhow::anyhow!("No menuentry found"))?;
        let mut r = FrugalInstall {
            label: entry.title.trim().to_string(),
            uuid: entry.body.fs_uuid().map(ToOwned::to_owned),
            initrd: entry.body.initrd.map(ToOwned::to_owned),
            ..Default::default()
        };
        let mut options = Vec::new();
        for arg in entry.body.kernel_args() {
            if let Some(bdir) = arg.strip_prefix("bdir=") {
                r.bdir = Some(bdir.to_string());
            } else if let Some(mode) = normalize_persistence(arg) {
                r.persistence = Some(mode.to_string());
            } else if arg.starts_with("buuid=") || arg.ends_with("vmlinuz") {
                // Regenerated from the install's location
            } else {
                options.push(arg);
            }
        }
        r.options = options.join(" ");
        Ok(r)
    }

    /// The kernel command line for booting the install directly: location,
    /// user options, persistence mode, then the `initrd=` arguments.
    pub fn load_options(&self, initrd_args: &str) -> String {
        let location = [
            self.bdir.as_deref().map(|d| format!("bdir={d}")),
            self.uuid.as_deref().map(|u| format!("buuid={u}")),
        ];
        location
            .into_iter()
            .flatten()
            .chain(
                [
                    self.options.as_str(),
                    self.persistence.as_deref().unwrap_or_default(),
                    initrd_args,
                ]
                .into_iter()
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned),
            )
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Files from [`REQUIRED_FILES`] that `dir` lacks.
pub fn missing_files(dir: &Dir) -> Result<Vec<&'static str>> {
    let mut r = Vec::new();
    for name in REQUIRED_FILES {
        if !dir.try_exists(name)? {
            r.push(*name);
        }
    }
    Ok(r)
}

/// Validate and read the frugal install in `path`, which lives `bdir`
/// beneath the root of its partition. A `bdir=` in `grub.entry` wins.
#[context("Reading frugal install in {path}")]
pub fn read_frugal_dir(path: &Utf8Path, bdir: &str) -> Result<FrugalInstall> {
    let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
    let missing = missing_files(&dir)?;
    if !missing.is_empty() {
        anyhow::bail!(
            "Not a frugal install; missing mandatory files: {}",
            missing.join(", ")
        );
    }
    let contents = dir
        .read_to_string(GRUB_ENTRY)
        .with_context(|| format!("Reading {GRUB_ENTRY}"))?;
    let mut r = FrugalInstall::parse(&contents).with_context(|| format!("Parsing {GRUB_ENTRY}"))?;
    if r.bdir.is_none() {
        let bdir = bdir.trim_matches('/');
        r.bdir = (!bdir.is_empty()).then(|| bdir.to_string());
    }
    tracing::debug!("Frugal install '{}' in {path}", r.label);
    Ok(r)
}

/// `mountpoint` joined with a directory given relative to the partition root.
pub fn install_path(mountpoint: &Utf8Path, bdir: &str) -> Utf8PathBuf {
    mountpoint.join(bdir.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use cap_std_ext::cap_tempfile;
    use indoc::indoc;
    use similar_asserts::assert_eq;

    use super::*;

    const ENTRY: &str = indoc! { r#"
        menuentry "antiX-23 frugal" {
            search --no-floppy --set=root --fs-uuid 0a1b2c3d-0000-4000-8000-123456789abc
            linux /antiX-Frugal/vmlinuz bdir=antiX-Frugal buuid=0a1b2c3d-0000-4000-8000-123456789abc quiet lang=de_DE f_static_root
            initrd /antiX-Frugal/initrd.gz
        }
    "# };

    #[test]
    fn test_parse() {
        let f = FrugalInstall::parse(ENTRY).unwrap();
        assert_eq!(
            f,
            FrugalInstall {
                label: "antiX-23 frugal".into(),
                uuid: Some("0a1b2c3d-0000-4000-8000-123456789abc".into()),
                bdir: Some("antiX-Frugal".into()),
                persistence: Some("persist_static_root".into()),
                options: "quiet lang=de_DE".into(),
                initrd: Some("/antiX-Frugal/initrd.gz".into()),
            }
        );
        assert!(FrugalInstall::parse("# nothing").is_err());
    }

    #[test]
    fn test_normalize_persistence() {
        assert_eq!(normalize_persistence("frugal_persist"), Some("persist_all"));
        assert_eq!(normalize_persistence("frugal_only"), Some("frugal_only"));
        assert_eq!(normalize_persistence("quiet"), None);
        for (_, mode) in PERSISTENCE_TOKENS {
            assert!(PERSISTENCE_MODES.contains(mode));
        }
    }

    #[test]
    fn test_load_options() {
        let f = FrugalInstall::parse(ENTRY).unwrap();
        assert_eq!(
            f.load_options("initrd=\\EFI\\antiX\\frugal\\initrd.img"),
            "bdir=antiX-Frugal buuid=0a1b2c3d-0000-4000-8000-123456789abc quiet lang=de_DE persist_static_root initrd=\\EFI\\antiX\\frugal\\initrd.img"
        );
        let bare = FrugalInstall {
            bdir: Some("MX".into()),
            ..Default::default()
        };
        assert_eq!(bare.load_options(""), "bdir=MX");
    }

    #[test]
    fn test_read_frugal_dir() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        td.create_dir("MX-Frugal")?;
        let d = td.open_dir("MX-Frugal")?;
        d.write("vmlinuz", "kernel")?;
        assert_eq!(missing_files(&d)?, vec!["linuxfs", "grub.entry"]);

        d.write("linuxfs", "squashfs")?;
        d.write(GRUB_ENTRY, "menuentry \"MX frugal\" {\n linux /MX-Frugal/vmlinuz quiet\n}\n")?;
        assert!(missing_files(&d)?.is_empty());

        let tmp = tempfile::tempdir()?;
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let path = install_path(root, "/MX-Frugal");
        assert_eq!(path, root.join("MX-Frugal"));
        std::fs::create_dir(&path)?;
        let err = read_frugal_dir(&path, "MX-Frugal").unwrap_err();
        assert!(format!("{err:#}").contains("missing mandatory files: vmlinuz, linuxfs, grub.entry"));

        std::fs::write(path.join("vmlinuz"), "kernel")?;
        std::fs::write(path.join("linuxfs"), "squashfs")?;
        std::fs::write(
            path.join(GRUB_ENTRY),
            "menuentry \"MX frugal\" {\n linux /MX-Frugal/vmlinuz quiet frugal_home\n}\n",
        )?;
        let f = read_frugal_dir(&path, "/MX-Frugal/")?;
        assert_eq!(f.label, "MX frugal");
        // Not in grub.entry, so taken from the location
        assert_eq!(f.bdir.as_deref(), Some("MX-Frugal"));
        assert_eq!(f.persistence.as_deref(), Some("persist_home"));
        assert_eq!(f.options, "quiet");
        assert_eq!(f.uuid, None);
        Ok(())
    }
}
