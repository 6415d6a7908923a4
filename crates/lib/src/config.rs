//! Configuration loaded from `uefi-manager/config.d/*.toml` drop-ins.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::efivars::EFIVARFS;

/// Directories searched for drop-ins, lowest priority first.
const CONFIG_BASES: &[&str] = &["/usr/lib", "/usr/local/lib", "/etc", "/run"];

const CONFIG_SUBDIR: &str = "uefi-manager/config.d";

/// Where partitions are mounted on demand.
pub const DEFAULT_MOUNT_BASE: &str = "/mnt/uefi-manager";

/// Helpers tried in order to run a command as root.
pub const DEFAULT_ELEVATION: &[&str] = &["pkexec", "gksu"];

/// Top level of a drop-in file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct ConfigToplevel {
    manager: Option<ManagerConfig>,
}

/// The `[manager]` table. Every key is optional; later drop-ins override
/// keys set by earlier ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ManagerConfig {
    /// efivarfs mountpoint.
    pub efivars: Option<Utf8PathBuf>,
    /// Where partitions are mounted on demand.
    pub mount_base: Option<Utf8PathBuf>,
    /// Elevation helpers, first found wins.
    pub elevation: Option<Vec<String>>,
    /// Directory name under `EFI/` for installed stubs.
    pub distro: Option<String>,
}

impl ManagerConfig {
    /// Override every key `other` sets.
    pub fn merge(&mut self, other: ManagerConfig) {
        fn set<T>(dst: &mut Option<T>, src: Option<T>) {
            if let Some(v) = src {
                *dst = Some(v);
            }
        }
        set(&mut self.efivars, other.efivars);
        set(&mut self.mount_base, other.mount_base);
        set(&mut self.elevation, other.elevation);
        set(&mut self.distro, other.distro);
    }

    /// The efivarfs mountpoint.
    pub fn efivars(&self) -> Utf8PathBuf {
        self.efivars.clone().unwrap_or_else(|| EFIVARFS.into())
    }

    /// Where partitions are mounted on demand.
    pub fn mount_base(&self) -> Utf8PathBuf {
        self.mount_base
            .clone()
            .unwrap_or_else(|| DEFAULT_MOUNT_BASE.into())
    }

    /// Elevation helpers to try.
    pub fn elevation(&self) -> Vec<String> {
        self.elevation
            .clone()
            .unwrap_or_else(|| DEFAULT_ELEVATION.iter().map(|s| s.to_string()).collect())
    }
}

fn parse_fragment(buf: &str) -> Result<Option<ManagerConfig>> {
    let c: ConfigToplevel = toml::from_str(buf)?;
    Ok(c.manager)
}

/// Merge the drop-ins found beneath `bases`. Fragments are applied in
/// lexical order of file name; a name in a later base shadows the same
/// name in an earlier one.
#[context("Loading configuration")]
pub fn load_config_from<S: AsRef<str>>(bases: &[S]) -> Result<ManagerConfig> {
    let bases = bases.iter().map(|b| b.as_ref());
    let fragments = liboverdrop::scan(bases, CONFIG_SUBDIR, &["toml"], true);
    let mut config = ManagerConfig::default();
    for (_name, path) in fragments {
        let buf = std::fs::read_to_string(&path)?;
        let Some(c) = parse_fragment(&buf).with_context(|| format!("Parsing {path:?}"))? else {
            continue;
        };
        tracing::debug!("Loaded config from {path:?}");
        config.merge(c);
    }
    Ok(config)
}

/// Merge the drop-ins from the standard locations.
pub fn load_config() -> Result<ManagerConfig> {
    load_config_from(CONFIG_BASES)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_defaults() {
        let c = ManagerConfig::default();
        assert_eq!(c.efivars(), EFIVARFS);
        assert_eq!(c.mount_base(), DEFAULT_MOUNT_BASE);
        assert_eq!(c.elevation(), vec!["pkexec", "gksu"]);
        assert_eq!(c.distro, None);
    }

    #[test]
    fn test_parse() {
        let c = parse_fragment(indoc! { r#"
            [manager]
            mount-base = "/run/uefi-manager"
            elevation = ["pkexec"]
        "# })
        .unwrap()
        .unwrap();
        assert_eq!(c.mount_base(), "/run/uefi-manager");
        assert_eq!(c.elevation(), vec!["pkexec"]);
        assert_eq!(parse_fragment("").unwrap(), None);
        assert!(parse_fragment("[manager]\nunknown = 1\n").is_err());
        assert!(parse_fragment("[other]\n").is_err());
    }

    #[test]
    fn test_load_config_from() -> Result<()> {
        let td = tempfile::tempdir()?;
        let base = |name: &str| -> Result<String> {
            let p = td.path().join(name);
            std::fs::create_dir_all(p.join(CONFIG_SUBDIR))?;
            Ok(p.to_str().unwrap().to_string())
        };
        let usr = base("usr")?;
        let etc = base("etc")?;
        let write = |dir: &str, name: &str, contents: &str| {
            std::fs::write(
                std::path::Path::new(dir).join(CONFIG_SUBDIR).join(name),
                contents,
            )
        };
        write(&usr, "10-base.toml", "[manager]\ndistro = \"MX\"\nmount-base = \"/a\"\n")?;
        write(&usr, "20-more.toml", "[manager]\nmount-base = \"/b\"\n")?;
        // Shadows the vendor file of the same name entirely
        write(&etc, "20-more.toml", "[manager]\nefivars = \"/tmp/efivars\"\n")?;
        write(&etc, "ignored.conf", "not toml")?;

        let c = load_config_from(&[usr.as_str(), etc.as_str()])?;
        assert_eq!(c.distro.as_deref(), Some("MX"));
        assert_eq!(c.mount_base(), "/a");
        assert_eq!(c.efivars(), "/tmp/efivars");

        write(&etc, "30-bad.toml", "[manager\n")?;
        assert!(load_config_from(&[usr, etc]).is_err());
        Ok(())
    }
}
