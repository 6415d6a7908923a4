//! Access to firmware variables in the EFI global namespace.
//!
//! The [`VariableStore`] trait is the only way the rest of the crate touches
//! firmware state; [`EfivarfsStore`] is the real implementation on Linux and
//! [`MemoryStore`] an in-memory stand-in.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use rustix::fs::IFlags;
use rustix::io::Errno;

use crate::errors::{Error, Result};
use crate::load_option::BootId;

/// Vendor GUID of the EFI global variable namespace.
pub const EFI_GLOBAL_VARIABLE_GUID: &str = "8be4df61-93ca-11d2-aa0d-00e098032b8c";

/// Default efivarfs mountpoint.
pub const EFIVARFS: &str = "/sys/firmware/efi/efivars";

const EFI_VARIABLE_NON_VOLATILE: u32 = 0x1;
const EFI_VARIABLE_BOOTSERVICE_ACCESS: u32 = 0x2;
const EFI_VARIABLE_RUNTIME_ACCESS: u32 = 0x4;
const DEFAULT_ATTRIBUTES: u32 =
    EFI_VARIABLE_NON_VOLATILE | EFI_VARIABLE_BOOTSERVICE_ACCESS | EFI_VARIABLE_RUNTIME_ACCESS;
const ATTRIBUTE_HEADER_LEN: usize = 4;

/// Name of a variable in the global namespace, e.g. `BootOrder`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableName(String);

impl VariableName {
    /// Wrap an arbitrary name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// `Boot####` for an entry.
    pub fn boot_entry(id: BootId) -> Self {
        Self(format!("Boot{id}"))
    }

    /// `BootOrder`.
    pub fn boot_order() -> Self {
        Self::new("BootOrder")
    }

    /// `BootNext`.
    pub fn boot_next() -> Self {
        Self::new("BootNext")
    }

    /// `BootCurrent`.
    pub fn boot_current() -> Self {
        Self::new("BootCurrent")
    }

    /// `Timeout`.
    pub fn timeout() -> Self {
        Self::new("Timeout")
    }

    /// The name as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The entry id if this names a boot entry. Firmware only recognizes
    /// uppercase hex digits.
    pub fn boot_entry_id(&self) -> Option<BootId> {
        let digits = self.0.strip_prefix("Boot")?;
        if digits.len() != 4
            || !digits
                .chars()
                .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
        {
            return None;
        }
        u16::from_str_radix(digits, 16).ok().map(BootId)
    }
}

impl Display for VariableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A store of named firmware variables. Each call is a single, independent
/// operation on one variable; there is no caching.
pub trait VariableStore: fmt::Debug {
    /// All variable names, sorted.
    fn list(&self) -> Result<Vec<VariableName>>;
    /// Read a variable's data.
    fn read(&self, name: &VariableName) -> Result<Vec<u8>>;
    /// Create or replace a variable.
    fn write(&mut self, name: &VariableName, data: &[u8]) -> Result<()>;
    /// Delete a variable.
    fn delete(&mut self, name: &VariableName) -> Result<()>;

    /// Read a variable, mapping absence to `None`.
    fn read_optional(&self, name: &VariableName) -> Result<Option<Vec<u8>>> {
        match self.read(name) {
            Ok(v) => Ok(Some(v)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn map_io(name: &VariableName, e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound(name.to_string()),
        io::ErrorKind::PermissionDenied => Error::PermissionDenied(name.to_string()),
        _ => Error::Io {
            name: name.to_string(),
            source: e,
        },
    }
}

/// Variables exposed by the kernel's efivarfs.
#[derive(Debug)]
pub struct EfivarfsStore {
    root: Utf8PathBuf,
}

impl EfivarfsStore {
    /// Use the efivarfs mounted at `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The mountpoint.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, name: &VariableName) -> Utf8PathBuf {
        self.root.join(format!("{name}-{EFI_GLOBAL_VARIABLE_GUID}"))
    }

    /// The kernel marks most variables immutable to protect against stray
    /// `rm -rf`; lift that before modifying one. Filesystems without inode
    /// flags are fine as-is.
    fn make_mutable(&self, name: &VariableName, path: &Utf8Path) -> Result<()> {
        let f = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(map_io(name, e)),
        };
        let flags = match rustix::fs::ioctl_getflags(&f) {
            Ok(flags) => flags,
            Err(Errno::NOTTY | Errno::OPNOTSUPP | Errno::INVAL) => return Ok(()),
            Err(e) => return Err(map_io(name, e.into())),
        };
        if flags.contains(IFlags::IMMUTABLE) {
            tracing::debug!("Clearing immutable flag on {name}");
            rustix::fs::ioctl_setflags(&f, flags - IFlags::IMMUTABLE)
                .map_err(|e| map_io(name, e.into()))?;
        }
        Ok(())
    }
}

impl VariableStore for EfivarfsStore {
    fn list(&self) -> Result<Vec<VariableName>> {
        let suffix = format!("-{EFI_GLOBAL_VARIABLE_GUID}");
        let rootname = VariableName::new(self.root.as_str());
        let mut r = Vec::new();
        for ent in self.root.read_dir_utf8().map_err(|e| map_io(&rootname, e))? {
            let ent = ent.map_err(|e| map_io(&rootname, e))?;
            if let Some(name) = ent.file_name().strip_suffix(&suffix) {
                r.push(VariableName::new(name));
            }
        }
        r.sort();
        Ok(r)
    }

    fn read(&self, name: &VariableName) -> Result<Vec<u8>> {
        let mut buf = std::fs::read(self.path(name)).map_err(|e| map_io(name, e))?;
        if buf.len() < ATTRIBUTE_HEADER_LEN {
            return Err(Error::CorruptEntry {
                name: name.to_string(),
                reason: "shorter than the attribute header".into(),
            });
        }
        tracing::trace!("Read {name}: {} bytes", buf.len() - ATTRIBUTE_HEADER_LEN);
        Ok(buf.split_off(ATTRIBUTE_HEADER_LEN))
    }

    fn write(&mut self, name: &VariableName, data: &[u8]) -> Result<()> {
        let path = self.path(name);
        self.make_mutable(name, &path)?;
        let mut buf = Vec::with_capacity(ATTRIBUTE_HEADER_LEN + data.len());
        buf.extend_from_slice(&DEFAULT_ATTRIBUTES.to_le_bytes());
        buf.extend_from_slice(data);
        // efivarfs requires the whole variable in one write(2), and truncating
        // an existing variable would delete it
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| map_io(name, e))?;
        let n = f.write(&buf).map_err(|e| map_io(name, e))?;
        if n != buf.len() {
            return Err(map_io(
                name,
                io::Error::new(io::ErrorKind::WriteZero, format!("short write ({n} bytes)")),
            ));
        }
        tracing::debug!("Wrote {name}: {} bytes", data.len());
        Ok(())
    }

    fn delete(&mut self, name: &VariableName) -> Result<()> {
        let path = self.path(name);
        self.make_mutable(name, &path)?;
        std::fs::remove_file(&path).map_err(|e| map_io(name, e))?;
        tracing::debug!("Deleted {name}");
        Ok(())
    }
}

/// A mutation recorded by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// A successful write.
    Write(VariableName),
    /// A successful delete.
    Delete(VariableName),
}

/// An in-memory variable store with deterministic failure injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    vars: BTreeMap<VariableName, Vec<u8>>,
    failing: BTreeSet<VariableName>,
    failing_deletes: BTreeSet<VariableName>,
    fail_all: bool,
    deny: bool,
    ops: Vec<StoreOp>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a variable without recording an operation.
    pub fn with_variable(mut self, name: VariableName, data: impl Into<Vec<u8>>) -> Self {
        self.vars.insert(name, data.into());
        self
    }

    /// Make writes and deletes of `name` fail with an I/O error.
    pub fn fail_writes_to(&mut self, name: VariableName) {
        self.failing.insert(name);
    }

    /// Make only deletes of `name` fail with an I/O error.
    pub fn fail_deletes_to(&mut self, name: VariableName) {
        self.failing_deletes.insert(name);
    }

    /// Make every write and delete fail with an I/O error.
    pub fn fail_all_writes(&mut self) {
        self.fail_all = true;
    }

    /// Make every write and delete fail with `PermissionDenied`.
    pub fn deny_writes(&mut self) {
        self.deny = true;
    }

    /// Remove all injected failures.
    pub fn clear_failures(&mut self) {
        self.failing.clear();
        self.failing_deletes.clear();
        self.fail_all = false;
        self.deny = false;
    }

    /// Successful mutations so far.
    pub fn operations(&self) -> &[StoreOp] {
        &self.ops
    }

    /// Direct access to a variable's data.
    pub fn get(&self, name: &VariableName) -> Option<&[u8]> {
        self.vars.get(name).map(Vec::as_slice)
    }

    fn check_writable(&self, name: &VariableName) -> Result<()> {
        if self.deny {
            return Err(Error::PermissionDenied(name.to_string()));
        }
        if self.fail_all || self.failing.contains(name) {
            return Err(Error::Io {
                name: name.to_string(),
                source: io::Error::other("injected failure"),
            });
        }
        Ok(())
    }
}

impl VariableStore for MemoryStore {
    fn list(&self) -> Result<Vec<VariableName>> {
        Ok(self.vars.keys().cloned().collect())
    }

    fn read(&self, name: &VariableName) -> Result<Vec<u8>> {
        self.vars
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    fn write(&mut self, name: &VariableName, data: &[u8]) -> Result<()> {
        self.check_writable(name)?;
        self.vars.insert(name.clone(), data.to_vec());
        self.ops.push(StoreOp::Write(name.clone()));
        Ok(())
    }

    fn delete(&mut self, name: &VariableName) -> Result<()> {
        self.check_writable(name)?;
        if self.failing_deletes.contains(name) {
            return Err(Error::Io {
                name: name.to_string(),
                source: io::Error::other("injected delete failure"),
            });
        }
        if self.vars.remove(name).is_none() {
            return Err(Error::NotFound(name.to_string()));
        }
        self.ops.push(StoreOp::Delete(name.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_names() {
        assert_eq!(VariableName::boot_entry(BootId(0x2b)).as_str(), "Boot002B");
        assert_eq!(
            VariableName::new("Boot002B").boot_entry_id(),
            Some(BootId(0x2b))
        );
        for other in ["BootOrder", "BootNext", "Boot002b", "Boot02B", "Boot0002B", "Timeout"] {
            assert_eq!(VariableName::new(other).boot_entry_id(), None, "{other}");
        }
    }

    fn tmp_store() -> (tempfile::TempDir, EfivarfsStore) {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap().to_owned();
        (td, EfivarfsStore::new(root))
    }

    #[test]
    fn test_efivarfs_layout() {
        let (td, mut store) = tmp_store();
        let name = VariableName::boot_order();
        store.write(&name, &[1, 0, 0, 0]).unwrap();
        let raw = std::fs::read(
            td.path()
                .join("BootOrder-8be4df61-93ca-11d2-aa0d-00e098032b8c"),
        )
        .unwrap();
        assert_eq!(raw, vec![7, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(store.read(&name).unwrap(), vec![1, 0, 0, 0]);
        // Unrelated files are not listed
        std::fs::write(td.path().join("README"), "x").unwrap();
        std::fs::write(
            td.path()
                .join("SecureBoot-8be4df61-93ca-11d2-aa0d-00e098032b8c"),
            [6, 0, 0, 0, 1],
        )
        .unwrap();
        assert_eq!(
            store.list().unwrap(),
            vec![VariableName::boot_order(), VariableName::new("SecureBoot")]
        );
        store.delete(&name).unwrap();
        assert!(matches!(store.read(&name), Err(Error::NotFound(_))));
        assert!(matches!(store.delete(&name), Err(Error::NotFound(_))));
        assert_eq!(store.read_optional(&name).unwrap(), None);
    }

    #[test]
    fn test_efivarfs_short() {
        let (td, store) = tmp_store();
        std::fs::write(
            td.path()
                .join("Timeout-8be4df61-93ca-11d2-aa0d-00e098032b8c"),
            [7, 0],
        )
        .unwrap();
        assert!(matches!(
            store.read(&VariableName::timeout()),
            Err(Error::CorruptEntry { .. })
        ));
    }

    #[test]
    fn test_memory_store_failures() {
        let name = VariableName::timeout();
        let mut store = MemoryStore::new().with_variable(name.clone(), vec![5, 0]);
        store.fail_writes_to(name.clone());
        assert!(matches!(store.write(&name, &[1, 0]), Err(Error::Io { .. })));
        store.clear_failures();
        store.deny_writes();
        let e = store.delete(&name).unwrap_err();
        assert!(e.is_permission_denied());
        assert!(store.operations().is_empty());
        assert_eq!(store.get(&name), Some(&[5u8, 0][..]));
        store.clear_failures();
        store.write(&name, &[1, 0]).unwrap();
        store.delete(&name).unwrap();
        assert_eq!(
            store.operations(),
            &[StoreOp::Write(name.clone()), StoreOp::Delete(name)]
        );
    }
}
