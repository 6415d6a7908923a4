//! The error type shared by the boot entry manager core.

use camino::Utf8PathBuf;

use crate::load_option::BootId;

/// Errors reported by the boot entry manager.
///
/// Anything raised by an external collaborator (partition enumeration, mounting,
/// elevation) that has no dedicated kind is carried as [`Error::Service`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A variable or entry does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    /// The variable store refused access; retrying with elevated privileges may help.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    /// Any other I/O failure of the variable store.
    #[error("I/O error accessing {name}")]
    Io {
        /// The variable or path being accessed.
        name: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A stored variable does not decode.
    #[error("Corrupt variable {name}: {reason}")]
    CorruptEntry {
        /// Variable name.
        name: String,
        /// What was wrong with it.
        reason: String,
    },
    /// A proposed boot order is unusable.
    #[error("Invalid boot order: {0}")]
    InvalidOrder(String),
    /// A description cannot be stored.
    #[error("Invalid description: {0}")]
    InvalidDescription(String),
    /// An earlier partial failure left the store out of sync with memory.
    #[error("Boot variables changed underneath the in-memory state; reload required")]
    NeedsReload,
    /// A device path does not identify any live partition.
    #[error("Cannot resolve {path}: {reason}")]
    Unresolvable {
        /// The device path, rendered.
        path: String,
        /// Why resolution failed.
        reason: String,
    },
    /// The partition matched by signature carries a different number than recorded.
    #[error(
        "Partition {device} is number {live} but the device path records partition {recorded}"
    )]
    InconsistentPartitionNumber {
        /// The live partition device.
        device: Utf8PathBuf,
        /// Number in the device path.
        recorded: u32,
        /// Number on disk.
        live: u32,
    },
    /// Migration requires both labels.
    #[error("Both old and new EFI labels must be specified")]
    InvalidLabels,
    /// No entry carries the label.
    #[error("No EFI data found for label '{0}'")]
    NoMatchingEntry(String),
    /// More than one entry carries the label.
    #[error("Multiple boot entries found for label '{label}': {}", format_ids(.ids))]
    AmbiguousLabel {
        /// The label searched for.
        label: String,
        /// Every matching entry.
        ids: Vec<BootId>,
    },
    /// The matching entry's device path does not resolve.
    #[error("EFI label '{label}' (Boot{id}) is linked to an unknown partition")]
    UnresolvablePartition {
        /// The label searched for.
        label: String,
        /// The matching entry.
        id: BootId,
        /// Why resolution failed.
        #[source]
        source: Box<Error>,
    },
    /// The entry and the expected target disagree on the partition number.
    #[error(
        "Device partition number [{expected}] differs from EFI entry partition number [{entry}]"
    )]
    PartitionNumberMismatch {
        /// Number recorded by the existing entry.
        entry: u32,
        /// Number of the expected target.
        expected: u32,
    },
    /// The old entry is gone but its replacement could not be created.
    #[error("Deleted Boot{deleted} but failed to create replacement entry '{label}'; manual recovery required")]
    CreateAfterDeleteFailed {
        /// The removed entry.
        deleted: BootId,
        /// Label of the entry that was not created.
        label: String,
        /// Why creation failed.
        #[source]
        source: Box<Error>,
    },
    /// The entry was deleted but the order could not be updated.
    #[error("Deleted Boot{id} but failed to update the boot order")]
    PartialRemove {
        /// The removed entry.
        id: BootId,
        /// Why the order update failed.
        #[source]
        source: Box<Error>,
    },
    /// The passphrase did not unlock the container.
    #[error("Wrong passphrase for {0}")]
    WrongPassphrase(String),
    /// The partition is encrypted and no passphrase was supplied.
    #[error("{0} is encrypted; a passphrase is required")]
    PassphraseRequired(String),
    /// Failure of an external collaborator.
    #[error(transparent)]
    Service(#[from] anyhow::Error),
}

fn format_ids(ids: &[BootId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Whether retrying through the privilege escalation service might succeed.
    ///
    /// Partial failures are never retryable even when caused by a denied write,
    /// since part of the operation already happened.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::PermissionDenied(_))
    }
}

/// Result alias for the core.
pub type Result<T, E = Error> = std::result::Result<T, E>;
