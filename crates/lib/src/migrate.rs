//! Replacing the firmware entry of a frugal install.
//!
//! A frugal install is usually booted through another distribution's GRUB,
//! sometimes via a firmware entry that chains into it. Migration swaps the
//! single entry carrying the install's label for a direct entry on the
//! expected partition. All lookups happen in [`plan`]; [`apply`] is the only
//! step that writes.

use crate::device_path::DevicePath;
use crate::efivars::VariableStore;
use crate::errors::{Error, Result};
use crate::load_option::{BootEntry, BootId};
use crate::registry::Registry;
use crate::resolver::{PartitionIdentity, Resolver};

/// What to migrate.
#[derive(Debug, Clone, Copy)]
pub struct MigrationRequest<'a> {
    /// Description of the existing entry.
    pub old_label: &'a str,
    /// Description for the replacement.
    pub new_label: &'a str,
    /// Restrict the match to this entry, to disambiguate duplicate labels.
    pub entry: Option<BootId>,
    /// Block device the replacement must point at, e.g. `/dev/sda1`.
    pub target: &'a str,
    /// Loader path for the replacement; defaults to the old entry's.
    pub loader: Option<&'a str>,
}

/// Everything validated before the first write. Only [`plan`] builds one,
/// so a context always names exactly one entry to replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationContext {
    old_label: String,
    new_label: String,
    old: BootEntry,
    resolved_partition: PartitionIdentity,
    target: PartitionIdentity,
    device_path: DevicePath,
}

impl MigrationContext {
    /// Description of the existing entry.
    pub fn old_label(&self) -> &str {
        &self.old_label
    }

    /// Description for the replacement.
    pub fn new_label(&self) -> &str {
        &self.new_label
    }

    /// The entry that will be replaced.
    pub fn old_entry(&self) -> &BootEntry {
        &self.old
    }

    /// Partition the existing entry points at.
    pub fn resolved_partition(&self) -> &PartitionIdentity {
        &self.resolved_partition
    }

    /// Partition the replacement will point at.
    pub fn target(&self) -> &PartitionIdentity {
        &self.target
    }

    /// Device path of the replacement.
    pub fn device_path(&self) -> &DevicePath {
        &self.device_path
    }
}

/// Result of a completed migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Id of the deleted entry.
    pub removed: BootId,
    /// The new entry.
    pub created: BootEntry,
}

/// Validate a migration without touching the store.
pub fn plan<S: VariableStore>(
    registry: &Registry<S>,
    resolver: &Resolver<'_>,
    req: &MigrationRequest<'_>,
) -> Result<MigrationContext> {
    if req.old_label.is_empty() || req.new_label.is_empty() {
        return Err(Error::InvalidLabels);
    }
    let candidates: Vec<BootEntry> = registry
        .find_by_label(req.old_label)
        .into_iter()
        .filter(|e| req.entry.map_or(true, |id| e.id == id))
        .cloned()
        .collect();
    let old = match candidates.as_slice() {
        [] => return Err(Error::NoMatchingEntry(req.old_label.to_string())),
        [one] => one.clone(),
        many => {
            return Err(Error::AmbiguousLabel {
                label: req.old_label.to_string(),
                ids: many.iter().map(|e| e.id).collect(),
            })
        }
    };
    let resolved = resolver
        .resolve(&old.device_path)
        .map_err(|e| Error::UnresolvablePartition {
            label: req.old_label.to_string(),
            id: old.id,
            source: Box::new(e),
        })?;
    let target = resolver.resolve_device(req.target)?;
    if resolved.partition_number != target.partition_number {
        return Err(Error::PartitionNumberMismatch {
            entry: resolved.partition_number,
            expected: target.partition_number,
        });
    }
    let loader = req
        .loader
        .or_else(|| old.device_path.file_path())
        .ok_or_else(|| Error::Unresolvable {
            path: old.device_path.to_string(),
            reason: "no loader file path".into(),
        })?;
    let device_path = Resolver::build(&target, loader);
    tracing::debug!(
        "Migrating Boot{} ({}) to {device_path}",
        old.id,
        resolved.device
    );
    Ok(MigrationContext {
        old_label: req.old_label.to_string(),
        new_label: req.new_label.to_string(),
        old,
        resolved_partition: resolved,
        target,
        device_path,
    })
}

/// Delete the old entry and create its replacement. The replacement keeps
/// the old payload, attributes and active flag.
///
/// There is no rollback once the delete went through; a failure after that
/// point is [`Error::CreateAfterDeleteFailed`].
pub fn apply<S: VariableStore>(
    registry: &mut Registry<S>,
    ctx: &MigrationContext,
) -> Result<MigrationOutcome> {
    let old = ctx.old_entry();
    let after_delete = |source: Error| Error::CreateAfterDeleteFailed {
        deleted: old.id,
        label: ctx.new_label.clone(),
        source: Box::new(source),
    };
    match registry.remove(old.id) {
        Ok(()) => {}
        Err(e @ Error::PartialRemove { .. }) => return Err(after_delete(e)),
        Err(e) => return Err(e),
    }
    let template = BootEntry {
        description: ctx.new_label.clone(),
        device_path: ctx.device_path.clone(),
        ..old.clone()
    };
    let created = registry.add_entry(template).map_err(after_delete)?;
    tracing::info!(
        "Replaced Boot{} '{}' with Boot{} '{}'",
        old.id,
        ctx.old_label,
        created.id,
        created.description
    );
    Ok(MigrationOutcome {
        removed: old.id,
        created,
    })
}

/// [`plan`] then [`apply`].
pub fn migrate<S: VariableStore>(
    registry: &mut Registry<S>,
    resolver: &Resolver<'_>,
    req: &MigrationRequest<'_>,
) -> Result<MigrationOutcome> {
    let ctx = plan(registry, resolver, req)?;
    apply(registry, &ctx)
}
