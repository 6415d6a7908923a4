//! The in-memory model of the firmware boot configuration.
//!
//! Every mutation is written through to the [`VariableStore`] first and
//! applied to memory only once all of its writes succeeded, so a failed call
//! leaves [`Registry::state`] exactly as it was. The one exception that cannot
//! be hidden is a removal whose entry delete succeeded but whose order update
//! failed; that is reported as [`Error::PartialRemove`] and the registry
//! refuses further mutations until [`Registry::reload`].

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::device_path::DevicePath;
use crate::efivars::{VariableName, VariableStore};
use crate::errors::{Error, Result};
use crate::load_option::{self, BootEntry, BootId};

/// Snapshot of all boot variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootState {
    /// Decodable entries by id.
    pub entries: BTreeMap<BootId, BootEntry>,
    /// `Boot####` variables that exist but did not decode; their ids are never reused.
    pub corrupt: BTreeSet<BootId>,
    /// `BootOrder`.
    pub order: Vec<BootId>,
    /// `BootNext`.
    pub next: Option<BootId>,
    /// `BootCurrent`.
    pub current: Option<BootId>,
    /// `Timeout` in seconds.
    pub timeout: Option<u16>,
}

/// Where an entry sits in the boot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Schedule {
    /// 0-based position in `BootOrder`.
    Position(usize),
    /// Not in `BootOrder`.
    Unscheduled,
}

/// An entry as presented by [`Registry::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    /// The entry.
    pub entry: BootEntry,
    /// Its place in the boot order.
    pub schedule: Schedule,
}

/// The presentation order of all entries plus the global settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootListing {
    /// Scheduled entries in boot order, then unscheduled ones by id.
    pub entries: Vec<ListedEntry>,
    /// `Timeout` in seconds.
    pub timeout: Option<u16>,
    /// `BootNext`.
    pub next: Option<BootId>,
    /// `BootCurrent`.
    pub current: Option<BootId>,
}

fn decode_u16_list(name: &VariableName, buf: &[u8]) -> Result<Vec<u16>> {
    if buf.len() % 2 != 0 {
        return Err(Error::CorruptEntry {
            name: name.to_string(),
            reason: format!("odd length {}", buf.len()),
        });
    }
    Ok(buf
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

fn decode_u16(name: &VariableName, buf: &[u8]) -> Result<u16> {
    match buf {
        [a, b] => Ok(u16::from_le_bytes([*a, *b])),
        _ => Err(Error::CorruptEntry {
            name: name.to_string(),
            reason: format!("expected 2 bytes, found {}", buf.len()),
        }),
    }
}

fn encode_order(order: &[BootId]) -> Vec<u8> {
    order.iter().flat_map(|id| id.0.to_le_bytes()).collect()
}

impl BootState {
    /// Read everything from `store`. Entries that fail to decode are skipped
    /// with a warning; a corrupt `BootOrder`, `BootNext`, `BootCurrent` or
    /// `Timeout` is an error.
    pub fn load(store: &dyn VariableStore) -> Result<Self> {
        let mut state = BootState::default();
        for name in store.list()? {
            let Some(id) = name.boot_entry_id() else {
                continue;
            };
            // Listed but gone is possible if something else is editing concurrently
            let Some(buf) = store.read_optional(&name)? else {
                continue;
            };
            match load_option::decode(id, &buf) {
                Ok(e) => {
                    state.entries.insert(id, e);
                }
                Err(e) => {
                    tracing::warn!("Skipping {name}: {e}");
                    state.corrupt.insert(id);
                }
            }
        }
        let order_name = VariableName::boot_order();
        if let Some(buf) = store.read_optional(&order_name)? {
            state.order = decode_u16_list(&order_name, &buf)?
                .into_iter()
                .map(BootId)
                .collect();
        }
        let read_u16 = |name: VariableName| -> Result<Option<u16>> {
            store
                .read_optional(&name)?
                .map(|buf| decode_u16(&name, &buf))
                .transpose()
        };
        state.next = read_u16(VariableName::boot_next())?.map(BootId);
        state.current = read_u16(VariableName::boot_current())?.map(BootId);
        state.timeout = read_u16(VariableName::timeout())?;
        tracing::debug!(
            "Loaded {} entries, order {:?}",
            state.entries.len(),
            state.order
        );
        Ok(state)
    }

    /// The lowest id not used by any entry, corrupt variable, or order slot.
    fn next_free_id(&self) -> Option<BootId> {
        (0..=u16::MAX).map(BootId).find(|id| {
            !self.entries.contains_key(id) && !self.corrupt.contains(id) && !self.order.contains(id)
        })
    }
}

/// Authoritative in-memory model of boot entries, backed by a store.
#[derive(Debug)]
pub struct Registry<S> {
    store: S,
    state: BootState,
    stale: bool,
}

impl<S: VariableStore> Registry<S> {
    /// Load the current state from `store`.
    pub fn load(store: S) -> Result<Self> {
        let state = BootState::load(&store)?;
        Ok(Self {
            store,
            state,
            stale: false,
        })
    }

    /// Discard memory and read everything again; clears the stale flag.
    pub fn reload(&mut self) -> Result<()> {
        self.state = BootState::load(&self.store)?;
        self.stale = false;
        Ok(())
    }

    /// The current state.
    pub fn state(&self) -> &BootState {
        &self.state
    }

    /// The backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mutable access to the backing store.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Whether a partial failure left the store and memory out of sync.
    pub fn needs_reload(&self) -> bool {
        self.stale
    }

    /// The entry with `id`.
    pub fn get(&self, id: BootId) -> Result<&BootEntry> {
        self.state
            .entries
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("Boot{id}")))
    }

    /// Entries whose description equals `label` exactly, in id order.
    pub fn find_by_label(&self, label: &str) -> Vec<&BootEntry> {
        self.state
            .entries
            .values()
            .filter(|e| e.description == label)
            .collect()
    }

    /// All entries in presentation order. Inactive entries count as
    /// unscheduled even when firmware left them in `BootOrder`.
    pub fn list(&self) -> BootListing {
        let mut seen = BTreeSet::new();
        let mut entries = Vec::new();
        for (pos, id) in self.state.order.iter().enumerate() {
            let Some(entry) = self.state.entries.get(id).filter(|e| e.active) else {
                continue;
            };
            if seen.insert(*id) {
                entries.push(ListedEntry {
                    entry: entry.clone(),
                    schedule: Schedule::Position(pos),
                });
            }
        }
        for (id, entry) in &self.state.entries {
            if !seen.contains(id) {
                entries.push(ListedEntry {
                    entry: entry.clone(),
                    schedule: Schedule::Unscheduled,
                });
            }
        }
        BootListing {
            entries,
            timeout: self.state.timeout,
            next: self.state.next,
            current: self.state.current,
        }
    }

    /// The loaded order without ids that have no variable at all.
    fn live_order(&self) -> Vec<BootId> {
        self.state
            .order
            .iter()
            .copied()
            .filter(|id| self.state.entries.contains_key(id) || self.state.corrupt.contains(id))
            .collect()
    }

    fn ensure_fresh(&self) -> Result<()> {
        if self.stale {
            return Err(Error::NeedsReload);
        }
        Ok(())
    }

    fn write_order(&mut self, order: &[BootId]) -> Result<()> {
        let name = VariableName::boot_order();
        if order.is_empty() {
            match self.store.delete(&name) {
                Err(Error::NotFound(_)) => Ok(()),
                r => r,
            }
        } else {
            self.store.write(&name, &encode_order(order))
        }
    }

    fn write_entry(&mut self, entry: &BootEntry) -> Result<()> {
        entry.validate()?;
        self.store.write(
            &VariableName::boot_entry(entry.id),
            &load_option::encode(entry),
        )
    }

    /// Create a new active entry in the lowest free slot and append it to the
    /// boot order.
    pub fn add(
        &mut self,
        description: &str,
        device_path: DevicePath,
        payload: Option<Vec<u8>>,
    ) -> Result<BootEntry> {
        self.add_entry(BootEntry::new(BootId(0), description, device_path, payload))
    }

    /// Store a copy of `template` in the lowest free slot, ignoring its id.
    /// Active entries are appended to the boot order.
    pub fn add_entry(&mut self, template: BootEntry) -> Result<BootEntry> {
        self.ensure_fresh()?;
        let id = self
            .state
            .next_free_id()
            .ok_or_else(|| Error::InvalidOrder("all boot entry slots are in use".into()))?;
        let entry = BootEntry { id, ..template };
        self.write_entry(&entry)?;
        let mut order = self.live_order();
        if entry.active {
            order.push(id);
            if let Err(e) = self.write_order(&order) {
                if let Err(rollback) = self.store.delete(&VariableName::boot_entry(id)) {
                    tracing::error!("Failed to roll back Boot{id}: {rollback}");
                    self.stale = true;
                }
                return Err(e);
            }
        }
        tracing::info!("Created Boot{id} '{}'", entry.description);
        self.state.entries.insert(id, entry.clone());
        self.state.order = order;
        Ok(entry)
    }

    /// Delete an entry and unschedule it. A failure after the entry is gone
    /// is [`Error::PartialRemove`].
    pub fn remove(&mut self, id: BootId) -> Result<()> {
        self.ensure_fresh()?;
        self.get(id)?;
        self.store.delete(&VariableName::boot_entry(id))?;
        let mut order = self.live_order();
        order.retain(|o| *o != id);
        let clear_next = self.state.next == Some(id);
        let r = self.unschedule(&order, clear_next);
        if let Err(e) = r {
            self.stale = true;
            return Err(Error::PartialRemove {
                id,
                source: Box::new(e),
            });
        }
        tracing::info!("Removed Boot{id}");
        self.state.entries.remove(&id);
        self.state.order = order;
        if clear_next {
            self.state.next = None;
        }
        Ok(())
    }

    /// Persist the order and `BootNext` changes that follow an entry delete.
    fn unschedule(&mut self, order: &[BootId], clear_next: bool) -> Result<()> {
        if order != self.state.order {
            self.write_order(order)?;
        }
        if clear_next {
            match self.store.delete(&VariableName::boot_next()) {
                Err(Error::NotFound(_)) => {}
                r => r?,
            }
        }
        Ok(())
    }

    /// Replace the boot order wholesale. Only active entries may be scheduled.
    pub fn reorder(&mut self, new_order: &[BootId]) -> Result<()> {
        self.ensure_fresh()?;
        let mut seen = BTreeSet::new();
        for id in new_order {
            match self.state.entries.get(id) {
                None => return Err(Error::InvalidOrder(format!("unknown entry Boot{id}"))),
                Some(e) if !e.active => {
                    return Err(Error::InvalidOrder(format!("Boot{id} is inactive")))
                }
                Some(_) => {}
            }
            if !seen.insert(*id) {
                return Err(Error::InvalidOrder(format!("Boot{id} listed twice")));
            }
        }
        self.write_order(new_order)?;
        tracing::info!("Set boot order to {new_order:?}");
        self.state.order = new_order.to_vec();
        Ok(())
    }

    /// Set or clear an entry's active flag. Inactive entries are removed from
    /// the boot order; activating one appends it if absent.
    pub fn set_active(&mut self, id: BootId, active: bool) -> Result<()> {
        self.ensure_fresh()?;
        let current = self.get(id)?.clone();
        let in_order = self.state.order.contains(&id);
        let order = match (active, in_order) {
            (true, false) => {
                let mut o = self.live_order();
                o.push(id);
                Some(o)
            }
            (false, true) => {
                let mut o = self.live_order();
                o.retain(|x| *x != id);
                Some(o)
            }
            _ => None,
        };
        let updated = BootEntry {
            active,
            ..current.clone()
        };
        let entry_changed = updated != current;
        if !entry_changed && order.is_none() {
            return Ok(());
        }
        if entry_changed {
            self.write_entry(&updated)?;
        }
        if let Some(order) = &order {
            if let Err(e) = self.write_order(order) {
                if entry_changed {
                    if let Err(restore) = self.write_entry(&current) {
                        tracing::error!("Failed to restore Boot{id}: {restore}");
                        self.stale = true;
                    }
                }
                return Err(e);
            }
        }
        tracing::info!("Set Boot{id} active={active}");
        self.state.entries.insert(id, updated);
        if let Some(order) = order {
            self.state.order = order;
        }
        Ok(())
    }

    /// Set or clear the one-shot `BootNext`.
    pub fn set_next(&mut self, id: Option<BootId>) -> Result<()> {
        self.ensure_fresh()?;
        let name = VariableName::boot_next();
        match id {
            Some(id) => {
                self.get(id)?;
                self.store.write(&name, &id.0.to_le_bytes())?;
            }
            None => match self.store.delete(&name) {
                Err(Error::NotFound(_)) => {}
                r => r?,
            },
        }
        self.state.next = id;
        Ok(())
    }

    /// Set or clear the boot menu timeout.
    pub fn set_timeout(&mut self, seconds: Option<u16>) -> Result<()> {
        self.ensure_fresh()?;
        let name = VariableName::timeout();
        match seconds {
            Some(s) => self.store.write(&name, &s.to_le_bytes())?,
            None => match self.store.delete(&name) {
                Err(Error::NotFound(_)) => {}
                r => r?,
            },
        }
        tracing::info!("Set timeout to {seconds:?}");
        self.state.timeout = seconds;
        Ok(())
    }

    /// Change an entry's description in place.
    pub fn rename(&mut self, id: BootId, description: &str) -> Result<()> {
        self.ensure_fresh()?;
        if description.is_empty() {
            return Err(Error::InvalidDescription("empty description".into()));
        }
        let updated = BootEntry {
            description: description.to_string(),
            ..self.get(id)?.clone()
        };
        self.write_entry(&updated)?;
        tracing::info!("Renamed Boot{id} to '{description}'");
        self.state.entries.insert(id, updated);
        Ok(())
    }
}
