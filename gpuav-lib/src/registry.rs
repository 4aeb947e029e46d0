// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Address Ranges
//!
//! Interval index over every device-addressable region the application created.
//!
//! Entries are kept sorted by base address next to a running maximum of their end addresses.  A
//! point query binary-searches for the last entry starting at or before the address and walks
//! backward only while the running maximum says some earlier entry could still reach it.  Live
//! ranges of different owners never overlap, so the walk is short unless the address lands in a
//! pile of destroyed ranges waiting for collection.
//!
//! Destroyed ranges stay queryable.  A shader that faults on memory freed a moment ago should hear
//! "destroyed", not "unmapped".  They are dropped by [`AddressRangeRegistry::collect_garbage`]
//! once the last submission that could have seen them has completed.
//!
//! Aliases are sub-ranges created by a second resource placed on memory somebody else already
//! owns.  They hold a back-reference to their target and take its state at query time.

use std::collections::HashMap;
use std::fmt;

use gpuav_vulkan::handle::ObjectHandle;
use tracing::trace;

use crate::resource::Liveness;

/// Monotonic ordinal of a queue submission.
pub type SubmissionIndex = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RangeId(u64);

impl fmt::Display for RangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "range #{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeState {
    Live,
    Destroyed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRange {
    pub id: RangeId,
    pub base: u64,
    pub length: u64,
    /// Allocation the bytes belong to.  Aliases share it with their target.
    pub owner: ObjectHandle,
    /// Object that registered this range.
    pub resource: ObjectHandle,
    pub state: RangeState,
    pub alias_of: Option<RangeId>,
    /// Last submission that may still reference a destroyed range.
    retire_after: SubmissionIndex,
}

impl MemoryRange {
    /// One past the last byte.  Never overflows, inserts check it.
    pub fn end(&self) -> u64 {
        self.base + self.length
    }

    pub fn contains(&self, address: u64) -> bool {
        self.base <= address && address < self.end()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("range overlaps live {existing} owned by {owner}")]
    OverlapConflict {
        existing: RangeId,
        owner: ObjectHandle,
    },

    #[error("range {base:#x} + {length:#x} overflows the address space")]
    RangeOverflow { base: u64, length: u64 },

    #[error("zero-length range")]
    EmptyRange,

    #[error("{0} is not registered")]
    UnknownRange(RangeId),

    #[error("alias {base:#x} + {length:#x} does not fit inside {target}")]
    AliasOutOfBounds {
        target: RangeId,
        base: u64,
        length: u64,
    },

    #[error("{0} is already destroyed")]
    AlreadyDestroyed(RangeId),
}

#[derive(Debug, Default)]
pub struct AddressRangeRegistry {
    next_id: u64,
    /// Sorted by `(base, id)`.
    entries: Vec<MemoryRange>,
    /// `max_end[i]` is the largest end among `entries[..=i]`.
    max_end: Vec<u64>,
    bases: HashMap<RangeId, u64>,
}

impl AddressRangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register `[base, base + length)` for `owner`.
    pub fn insert(
        &mut self,
        base: u64,
        length: u64,
        owner: ObjectHandle,
    ) -> Result<RangeId, RegistryError> {
        self.insert_entry(base, length, owner, owner, None)
    }

    /// Register a sub-range of `target` used by `resource`.
    pub fn insert_alias(
        &mut self,
        target: RangeId,
        base: u64,
        length: u64,
        resource: ObjectHandle,
    ) -> Result<RangeId, RegistryError> {
        let target_range = *self.get(target).ok_or(RegistryError::UnknownRange(target))?;
        if self.state(target) != Some(RangeState::Live) {
            return Err(RegistryError::AlreadyDestroyed(target));
        }
        let fits = base >= target_range.base
            && base
                .checked_add(length)
                .is_some_and(|end| end <= target_range.end());
        if !fits {
            return Err(RegistryError::AliasOutOfBounds {
                target,
                base,
                length,
            });
        }
        let root = target_range.alias_of.unwrap_or(target);
        self.insert_entry(base, length, target_range.owner, resource, Some(root))
    }

    fn insert_entry(
        &mut self,
        base: u64,
        length: u64,
        owner: ObjectHandle,
        resource: ObjectHandle,
        alias_of: Option<RangeId>,
    ) -> Result<RangeId, RegistryError> {
        if length == 0 {
            return Err(RegistryError::EmptyRange);
        }
        if base.checked_add(length).is_none() {
            return Err(RegistryError::RangeOverflow { base, length });
        }
        for existing in self.find_overlapping(base, length) {
            if let Some(range) = self.get(existing) {
                if range.owner != owner && self.state(existing) == Some(RangeState::Live) {
                    return Err(RegistryError::OverlapConflict {
                        existing,
                        owner: range.owner,
                    });
                }
            }
        }

        let id = RangeId(self.next_id);
        self.next_id += 1;
        let at = self.entries.partition_point(|e| (e.base, e.id) < (base, id));
        self.entries.insert(
            at,
            MemoryRange {
                id,
                base,
                length,
                owner,
                resource,
                state: RangeState::Live,
                alias_of,
                retire_after: 0,
            },
        );
        self.bases.insert(id, base);
        self.rebuild_from(at);
        trace!(%id, base, length, %resource, "registered address range");
        Ok(id)
    }

    /// The range stops being live but remains queryable until submission `after` completes.
    pub fn mark_destroyed(
        &mut self,
        id: RangeId,
        after: SubmissionIndex,
    ) -> Result<(), RegistryError> {
        let index = self.index_of(id).ok_or(RegistryError::UnknownRange(id))?;
        let entry = &mut self.entries[index];
        if entry.state == RangeState::Destroyed {
            return Err(RegistryError::AlreadyDestroyed(id));
        }
        entry.state = RangeState::Destroyed;
        entry.retire_after = after;
        trace!(%id, after, "address range destroyed");
        Ok(())
    }

    pub fn get(&self, id: RangeId) -> Option<&MemoryRange> {
        self.index_of(id).map(|i| &self.entries[i])
    }

    /// State as seen by queries.  An alias dies with its target.
    pub fn state(&self, id: RangeId) -> Option<RangeState> {
        let range = self.get(id)?;
        let target = match range.alias_of {
            Some(target) => self.get(target).map(|t| t.state),
            None => Some(RangeState::Live),
        };
        match (range.state, target) {
            (RangeState::Live, Some(RangeState::Live)) => Some(RangeState::Live),
            _ => Some(RangeState::Destroyed),
        }
    }

    /// Innermost live range containing `address`.
    pub fn find_containing(&self, address: u64) -> Option<RangeId> {
        self.containing(address)
            .find(|r| self.state(r.id) == Some(RangeState::Live))
            .map(|r| r.id)
    }

    /// Like [`find_containing`](Self::find_containing), but falls back to destroyed ranges.
    pub fn find_containing_any(&self, address: u64) -> Option<RangeId> {
        self.find_containing(address)
            .or_else(|| self.containing(address).next().map(|r| r.id))
    }

    /// Every range, in any state, sharing at least one byte with `[base, base + length)`.
    /// Ascending by base.
    pub fn find_overlapping(&self, base: u64, length: u64) -> Vec<RangeId> {
        if length == 0 {
            return Vec::new();
        }
        let end = base.saturating_add(length);
        let upper = self.entries.partition_point(|e| e.base < end);
        let mut found: Vec<RangeId> = (0..upper)
            .rev()
            .take_while(|&i| self.max_end[i] > base)
            .filter(|&i| self.entries[i].end() > base)
            .map(|i| self.entries[i].id)
            .collect();
        found.reverse();
        found
    }

    /// Drop destroyed ranges no submission up to `completed` could still use, plus aliases of them.
    /// Returns how many entries were removed.
    pub fn collect_garbage(&mut self, completed: SubmissionIndex) -> usize {
        let before = self.entries.len();
        let retired: Vec<RangeId> = self
            .entries
            .iter()
            .filter(|e| e.state == RangeState::Destroyed && e.retire_after <= completed)
            .map(|e| e.id)
            .collect();
        if retired.is_empty() {
            return 0;
        }
        self.entries.retain(|e| {
            !retired.contains(&e.id) && !e.alias_of.is_some_and(|t| retired.contains(&t))
        });
        self.bases = self.entries.iter().map(|e| (e.id, e.base)).collect();
        self.rebuild_from(0);
        let removed = before - self.entries.len();
        trace!(removed, completed, "collected address ranges");
        removed
    }

    /// Point-in-time copy for device checks.  `liveness` attaches resource tokens so the copy
    /// notices resources destroyed after it was taken.
    pub fn snapshot(
        &self,
        mut liveness: impl FnMut(ObjectHandle) -> Option<Liveness>,
    ) -> AddressTable {
        let entries: Vec<AddressEntry> = self
            .entries
            .iter()
            .map(|e| AddressEntry {
                base: e.base,
                length: e.length,
                resource: e.resource,
                destroyed: self.state(e.id) != Some(RangeState::Live),
                liveness: liveness(e.resource),
            })
            .collect();
        AddressTable::new(entries)
    }

    fn index_of(&self, id: RangeId) -> Option<usize> {
        let base = *self.bases.get(&id)?;
        self.entries
            .binary_search_by(|e| (e.base, e.id).cmp(&(base, id)))
            .ok()
    }

    fn containing(&self, address: u64) -> impl Iterator<Item = &MemoryRange> {
        let upper = self.entries.partition_point(|e| e.base <= address);
        (0..upper)
            .rev()
            .take_while(move |&i| self.max_end[i] > address)
            .map(|i| &self.entries[i])
            .filter(move |e| e.contains(address))
    }

    fn rebuild_from(&mut self, at: usize) {
        self.max_end.truncate(at);
        let mut running = at
            .checked_sub(1)
            .and_then(|i| self.max_end.get(i))
            .copied()
            .unwrap_or(0);
        for entry in &self.entries[at..] {
            running = running.max(entry.end());
            self.max_end.push(running);
        }
    }
}

#[derive(Clone, Debug)]
pub struct AddressEntry {
    pub base: u64,
    pub length: u64,
    pub resource: ObjectHandle,
    pub destroyed: bool,
    pub liveness: Option<Liveness>,
}

impl AddressEntry {
    pub fn end(&self) -> u64 {
        self.base + self.length
    }

    pub fn is_live(&self) -> bool {
        !self.destroyed && self.liveness.as_ref().is_none_or(Liveness::is_alive)
    }
}

#[derive(Clone, Debug)]
pub enum AddressLookup<'a> {
    Live(&'a AddressEntry),
    Destroyed(&'a AddressEntry),
    Unmapped,
}

/// Sorted copy of the registry taken at submission.
#[derive(Clone, Debug, Default)]
pub struct AddressTable {
    entries: Vec<AddressEntry>,
    max_end: Vec<u64>,
}

/// Words per entry in [`AddressTable::to_words`].
pub const ADDRESS_ENTRY_WORDS: usize = 5;

impl AddressTable {
    fn new(entries: Vec<AddressEntry>) -> Self {
        let mut running = 0;
        let max_end = entries
            .iter()
            .map(|e| {
                running = e.end().max(running);
                running
            })
            .collect();
        Self { entries, max_end }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Classify `address`.  A live range wins over destroyed ones sharing the address.
    pub fn lookup(&self, address: u64) -> AddressLookup<'_> {
        let upper = self.entries.partition_point(|e| e.base <= address);
        let mut destroyed = None;
        for i in (0..upper).rev() {
            if self.max_end[i] <= address {
                break;
            }
            let entry = &self.entries[i];
            if address >= entry.end() {
                continue;
            }
            if entry.is_live() {
                return AddressLookup::Live(entry);
            }
            destroyed.get_or_insert(entry);
        }
        match destroyed {
            Some(entry) => AddressLookup::Destroyed(entry),
            None => AddressLookup::Unmapped,
        }
    }

    /// `[count, (base_lo, base_hi, length_lo, length_hi, flags)...]` for upload.  Bit 0 of flags
    /// marks a destroyed range.
    pub fn to_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(1 + self.entries.len() * ADDRESS_ENTRY_WORDS);
        words.push(self.entries.len() as u32);
        for e in &self.entries {
            words.extend([
                e.base as u32,
                (e.base >> 32) as u32,
                e.length as u32,
                (e.length >> 32) as u32,
                (!e.is_live()) as u32,
            ]);
        }
        words
    }
}
