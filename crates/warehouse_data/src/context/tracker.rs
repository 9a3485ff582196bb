//! Identity map for tracked entity instances.
//!
//! Entries live in an arena of slots; an index maps `(entity type, key)` to
//! every slot holding that identity. Several slots may share one identity
//! while inserts are staged; commit refuses such duplicates.

use super::EntityState;
use crate::entity::{Entity, EntityKey};
use rusqlite::types::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Identity {
    type_id: TypeId,
    key: EntityKey,
}

impl Identity {
    pub(crate) fn of<T: Entity>(key: EntityKey) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            key,
        }
    }
}

pub(crate) struct TrackedEntry {
    pub(crate) table: &'static str,
    pub(crate) key_columns: &'static [&'static str],
    pub(crate) columns: &'static [&'static str],
    pub(crate) key: EntityKey,
    pub(crate) values: Vec<Value>,
    pub(crate) state: EntityState,
    pub(crate) seq: u64,
    type_id: TypeId,
    instance: Box<dyn Any + Send + Sync>,
}

impl TrackedEntry {
    pub(crate) fn instance<T: Entity>(&self) -> Option<&T> {
        self.instance.downcast_ref::<T>()
    }

    fn identity(&self) -> Identity {
        Identity {
            type_id: self.type_id,
            key: self.key.clone(),
        }
    }

    fn refresh<T: Entity>(&mut self, entity: &T) {
        self.values = entity.to_row();
        self.instance = Box::new(entity.clone());
    }
}

#[derive(Default)]
pub(crate) struct Tracker {
    slots: Vec<Option<TrackedEntry>>,
    free: Vec<usize>,
    index: HashMap<Identity, Vec<usize>>,
    next_seq: u64,
}

impl Tracker {
    /// Stores a snapshot of `entity` in a fresh slot.
    pub(crate) fn insert<T: Entity>(&mut self, entity: &T, state: EntityState) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = TrackedEntry {
            table: T::table_name(),
            key_columns: T::key_columns(),
            columns: T::columns(),
            key: entity.key(),
            values: entity.to_row(),
            state,
            seq,
            type_id: TypeId::of::<T>(),
            instance: Box::new(entity.clone()),
        };
        let identity = entry.identity();
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.index.entry(identity).or_default().push(slot);
        slot
    }

    pub(crate) fn remove(&mut self, slot: usize) -> Option<TrackedEntry> {
        let entry = self.slots.get_mut(slot)?.take()?;
        let identity = entry.identity();
        if let Some(slots) = self.index.get_mut(&identity) {
            slots.retain(|candidate| *candidate != slot);
            if slots.is_empty() {
                self.index.remove(&identity);
            }
        }
        self.free.push(slot);
        Some(entry)
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&TrackedEntry> {
        self.slots.get(slot)?.as_ref()
    }

    pub(crate) fn set_state(&mut self, slot: usize, state: EntityState) {
        if let Some(Some(entry)) = self.slots.get_mut(slot) {
            entry.state = state;
        }
    }

    /// Sets `state` and replaces the stored snapshot with `entity`.
    pub(crate) fn restage<T: Entity>(&mut self, slot: usize, entity: &T, state: EntityState) {
        if let Some(Some(entry)) = self.slots.get_mut(slot) {
            entry.refresh(entity);
            entry.state = state;
        }
    }

    pub(crate) fn slots_for(&self, identity: &Identity) -> &[usize] {
        self.index
            .get(identity)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Resolves the slot that represents `entity`.
    ///
    /// When several slots share the key, the most recently staged one whose
    /// snapshot equals the entity's current row wins; otherwise the most
    /// recently staged one overall.
    pub(crate) fn locate<T: Entity>(&self, entity: &T) -> Option<usize> {
        let identity = Identity::of::<T>(entity.key());
        match self.slots_for(&identity) {
            [] => None,
            [single] => Some(*single),
            candidates => {
                let row = entity.to_row();
                candidates
                    .iter()
                    .filter_map(|slot| self.get(*slot).map(|entry| (*slot, entry)))
                    .max_by_key(|(_, entry)| (entry.values == row, entry.seq))
                    .map(|(slot, _)| slot)
            }
        }
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (usize, &TrackedEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|entry| (slot, entry)))
    }

    /// Slots of `T` in staging order.
    pub(crate) fn entries_of<T: Entity>(&self) -> Vec<&TrackedEntry> {
        let type_id = TypeId::of::<T>();
        let mut entries: Vec<_> = self
            .entries()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.type_id == type_id)
            .collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
    }

    /// Non-`Unchanged` slots in staging order.
    pub(crate) fn staged(&self) -> Vec<usize> {
        let mut staged: Vec<_> = self
            .entries()
            .filter(|(_, entry)| entry.state != EntityState::Unchanged)
            .map(|(slot, entry)| (entry.seq, slot))
            .collect();
        staged.sort_unstable();
        staged.into_iter().map(|(_, slot)| slot).collect()
    }

    pub(crate) fn has_changes(&self) -> bool {
        self.entries()
            .any(|(_, entry)| entry.state != EntityState::Unchanged)
    }

    /// Finds an `Added` slot whose identity is already claimed by another live
    /// slot (`Unchanged`, `Modified`, or an earlier `Added`).
    pub(crate) fn first_duplicate(&self) -> Option<&TrackedEntry> {
        self.staged().into_iter().find_map(|slot| {
            let entry = self.get(slot)?;
            if entry.state != EntityState::Added {
                return None;
            }
            let clash = self.slots_for(&entry.identity()).iter().any(|other| {
                *other != slot
                    && self.get(*other).is_some_and(|other| match other.state {
                        EntityState::Unchanged | EntityState::Modified => true,
                        EntityState::Added => other.seq < entry.seq,
                        EntityState::Deleted | EntityState::Detached => false,
                    })
            });
            clash.then_some(entry)
        })
    }

    /// Applies a successful flush: deleted slots leave, the rest settle.
    pub(crate) fn accept(&mut self, slots: &[usize]) {
        for slot in slots {
            match self.get(*slot).map(|entry| entry.state) {
                Some(EntityState::Deleted) => {
                    self.remove(*slot);
                }
                Some(_) => self.set_state(*slot, EntityState::Unchanged),
                None => {}
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
