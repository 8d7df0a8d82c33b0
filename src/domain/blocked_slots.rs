use crate::domain::error::SlotError;
use crate::domain::models::{BlockedSlot, SlotKey};
use chrono::NaiveDate;
use std::collections::HashMap;

/// Canonical set of blocked slots, bucketed by exact calendar date.
///
/// There is deliberately no weekday bucket: a block on one Tuesday is
/// invisible to every other Tuesday.
#[derive(Debug, Clone, Default)]
pub struct BlockedSlotStore {
    by_date: HashMap<NaiveDate, HashMap<u8, BlockedSlot>>,
    key_by_id: HashMap<String, SlotKey>,
}

impl BlockedSlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slots(slots: impl IntoIterator<Item = BlockedSlot>) -> Self {
        let mut store = Self::new();
        store.replace_all(slots);
        store
    }

    pub fn is_blocked(&self, date: NaiveDate, hour: u8) -> bool {
        self.by_date
            .get(&date)
            .is_some_and(|hours| hours.contains_key(&hour))
    }

    pub fn get(&self, key: &SlotKey) -> Option<&BlockedSlot> {
        self.by_date.get(&key.date).and_then(|hours| hours.get(&key.hour))
    }

    pub fn get_by_id(&self, id: &str) -> Option<&BlockedSlot> {
        self.key_by_id.get(id.trim()).and_then(|key| self.get(key))
    }

    pub fn add(&mut self, slot: BlockedSlot) -> Result<(), SlotError> {
        slot.validate()?;
        let key = slot.key();
        if self.is_blocked(key.date, key.hour) {
            return Err(SlotError::Conflict(key));
        }
        self.insert_unchecked(slot);
        Ok(())
    }

    /// Inserts or replaces the record at the slot's key. Used when the remote
    /// confirms a block and may hand back a new id.
    pub fn upsert(&mut self, slot: BlockedSlot) -> Result<Option<BlockedSlot>, SlotError> {
        slot.validate()?;
        let previous = self.take(&slot.key());
        self.insert_unchecked(slot);
        Ok(previous)
    }

    pub fn remove(&mut self, date: NaiveDate, hour: u8) -> Result<BlockedSlot, SlotError> {
        let key = SlotKey::new(date, hour);
        self.take(&key)
            .ok_or_else(|| SlotError::NotFound(key.to_string()))
    }

    pub fn remove_by_id(&mut self, id: &str) -> Result<BlockedSlot, SlotError> {
        let id = id.trim();
        let key = self
            .key_by_id
            .get(id)
            .copied()
            .ok_or_else(|| SlotError::NotFound(format!("id {id}")))?;
        self.take(&key)
            .ok_or_else(|| SlotError::NotFound(format!("id {id}")))
    }

    /// Collapses records sharing a `(date, hour)` key, keeping a
    /// server-confirmed record over a local-pending one. Among equals the
    /// first seen wins. Output is ordered by key.
    pub fn dedupe(slots: impl IntoIterator<Item = BlockedSlot>) -> Vec<BlockedSlot> {
        let mut winners: HashMap<SlotKey, BlockedSlot> = HashMap::new();
        for slot in slots {
            match winners.get(&slot.key()) {
                Some(existing) if existing.is_confirmed() || !slot.is_confirmed() => {}
                _ => {
                    winners.insert(slot.key(), slot);
                }
            }
        }
        let mut deduped = winners.into_values().collect::<Vec<_>>();
        deduped.sort_by_key(BlockedSlot::key);
        deduped
    }

    /// Rebuilds both indexes from scratch. Entries absent from `slots` are
    /// dropped, which is how stale or leaked records get pruned.
    pub fn replace_all(&mut self, slots: impl IntoIterator<Item = BlockedSlot>) {
        self.by_date.clear();
        self.key_by_id.clear();
        for slot in Self::dedupe(slots) {
            if slot.validate().is_ok() {
                self.insert_unchecked(slot);
            }
        }
    }

    pub fn slots_on(&self, date: NaiveDate) -> Vec<BlockedSlot> {
        let mut slots = self
            .by_date
            .get(&date)
            .map(|hours| hours.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        slots.sort_by_key(|slot| slot.hour);
        slots
    }

    pub fn slots_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<BlockedSlot> {
        let mut slots = self
            .by_date
            .iter()
            .filter(|(date, _)| **date >= start && **date <= end)
            .flat_map(|(_, hours)| hours.values().cloned())
            .collect::<Vec<_>>();
        slots.sort_by_key(BlockedSlot::key);
        slots
    }

    pub fn all(&self) -> Vec<BlockedSlot> {
        let mut slots = self
            .by_date
            .values()
            .flat_map(|hours| hours.values().cloned())
            .collect::<Vec<_>>();
        slots.sort_by_key(BlockedSlot::key);
        slots
    }

    pub fn len(&self) -> usize {
        self.by_date.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_date.is_empty()
    }

    fn insert_unchecked(&mut self, slot: BlockedSlot) {
        let key = slot.key();
        self.key_by_id.insert(slot.id.clone(), key);
        self.by_date.entry(key.date).or_default().insert(key.hour, slot);
    }

    fn take(&mut self, key: &SlotKey) -> Option<BlockedSlot> {
        let hours = self.by_date.get_mut(&key.date)?;
        let removed = hours.remove(&key.hour)?;
        if hours.is_empty() {
            self.by_date.remove(&key.date);
        }
        if self.key_by_id.get(&removed.id) == Some(key) {
            self.key_by_id.remove(&removed.id);
        }
        Some(removed)
    }
}
