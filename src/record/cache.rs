//! In-memory record cache: bounded LRU with subscriber pinning.

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::Value;

use crate::version::RecordVersion;

/// A hydrated record. `frame` is the pre-encoded UPDATE frame replayed to
/// future subscribers; it is the authoritative serialized form.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub version: RecordVersion,
    pub body: Value,
    pub frame: Bytes,
}

/// Cache slot contents. `Loading` marks a storage load in flight so
/// concurrent READs share one lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntry {
    Loading,
    Hydrated(Record),
}

struct Slot {
    entry: CacheEntry,
    pinned: bool,
    last_used: u64,
}

pub struct RecordCache {
    capacity: usize,
    slots: HashMap<String, Slot>,
    stamp: u64,
}

impl RecordCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: HashMap::new(),
            stamp: 0,
        }
    }

    fn touch(&mut self) -> u64 {
        self.stamp += 1;
        self.stamp
    }

    pub fn get(&mut self, name: &str) -> Option<&CacheEntry> {
        let stamp = self.touch();
        let slot = self.slots.get_mut(name)?;
        slot.last_used = stamp;
        Some(&slot.entry)
    }

    /// Read without promoting recency (for merge decisions that may drop
    /// the incoming value).
    pub fn peek(&self, name: &str) -> Option<&CacheEntry> {
        self.slots.get(name).map(|slot| &slot.entry)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    /// Insert or replace an entry, preserving any existing pin, then evict
    /// down to capacity.
    pub fn insert(&mut self, name: &str, entry: CacheEntry) {
        self.insert_with_pin(name, entry, false);
    }

    /// Insert an entry that already has local subscribers, so it can never
    /// be the eviction victim of its own insert.
    pub fn insert_pinned(&mut self, name: &str, entry: CacheEntry) {
        self.insert_with_pin(name, entry, true);
    }

    fn insert_with_pin(&mut self, name: &str, entry: CacheEntry, pin: bool) {
        let stamp = self.touch();
        match self.slots.get_mut(name) {
            Some(slot) => {
                slot.entry = entry;
                slot.pinned = slot.pinned || pin;
                slot.last_used = stamp;
            }
            None => {
                self.slots.insert(
                    name.to_string(),
                    Slot {
                        entry,
                        pinned: pin,
                        last_used: stamp,
                    },
                );
                self.evict();
            }
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.slots.remove(name);
    }

    /// Pin `name` against eviction (first local subscriber arrived).
    pub fn pin(&mut self, name: &str) {
        if let Some(slot) = self.slots.get_mut(name) {
            slot.pinned = true;
        }
    }

    /// Release the pin (last local subscriber left).
    pub fn unpin(&mut self, name: &str) {
        if let Some(slot) = self.slots.get_mut(name) {
            slot.pinned = false;
        }
        self.evict();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// LRU eviction over unpinned entries. When every candidate is pinned
    /// the cache grows beyond its target.
    fn evict(&mut self) {
        while self.slots.len() > self.capacity {
            let victim = self
                .slots
                .iter()
                .filter(|(_, slot)| !slot.pinned)
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(name, _)| name.clone());
            match victim {
                Some(name) => {
                    self.slots.remove(&name);
                }
                None => break,
            }
        }
    }
}
