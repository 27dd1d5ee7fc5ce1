//! Deadline scheduler shared by every timer class.
//!
//! Pending deadlines live in a map keyed by timer id; a binary heap gives
//! the next deadline without scanning. Rescheduling a key replaces its
//! deadline; stale heap entries are discarded by checking against the map.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::Instant;

pub struct Scheduler<K> {
    pending: HashMap<K, Instant>,
    heap: BinaryHeap<Reverse<(Instant, K)>>,
}

impl<K: Ord + Hash + Clone> Scheduler<K> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            heap: BinaryHeap::new(),
        }
    }

    /// Arm (or re-arm) a timer. An existing deadline for the same key is
    /// replaced, not extended.
    pub fn schedule_at(&mut self, key: K, fire_at: Instant) {
        self.pending.insert(key.clone(), fire_at);
        self.heap.push(Reverse((fire_at, key)));
    }

    pub fn cancel(&mut self, key: &K) {
        self.pending.remove(key);
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Earliest armed deadline, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.pop_stale();
        self.heap.peek().map(|Reverse((t, _))| *t)
    }

    /// Pop every timer due at `now`, in deadline order.
    pub fn drain_due(&mut self, now: Instant) -> Vec<K> {
        let mut due = Vec::new();
        loop {
            self.pop_stale();
            let Some(Reverse((fire_at, key))) = self.heap.peek().cloned() else {
                break;
            };
            if fire_at > now {
                break;
            }
            let _ = self.heap.pop();
            if self.pending.get(&key).copied() == Some(fire_at) {
                self.pending.remove(&key);
                due.push(key);
            }
        }
        due
    }

    fn pop_stale(&mut self) {
        while let Some(Reverse((fire_at, key))) = self.heap.peek() {
            match self.pending.get(key).copied() {
                Some(current) if current == *fire_at => break,
                _ => {
                    let _ = self.heap.pop();
                }
            }
        }
    }
}

impl<K: Ord + Hash + Clone> Default for Scheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}
