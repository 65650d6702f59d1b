//! Delta-encoded timer queue.
//!
//! Every entry stores the time it has to wait *after* its predecessor fires,
//! so advancing the clock only ever touches the head of the queue:
//!
//! ```text
//!   absolute:  [A:3]  [B:5]  [C:5]  [D:9]
//!   stored:    [A:3]  [B:2]  [C:0]  [D:4]
//! ```
//!
//! The absolute remaining time of an entry is the sum of the deltas from the
//! head up to and including that entry.

use alloc::collections::{BTreeSet, VecDeque};
use alloc::vec::Vec;

#[derive(Debug, Clone, Copy)]
struct Entry<K> {
    key: K,
    delta: u64,
}

pub struct DeltaQueue<K: Ord + Copy> {
    entries: VecDeque<Entry<K>>,
    keys: BTreeSet<K>,
}

impl<K: Ord + Copy> DeltaQueue<K> {
    pub const fn new() -> Self {
        DeltaQueue {
            entries: VecDeque::new(),
            keys: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue `key` to fire after `duration` units.
    ///
    /// Entries with equal deadlines fire in insertion order. A key that is
    /// already queued is rejected and `false` is returned.
    pub fn insert(&mut self, key: K, duration: u64) -> bool {
        if !self.keys.insert(key) {
            return false;
        }

        let mut remaining = duration;
        let mut index = self.entries.len();
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if remaining < entry.delta {
                entry.delta -= remaining;
                index = i;
                break;
            }
            remaining -= entry.delta;
        }

        self.entries.insert(index, Entry { key, delta: remaining });
        true
    }

    /// Whether `key` is still waiting.
    pub fn find(&self, key: K) -> bool {
        self.keys.contains(&key)
    }

    /// Absolute time left before `key` fires.
    pub fn remaining(&self, key: K) -> Option<u64> {
        if !self.find(key) {
            return None;
        }
        let mut total = 0;
        for entry in &self.entries {
            total += entry.delta;
            if entry.key == key {
                return Some(total);
            }
        }
        None
    }

    /// Advance time by `amount`, returning the keys that fired in order.
    pub fn decrease(&mut self, mut amount: u64) -> Vec<K> {
        let mut fired = Vec::new();
        while let Some(head) = self.entries.front_mut() {
            if head.delta > amount {
                head.delta -= amount;
                break;
            }
            amount -= head.delta;
            let key = head.key;
            self.entries.pop_front();
            self.keys.remove(&key);
            fired.push(key);
        }
        fired
    }

    /// Drop `key` without firing it. Later entries keep their deadlines.
    pub fn remove(&mut self, key: K) -> bool {
        if !self.keys.remove(&key) {
            return false;
        }
        let Some(index) = self.entries.iter().position(|e| e.key == key) else {
            return false;
        };
        if let Some(removed) = self.entries.remove(index) {
            if let Some(next) = self.entries.get_mut(index) {
                next.delta += removed.delta;
            }
        }
        true
    }
}

impl<K: Ord + Copy> Default for DeltaQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}
