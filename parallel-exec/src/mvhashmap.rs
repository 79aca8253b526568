//! Multi-version hashmap of speculative (executed but uncommitted) writes.
//!
//! When an attempt finishes, its write set is published here so higher tasks
//! can observe it without waiting for the commit loop. When a task is sent
//! back for re-execution its entries become estimates: a reader hitting an
//! estimate aborts, naming the writer as its dependency.

use crate::types::{Incarnation, StateKey, TxNum, ValueVersion, VersionedWrite};
use alloy_primitives::U256;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};

/// Value cell of a speculative entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryCell {
    Written(U256),
    /// The writer is being re-executed; its next write set is unknown.
    Estimate,
}

/// Entry in the version history for a key.
#[derive(Debug, Clone, Copy)]
pub struct VersionedEntry {
    pub incarnation: Incarnation,
    pub cell: EntryCell,
}

/// Result of reading from the MVHashMap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// Value published by a lower task.
    Versioned(ValueVersion, U256),
    /// No speculative version, read from the committed store.
    Storage,
    /// The closest lower writer is being re-executed.
    Dependency(TxNum),
}

/// Multi-version hashmap keyed by TxNum.
///
/// Structure: StateKey -> BTreeMap<TxNum -> VersionedEntry>
///
/// The BTreeMap allows finding the latest write by a task with a lower TxNum
/// than the reader with one range query.
#[derive(Default)]
pub struct MVHashMap {
    data: DashMap<StateKey, BTreeMap<TxNum, VersionedEntry>>,
    /// Keys last published by each task, so entries can be found without a scan.
    written: DashMap<TxNum, Vec<StateKey>>,
}

impl MVHashMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the latest speculative write of `key` visible to `reader`.
    pub fn read(&self, key: &StateKey, reader: TxNum) -> ReadResult {
        let Some(versions) = self.data.get(key) else {
            return ReadResult::Storage;
        };

        match versions.range(..reader).next_back() {
            Some((tx_num, entry)) => match entry.cell {
                EntryCell::Written(value) => {
                    ReadResult::Versioned(ValueVersion::new(*tx_num, entry.incarnation), value)
                }
                EntryCell::Estimate => ReadResult::Dependency(*tx_num),
            },
            None => ReadResult::Storage,
        }
    }

    /// Publishes the write set of an attempt, replacing the previous one.
    ///
    /// Keys the previous incarnation wrote but this one does not are removed.
    pub fn publish(&self, tx_num: TxNum, incarnation: Incarnation, writes: &[VersionedWrite]) {
        for write in writes {
            self.data.entry(write.key).or_default().insert(
                tx_num,
                VersionedEntry {
                    incarnation,
                    cell: EntryCell::Written(write.value),
                },
            );
        }

        let keys: Vec<StateKey> = writes.iter().map(|w| w.key).collect();
        if let Some(previous) = self.written.insert(tx_num, keys) {
            let current: HashSet<StateKey> = writes.iter().map(|w| w.key).collect();
            for key in previous.iter().filter(|k| !current.contains(k)) {
                self.remove_entry(key, tx_num);
            }
        }
    }

    /// Turns every entry of `tx_num` into an estimate.
    pub fn mark_estimate(&self, tx_num: TxNum) {
        let Some(keys) = self.written.get(&tx_num).map(|k| k.clone()) else {
            return;
        };

        for key in keys {
            if let Some(mut versions) = self.data.get_mut(&key) {
                if let Some(entry) = versions.get_mut(&tx_num) {
                    entry.cell = EntryCell::Estimate;
                }
            }
        }
    }

    /// Drops every entry of `tx_num`, once it is in the committed store.
    pub fn remove(&self, tx_num: TxNum) {
        if let Some((_, keys)) = self.written.remove(&tx_num) {
            for key in keys {
                self.remove_entry(&key, tx_num);
            }
        }
    }

    fn remove_entry(&self, key: &StateKey, tx_num: TxNum) {
        let now_empty = match self.data.get_mut(key) {
            Some(mut versions) => {
                versions.remove(&tx_num);
                versions.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.data.remove_if(key, |_, versions| versions.is_empty());
        }
    }

    /// Number of tasks with published entries.
    pub fn len(&self) -> usize {
        self.written.len()
    }

    pub fn is_empty(&self) -> bool {
        self.written.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    fn write(key: StateKey, value: u64) -> VersionedWrite {
        VersionedWrite {
            key,
            value: U256::from(value),
        }
    }

    #[test]
    fn test_read_write() {
        let mv = MVHashMap::new();
        let key = StateKey::balance(Address::repeat_byte(7));

        assert_eq!(mv.read(&key, 1), ReadResult::Storage);

        mv.publish(3, 0, &[write(key, 100)]);

        // Readers above the writer see it, the writer itself and lower do not.
        assert_eq!(
            mv.read(&key, 4),
            ReadResult::Versioned(ValueVersion::new(3, 0), U256::from(100))
        );
        assert_eq!(mv.read(&key, 3), ReadResult::Storage);
    }

    #[test]
    fn test_latest_lower_writer_wins() {
        let mv = MVHashMap::new();
        let key = StateKey::balance(Address::repeat_byte(7));
        mv.publish(1, 0, &[write(key, 10)]);
        mv.publish(5, 2, &[write(key, 50)]);

        assert_eq!(
            mv.read(&key, 4),
            ReadResult::Versioned(ValueVersion::new(1, 0), U256::from(10))
        );
        assert_eq!(
            mv.read(&key, 9),
            ReadResult::Versioned(ValueVersion::new(5, 2), U256::from(50))
        );
    }

    #[test]
    fn test_estimate_reports_dependency() {
        let mv = MVHashMap::new();
        let key = StateKey::nonce(Address::repeat_byte(7));
        mv.publish(2, 0, &[write(key, 1)]);
        mv.mark_estimate(2);

        assert_eq!(mv.read(&key, 7), ReadResult::Dependency(2));

        // Re-execution replaces the estimate.
        mv.publish(2, 1, &[write(key, 1)]);
        assert_eq!(
            mv.read(&key, 7),
            ReadResult::Versioned(ValueVersion::new(2, 1), U256::from(1))
        );
    }

    #[test]
    fn test_republish_drops_stale_keys() {
        let mv = MVHashMap::new();
        let a = StateKey::balance(Address::repeat_byte(1));
        let b = StateKey::balance(Address::repeat_byte(2));
        mv.publish(4, 0, &[write(a, 1), write(b, 2)]);
        mv.publish(4, 1, &[write(a, 3)]);

        assert_eq!(mv.read(&b, 10), ReadResult::Storage);
        assert_eq!(
            mv.read(&a, 10),
            ReadResult::Versioned(ValueVersion::new(4, 1), U256::from(3))
        );
    }

    #[test]
    fn test_remove_after_commit() {
        let mv = MVHashMap::new();
        let key = StateKey::balance(Address::repeat_byte(7));
        mv.publish(1, 0, &[write(key, 10)]);
        assert_eq!(mv.len(), 1);

        mv.remove(1);
        assert!(mv.is_empty());
        assert_eq!(mv.read(&key, 2), ReadResult::Storage);
    }
}
