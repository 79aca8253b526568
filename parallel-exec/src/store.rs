//! Versioned, append-only store of committed state.
//!
//! Structure: StateKey -> BTreeMap<TxNum -> (Incarnation, value)>, on top of a
//! base (genesis) map. A read "before N" observes every commit with a lower
//! TxNum and nothing else, so a reader bound to any version sees a stable
//! snapshot while the commit loop keeps appending.

use crate::types::{Incarnation, StateKey, TxNum, ValueVersion, VersionedWrite};
use alloy_primitives::U256;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Value read from the store together with the attempt that committed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredValue {
    /// `None` for base state or a key that was never written.
    pub version: Option<ValueVersion>,
    pub value: U256,
}

/// Committed state as seen by workers and the commit loop.
pub trait StateStore: Send + Sync {
    /// Reads the latest value committed by a task with TxNum `< before`.
    fn read(&self, key: &StateKey, before: TxNum) -> StoredValue;

    /// Durably applies the write set of one committed task.
    fn commit(&self, version: ValueVersion, writes: &[VersionedWrite]);

    /// Reads the latest committed value.
    fn latest(&self, key: &StateKey) -> StoredValue {
        self.read(key, TxNum::MAX)
    }
}

/// In-memory [`StateStore`].
#[derive(Default)]
pub struct InMemoryStore {
    base: DashMap<StateKey, U256>,
    versions: DashMap<StateKey, BTreeMap<TxNum, (Incarnation, U256)>>,
    /// Number of commits applied, for diagnostics.
    commits: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with base state.
    pub fn with_genesis(genesis: impl IntoIterator<Item = (StateKey, U256)>) -> Self {
        let store = Self::new();
        for (key, value) in genesis {
            store.base.insert(key, value);
        }
        store
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Acquire)
    }

    /// Latest committed value of every key, sorted by key.
    pub fn snapshot(&self) -> Vec<(StateKey, U256)> {
        let mut result: BTreeMap<StateKey, U256> =
            self.base.iter().map(|e| (*e.key(), *e.value())).collect();

        for entry in self.versions.iter() {
            if let Some((_, (_, value))) = entry.value().iter().next_back() {
                result.insert(*entry.key(), *value);
            }
        }

        result.into_iter().collect()
    }
}

impl StateStore for InMemoryStore {
    fn read(&self, key: &StateKey, before: TxNum) -> StoredValue {
        if let Some(versions) = self.versions.get(key) {
            if let Some((tx_num, (incarnation, value))) = versions.range(..before).next_back() {
                return StoredValue {
                    version: Some(ValueVersion::new(*tx_num, *incarnation)),
                    value: *value,
                };
            }
        }

        StoredValue {
            version: None,
            value: self.base.get(key).map(|v| *v).unwrap_or(U256::ZERO),
        }
    }

    fn commit(&self, version: ValueVersion, writes: &[VersionedWrite]) {
        for write in writes {
            let previous = self
                .versions
                .entry(write.key)
                .or_default()
                .insert(version.tx_num, (version.incarnation, write.value));
            debug_assert!(
                previous.is_none(),
                "{} committed twice at {}",
                write.key,
                version.tx_num
            );
        }
        self.commits.fetch_add(1, Ordering::AcqRel);
    }
}
