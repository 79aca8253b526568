//! Per-attempt state view bound to one task's version.

use crate::error::ExecError;
use crate::mvhashmap::{MVHashMap, ReadResult};
use crate::store::StateStore;
use crate::types::{StateKey, TxNum, Version, VersionedRead, VersionedWrite};
use alloy_primitives::U256;
use std::collections::BTreeMap;

/// State reader/writer owned by a single execution attempt.
///
/// Reads consult the speculative map first and fall back to the committed
/// store, recording the version observed. Writes stay private until the
/// attempt finishes and its write set is published.
pub struct VersionedView<'a> {
    store: &'a dyn StateStore,
    mv: &'a MVHashMap,
    version: Version,
    reads: BTreeMap<StateKey, VersionedRead>,
    writes: BTreeMap<StateKey, U256>,
}

impl<'a> VersionedView<'a> {
    pub fn new(store: &'a dyn StateStore, mv: &'a MVHashMap, version: Version) -> Self {
        Self {
            store,
            mv,
            version,
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Reads `key` as seen by this task.
    ///
    /// Fails with an abort naming the writer when the closest lower write is
    /// an estimate.
    pub fn read(&mut self, key: StateKey) -> Result<U256, ExecError> {
        if let Some(value) = self.writes.get(&key) {
            return Ok(*value);
        }
        if let Some(read) = self.reads.get(&key) {
            return Ok(read.value);
        }

        let read = match self.mv.read(&key, self.tx_num()) {
            ReadResult::Versioned(version, value) => VersionedRead {
                key,
                version: Some(version),
                value,
            },
            ReadResult::Storage => {
                let stored = self.store.read(&key, self.tx_num());
                VersionedRead {
                    key,
                    version: stored.version,
                    value: stored.value,
                }
            }
            ReadResult::Dependency(blocker) => return Err(ExecError::abort(blocker)),
        };

        let value = read.value;
        self.reads.insert(key, read);
        Ok(value)
    }

    pub fn write(&mut self, key: StateKey, value: U256) {
        self.writes.insert(key, value);
    }

    /// Consumes the view, returning the read and write sets in key order.
    pub fn into_sets(self) -> (Vec<VersionedRead>, Vec<VersionedWrite>) {
        let reads = self.reads.into_values().collect();
        let writes = self
            .writes
            .into_iter()
            .map(|(key, value)| VersionedWrite { key, value })
            .collect();
        (reads, writes)
    }

    fn tx_num(&self) -> TxNum {
        self.version.tx_num
    }
}
