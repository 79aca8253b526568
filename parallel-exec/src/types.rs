//! Core types for speculative execution.

use alloy_primitives::{Address, Bytes, B256, U256};
use std::fmt;

/// Global, monotonic sequence number of a task across the replayed range.
pub type TxNum = u64;

/// Position of a transaction within its block.
///
/// `-1` is the block-start pseudo-task and `len(txs)` the block-end pseudo-task.
pub type TxIndex = i64;

/// Incarnation number (how many times a task has been resubmitted).
pub type Incarnation = usize;

/// Place of a task in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub block_num: u64,
    pub tx_num: TxNum,
    pub tx_index: TxIndex,
}

impl Version {
    pub fn new(block_num: u64, tx_num: TxNum, tx_index: TxIndex) -> Self {
        Self {
            block_num,
            tx_num,
            tx_index,
        }
    }

    /// Returns the TxNum of another index of the same block.
    ///
    /// TxNums are contiguous within a block, so the offset between two indices
    /// is the offset between their TxNums.
    pub fn tx_num_of(&self, tx_index: TxIndex) -> Option<TxNum> {
        let delta = tx_index - self.tx_index;
        self.tx_num.checked_add_signed(delta)
    }

    pub fn is_block_start(&self) -> bool {
        self.tx_index == -1
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(block {}, txNum {}, txIndex {})",
            self.block_num, self.tx_num, self.tx_index
        )
    }
}

/// Which part of an account a state key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StateField {
    Balance,
    Nonce,
    Slot(B256),
}

/// A single location in the versioned state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateKey {
    pub address: Address,
    pub field: StateField,
}

impl StateKey {
    pub fn balance(address: Address) -> Self {
        Self {
            address,
            field: StateField::Balance,
        }
    }

    pub fn nonce(address: Address) -> Self {
        Self {
            address,
            field: StateField::Nonce,
        }
    }

    pub fn slot(address: Address, slot: B256) -> Self {
        Self {
            address,
            field: StateField::Slot(slot),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.field {
            StateField::Balance => write!(f, "{}.balance", self.address),
            StateField::Nonce => write!(f, "{}.nonce", self.address),
            StateField::Slot(slot) => write!(f, "{}[{}]", self.address, slot),
        }
    }
}

/// The attempt that produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueVersion {
    pub tx_num: TxNum,
    pub incarnation: Incarnation,
}

impl ValueVersion {
    pub fn new(tx_num: TxNum, incarnation: Incarnation) -> Self {
        Self {
            tx_num,
            incarnation,
        }
    }
}

/// A read observed during execution.
///
/// `version` is `None` when the value came from base (genesis) state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRead {
    pub key: StateKey,
    pub version: Option<ValueVersion>,
    pub value: U256,
}

/// A write produced during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedWrite {
    pub key: StateKey,
    pub value: U256,
}

/// A log entry emitted by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// Status of a task in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Queued for execution (fresh or retried).
    Pending,
    /// Currently executing.
    Executing(Incarnation),
    /// Finished execution, result awaiting commit.
    Executed(Incarnation),
    /// Waiting for a lower task to commit.
    Blocked,
    /// Committed to canonical state.
    Committed,
}
