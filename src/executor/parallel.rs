//! Parallel replay through the speculative scheduler.
//!
//! Wraps [`parallel_exec::ParallelExecutor`] in the [`Executor`] trait used
//! by the CLI and benchmarks. Execution runs against a versioned in-memory
//! store seeded from the workload; the committed state is converted back
//! into a revm database afterwards.

use crate::executor::{ExecutionResult, Executor};
use crate::interpreter::TransferInterpreter;
use crate::Workload;
use alloy_primitives::{Address, U256};
use parallel_exec::{CancelToken, ExecutorConfig, InMemoryStore, ParallelExecutor, StateField};
use revm::database::{CacheDB, EmptyDB};
use revm::primitives::KECCAK_EMPTY;
use revm::state::AccountInfo;
use std::collections::BTreeMap;
use tracing::debug;

/// Parallel replay executor.
///
/// Transactions run speculatively on `num_threads` workers and commit in
/// order, so the result is identical to a sequential replay.
#[derive(Debug, Clone)]
pub struct ParallelReplayExecutor {
    pub config: ExecutorConfig,
    pub interpreter: TransferInterpreter,
    pub cancel: CancelToken,
}

impl ParallelReplayExecutor {
    /// Creates a parallel executor with the specified number of threads.
    pub fn new(num_threads: usize, verify_signatures: bool) -> Self {
        Self {
            config: ExecutorConfig::with_threads(num_threads),
            interpreter: TransferInterpreter::new(verify_signatures),
            cancel: CancelToken::never(),
        }
    }

    pub fn with_block_reward(mut self, block_reward: U256) -> Self {
        self.interpreter = self.interpreter.with_block_reward(block_reward);
        self
    }

    pub fn with_profile(mut self, profile: bool) -> Self {
        self.config.profile = profile;
        self
    }

    /// Stops the replay early when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Folds committed state keys back into per-account info.
fn to_cache_db(store: &InMemoryStore) -> CacheDB<EmptyDB> {
    let mut accounts: BTreeMap<Address, AccountInfo> = BTreeMap::new();
    for (key, value) in store.snapshot() {
        let info = accounts.entry(key.address).or_insert_with(|| AccountInfo {
            balance: U256::ZERO,
            nonce: 0,
            code_hash: KECCAK_EMPTY,
            code: None,
        });
        match key.field {
            StateField::Balance => info.balance = value,
            StateField::Nonce => info.nonce = u64::try_from(value).unwrap_or(u64::MAX),
            StateField::Slot(_) => {}
        }
    }

    let mut db = CacheDB::new(EmptyDB::default());
    for (address, info) in accounts {
        db.insert_account_info(address, info);
    }
    db
}

impl Executor for ParallelReplayExecutor {
    type Database = CacheDB<EmptyDB>;

    fn execute(
        &self,
        _db: Self::Database,
        workload: &Workload,
    ) -> eyre::Result<(Self::Database, ExecutionResult)> {
        // The pre-state is rebuilt from the workload genesis.
        let store = InMemoryStore::with_genesis(workload.genesis());
        let executor = ParallelExecutor::new(self.config.clone());

        let mut logs = 0;
        let outcome = executor.execute(
            &workload.blocks,
            0,
            &store,
            &self.interpreter,
            &self.cancel,
            |result| {
                if let Ok(output) = &result.outcome {
                    logs += output.logs.len();
                }
            },
        )?;
        debug!(logs, commits = store.commit_count(), "parallel replay committed");

        let result = ExecutionResult {
            successful: outcome.successful,
            failed: outcome.failed,
            executions: outcome.executions,
            aborts: outcome.aborts,
            conflicts: outcome.conflicts,
            duration: outcome.duration,
            report: outcome.report,
        };

        Ok((to_cache_db(&store), result))
    }

    fn name(&self) -> &'static str {
        "parallel"
    }
}
