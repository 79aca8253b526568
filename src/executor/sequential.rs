//! Reference replay through revm, one transaction after another.

use revm::{
    context::TxEnv,
    database::{CacheDB, EmptyDB},
    primitives::TxKind,
    Context, ExecuteCommitEvm, MainBuilder, MainContext,
};
use std::time::Instant;
use tracing::{debug, info};

use super::{ExecutionResult, Executor};
use crate::interpreter::{GAS_PRICE, TRANSFER_GAS};
use crate::Workload;

/// Replays every block in order on a single mainnet revm instance.
///
/// Parallel replays are checked against its nonces.
///
/// ```
/// use replay_node::{Executor, SequentialExecutor, Workload, WorkloadConfig};
///
/// let workload = Workload::generate(WorkloadConfig::default());
/// let (_db, result) = SequentialExecutor::new(true)
///     .execute(workload.create_db(), &workload)
///     .unwrap();
/// assert_eq!(result.total(), 100);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialExecutor {
    /// Recover each sender before executing; a mismatch aborts the replay.
    pub verify_signatures: bool,
}

impl SequentialExecutor {
    pub fn new(verify_signatures: bool) -> Self {
        Self { verify_signatures }
    }
}

impl Executor for SequentialExecutor {
    type Database = CacheDB<EmptyDB>;

    fn execute(
        &self,
        db: Self::Database,
        workload: &Workload,
    ) -> eyre::Result<(Self::Database, ExecutionResult)> {
        let started = Instant::now();
        let (mut successful, mut failed) = (0, 0);
        let mut evm = Context::mainnet().with_db(db).build_mainnet();

        for block in &workload.blocks {
            for tx in &block.transactions {
                if self.verify_signatures && !tx.verify_signature() {
                    eyre::bail!(
                        "invalid signature for transaction from {} in block {}",
                        tx.from,
                        block.number
                    );
                }

                let env = TxEnv {
                    caller: tx.from,
                    kind: TxKind::Call(tx.to),
                    value: tx.value,
                    gas_limit: TRANSFER_GAS,
                    gas_price: GAS_PRICE as u128,
                    nonce: tx.nonce,
                    chain_id: Some(workload.config.chain_id),
                    ..Default::default()
                };

                // Validation errors (bad nonce, no funds) leave state untouched.
                match evm.transact_commit(env) {
                    Ok(outcome) if outcome.is_success() => successful += 1,
                    Ok(_) => failed += 1,
                    Err(err) => {
                        debug!(
                            from = %tx.from,
                            nonce = tx.nonce,
                            error = ?err,
                            "transaction rejected"
                        );
                        failed += 1;
                    }
                }
            }
        }

        let result = ExecutionResult {
            successful,
            failed,
            executions: successful + failed,
            duration: started.elapsed(),
            ..Default::default()
        };
        info!(successful, failed, duration = ?result.duration, "sequential replay finished");

        Ok((evm.ctx.journaled_state.database, result))
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkloadConfig;
    use alloy_primitives::Address;
    use revm::Database;
    use std::sync::Arc;

    fn small_workload() -> Workload {
        Workload::generate(WorkloadConfig {
            num_accounts: 10,
            num_transactions: 5,
            transactions_per_block: 2,
            seed: 42,
            ..Default::default()
        })
    }

    #[test]
    fn test_all_transfers_succeed() {
        let workload = small_workload();
        for verify in [true, false] {
            let (mut db, result) = SequentialExecutor::new(verify)
                .execute(workload.create_db(), &workload)
                .unwrap();
            assert_eq!((result.successful, result.failed), (5, 0));

            let sender = workload.blocks[0].transactions[0].from;
            let sent = workload.transactions().filter(|tx| tx.from == sender).count() as u64;
            assert_eq!(db.basic(sender).unwrap().unwrap().nonce, sent);
        }
    }

    #[test]
    fn test_wrong_nonce_counts_as_failed() {
        let mut workload = small_workload();
        let mut block = (*workload.blocks[0]).clone();
        block.transactions[0].nonce = 7;
        workload.blocks[0] = Arc::new(block);

        // Signatures no longer match the tampered nonce, so skip recovery.
        let (_, result) = SequentialExecutor::new(false)
            .execute(workload.create_db(), &workload)
            .unwrap();
        assert!(result.failed >= 1);
        assert_eq!(result.total(), 5);
    }

    #[test]
    fn test_forged_sender_is_an_error() {
        let mut workload = small_workload();
        let mut block = (*workload.blocks[1]).clone();
        block.transactions[0].from = Address::repeat_byte(0x11);
        workload.blocks[1] = Arc::new(block);

        let err = SequentialExecutor::new(true)
            .execute(workload.create_db(), &workload)
            .unwrap_err();
        assert!(err.to_string().contains("block 2"), "{err}");
    }
}
