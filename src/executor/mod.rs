//! Replay strategies for a [`Workload`]: the revm baseline and the
//! speculative parallel replay.

mod parallel;
mod sequential;

pub use parallel::ParallelReplayExecutor;
pub use sequential::SequentialExecutor;

use crate::Workload;
use std::time::Duration;

/// Counters of one replay.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub successful: usize,
    /// Included without effect, e.g. a bad nonce or insufficient funds.
    pub failed: usize,
    /// Total number of execution attempts, including re-executions.
    pub executions: usize,
    /// Attempts aborted on a dependency.
    pub aborts: usize,
    /// Reads found stale at commit time.
    pub conflicts: usize,
    pub duration: Duration,
    /// Dependency report lines, when profiling.
    pub report: Vec<String>,
}

impl ExecutionResult {
    pub fn total(&self) -> usize {
        self.successful + self.failed
    }

    /// Transactions per second over the measured duration.
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.total() as f64 / secs
        }
    }
}

/// Trait for different replay strategies.
///
/// Every strategy consumes a revm database holding the pre-state and
/// returns one holding the post-state, so results can be compared
/// account by account.
pub trait Executor {
    type Database: revm::Database + revm::DatabaseCommit;

    /// Replays the workload on the given database.
    ///
    /// # Returns
    /// A tuple of (final database state, execution result).
    fn execute(
        &self,
        db: Self::Database,
        workload: &Workload,
    ) -> eyre::Result<(Self::Database, ExecutionResult)>;

    /// Label used in CLI output.
    fn name(&self) -> &'static str {
        "unknown"
    }
}
