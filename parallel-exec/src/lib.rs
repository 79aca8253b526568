//! Parallel speculative execution of ordered transactions.
//!
//! Tasks (a block-start pseudo-task, one task per transaction and a block-end
//! pseudo-task per block) are executed optimistically by a pool of workers
//! and committed strictly in TxNum order by a single commit loop, so the
//! final state is exactly the state of a sequential replay.
//!
//! # Core Components
//!
//! - **DispatchQueue**: fresh tasks in TxNum order plus a retry heap that
//!   always preempts fresh work
//! - **ResultsQueue**: reorders completed attempts by TxNum for the commit loop
//! - **StatusManager / Scheduler**: pending, in-progress and complete sets,
//!   dependency edges between tasks, incarnations
//! - **MVHashMap**: speculative writes of finished attempts, with estimates
//!   for tasks being re-executed
//! - **StateStore**: versioned committed state; reads are validated against
//!   it at commit time
//! - **ParallelExecutor**: wires the producer, the workers and the commit loop
//!
//! # Algorithm Overview
//!
//! 1. The producer feeds tasks to the dispatch queue in TxNum order
//! 2. Workers execute attempts against a [`VersionedView`], recording reads
//! 3. A read of an estimate aborts the attempt; the task waits for the writer
//!    to commit, then is retried with an incremented incarnation
//! 4. Finished attempts publish their writes and go to the results queue
//! 5. The commit loop pops results in TxNum order, validates their reads,
//!    commits them or sends the affected tasks back for re-execution
//!
//! # Example
//!
//! ```rust,ignore
//! use parallel_exec::{CancelToken, ExecutorConfig, InMemoryStore, ParallelExecutor};
//!
//! let executor = ParallelExecutor::new(ExecutorConfig::with_threads(8));
//! let store = InMemoryStore::with_genesis(genesis);
//! let cancel = CancelToken::never();
//! let outcome = executor.execute(&blocks, 0, &store, &interpreter, &cancel, |_| {})?;
//!
//! println!("Successful: {}, Failed: {}", outcome.successful, outcome.failed);
//! ```

pub mod cancel;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod mvhashmap;
pub mod report;
pub mod results;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod task;
pub mod types;
pub mod view;
mod worker;

pub use cancel::{CancelToken, Canceller};
pub use dispatch::DispatchQueue;
pub use error::{ExecError, SchedulerError};
pub use executor::{BatchOutcome, ExecutorConfig, ParallelExecutor};
pub use mvhashmap::MVHashMap;
pub use results::ResultsQueue;
pub use scheduler::{Scheduler, SchedulerStats};
pub use status::StatusManager;
pub use store::{InMemoryStore, StateStore, StoredValue};
pub use task::{
    block_tasks, BlockContext, ExecOutput, Interpreter, Task, TaskKind, TaskResult, Transaction,
};
pub use types::{
    ExecutionStatus, Incarnation, Log, StateField, StateKey, TxIndex, TxNum, ValueVersion,
    Version, VersionedRead, VersionedWrite,
};
pub use view::VersionedView;
