//! Error types for speculative execution and scheduling.

use crate::types::{TxNum, Version};

/// Error returned by one execution attempt.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// The attempt observed a value that a lower task is about to rewrite.
    ///
    /// Expected during speculation; the task is retried.
    #[error("execution aborted due to dependency {}", fmt_dependency(.dependency))]
    Abort { dependency: Option<TxNum> },
    /// Malformed task or unrecoverable interpreter fault. Never retried.
    #[error("{0}")]
    Fatal(String),
}

impl ExecError {
    pub fn abort(dependency: TxNum) -> Self {
        ExecError::Abort {
            dependency: Some(dependency),
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, ExecError::Abort { .. })
    }
}

fn fmt_dependency(dependency: &Option<TxNum>) -> String {
    match dependency {
        Some(tx_num) => tx_num.to_string(),
        None => "unknown".to_string(),
    }
}

/// Error surfaced by the queues and the commit loop.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("cancelled")]
    Cancelled,
    #[error("queue closed")]
    Closed,
    #[error("fatal error at {version}: {reason}")]
    Fatal { version: Version, reason: String },
    #[error("worker {0} panicked")]
    WorkerPanicked(usize),
}

pub type Result<T> = core::result::Result<T, SchedulerError>;
