//! Worker loop: pull a task, execute one attempt, route the outcome.

use crate::cancel::{CancelToken, Canceller};
use crate::dispatch::DispatchQueue;
use crate::error::{ExecError, Result, SchedulerError};
use crate::mvhashmap::MVHashMap;
use crate::results::ResultsQueue;
use crate::scheduler::Scheduler;
use crate::store::StateStore;
use crate::task::Interpreter;
use crate::view::VersionedView;
use std::time::Instant;
use tracing::trace;

/// One member of the worker pool, owning its own interpreter.
pub(crate) struct Worker<'a, I> {
    pub(crate) id: usize,
    pub(crate) interpreter: I,
    pub(crate) scheduler: &'a Scheduler,
    pub(crate) dispatch: &'a DispatchQueue,
    pub(crate) results: &'a ResultsQueue,
    pub(crate) mv: &'a MVHashMap,
    pub(crate) store: &'a dyn StateStore,
    pub(crate) cancel: CancelToken,
    /// Start of the batch; attempt timings are offsets from it.
    pub(crate) epoch: Instant,
}

impl<I: Interpreter> Worker<'_, I> {
    /// Runs until the dispatch queue is closed and drained, or cancellation.
    ///
    /// Returns the number of attempts executed.
    pub(crate) fn run(mut self) -> Result<usize> {
        let mut executed = 0;

        loop {
            let task = match self.dispatch.next(&self.cancel) {
                Ok(task) => task,
                Err(SchedulerError::Closed | SchedulerError::Cancelled) => break,
                Err(e) => return Err(e),
            };

            let version = task.version();
            let incarnation = self.scheduler.start(&task);
            trace!(worker = self.id, %version, incarnation, "executing");

            let view = VersionedView::new(self.store, self.mv, version);
            let started = self.epoch.elapsed();
            let mut result = task.execute(&mut self.interpreter, view, incarnation);
            result.worker = self.id;
            result.started = started;
            result.finished = self.epoch.elapsed();
            executed += 1;

            match result.outcome {
                Err(ExecError::Abort { dependency }) => {
                    self.scheduler.on_abort(result.task, dependency, self.dispatch);
                    continue;
                }
                Ok(_) => {
                    self.mv.publish(version.tx_num, incarnation, &result.writes);
                    self.scheduler.on_executed(version);
                }
                // Surfaced by the commit loop once it reaches this task.
                Err(ExecError::Fatal(_)) => self.scheduler.on_executed(version),
            }

            match self.results.add(result, &self.cancel) {
                Ok(()) => {}
                Err(SchedulerError::Closed | SchedulerError::Cancelled) => break,
                Err(e) => return Err(e),
            }
        }

        trace!(worker = self.id, executed, "worker done");
        Ok(executed)
    }
}

/// Fires the batch-wide cancellation if the owning thread unwinds, so the
/// rest of the pool and the commit loop do not wait on it forever.
pub(crate) struct CancelOnPanic<'a>(pub(crate) &'a Canceller);

impl Drop for CancelOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvhashmap::ReadResult;
    use crate::store::InMemoryStore;
    use crate::task::test_utils::dummy_block;
    use crate::task::{block_tasks, BlockContext, ExecOutput, Transaction};
    use crate::types::{ExecutionStatus, StateKey, ValueVersion, Version};
    use alloy_primitives::{Address, U256};

    /// Increments the sender's balance; aborts once on the first attempt of
    /// transaction 1, citing the block-start task.
    #[derive(Clone)]
    struct Bump {
        aborted: bool,
    }

    impl Interpreter for Bump {
        fn execute_tx(
            &mut self,
            _block: &BlockContext,
            tx: &Transaction,
            version: Version,
            view: &mut VersionedView<'_>,
        ) -> std::result::Result<ExecOutput, ExecError> {
            if version.tx_index == 1 && !self.aborted {
                self.aborted = true;
                return Err(ExecError::abort(version.tx_num - 2));
            }
            let key = StateKey::balance(tx.from);
            let balance = view.read(key)?;
            view.write(key, balance + U256::from(1));
            Ok(ExecOutput::default())
        }
    }

    #[test]
    fn test_worker_routes_outcomes() {
        let tasks = block_tasks(dummy_block(0, 2), 0);
        let scheduler = Scheduler::new(tasks.len(), 0);
        let dispatch = DispatchQueue::new(8);
        let results = ResultsQueue::new(8, 8);
        let mv = MVHashMap::new();
        let store = InMemoryStore::new();
        let cancel = CancelToken::never();

        for task in tasks.iter().cloned() {
            dispatch.add(task, &cancel).unwrap();
        }
        dispatch.close();

        let worker = Worker {
            id: 3,
            interpreter: Bump { aborted: false },
            scheduler: &scheduler,
            dispatch: &dispatch,
            results: &results,
            mv: &mv,
            store: &store,
            cancel: cancel.clone(),
            epoch: Instant::now(),
        };
        // Four tasks plus one retry after the abort.
        assert_eq!(worker.run(), Ok(5));

        // The block-start task had already executed, so the retry went
        // straight back to the queue and ran again.
        assert_eq!(scheduler.stats().aborts, 1);
        assert_eq!(scheduler.status(2), Some(ExecutionStatus::Executed(1)));
        assert_eq!(
            mv.read(&StateKey::balance(Address::with_last_byte(1)), 10),
            ReadResult::Versioned(ValueVersion::new(2, 1), U256::from(1))
        );

        results.drain_non_blocking(&cancel).unwrap();
        assert_eq!(results.len(), 4);
        let first = results.pop_next().unwrap();
        assert_eq!(first.worker, 3);
        assert!(first.finished >= first.started);
    }

    #[test]
    fn test_worker_stops_on_cancel() {
        let scheduler = Scheduler::new(1, 0);
        let dispatch = DispatchQueue::new(1);
        let results = ResultsQueue::new(1, 1);
        let mv = MVHashMap::new();
        let store = InMemoryStore::new();
        let canceller = Canceller::new();
        canceller.cancel();

        let worker = Worker {
            id: 0,
            interpreter: Bump { aborted: true },
            scheduler: &scheduler,
            dispatch: &dispatch,
            results: &results,
            mv: &mv,
            store: &store,
            cancel: canceller.token(),
            epoch: Instant::now(),
        };
        assert_eq!(worker.run(), Ok(0));
    }
}
