//! Parallel executor: one producer, a worker pool and the in-order commit loop.

use crate::cancel::{CancelToken, Canceller};
use crate::dispatch::DispatchQueue;
use crate::error::{ExecError, Result, SchedulerError};
use crate::mvhashmap::MVHashMap;
use crate::report::{self, ExecutionStat};
use crate::results::ResultsQueue;
use crate::scheduler::Scheduler;
use crate::store::StateStore;
use crate::task::{block_tasks, BlockContext, Interpreter, Task, TaskKind, TaskResult};
use crate::types::{TxNum, ValueVersion};
use crate::worker::{CancelOnPanic, Worker};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Configuration for parallel execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads.
    pub num_threads: usize,
    /// Fresh tasks buffered ahead of the workers.
    pub dispatch_capacity: usize,
    /// Results buffered ahead of the commit loop.
    pub results_capacity: usize,
    /// Soft limit on results swept into the reorder heap at once.
    pub results_limit: usize,
    /// Record per-task timings and build the dependency report.
    pub profile: bool,
}

impl ExecutorConfig {
    pub fn with_threads(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        Self {
            num_threads,
            dispatch_capacity: num_threads * 4,
            results_capacity: num_threads * 8,
            results_limit: num_threads,
            profile: false,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let threads = thread::available_parallelism().map_or(4, |n| n.get());
        Self::with_threads(threads)
    }
}

/// Result of executing a batch of blocks.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Tasks committed, pseudo-tasks included.
    pub committed: usize,
    /// Transactions that took effect.
    pub successful: usize,
    /// Transactions included without effect.
    pub failed: usize,
    pub gas_used: u64,
    /// Total number of attempts (including re-executions).
    pub executions: usize,
    pub aborts: usize,
    pub conflicts: usize,
    pub duration: Duration,
    /// Dependency report, when profiling.
    pub report: Vec<String>,
}

/// Shared state of one batch.
struct Batch {
    scheduler: Scheduler,
    dispatch: DispatchQueue,
    results: ResultsQueue,
    mv: MVHashMap,
    first_tx_num: TxNum,
    num_tasks: usize,
}

impl Batch {
    fn new(config: &ExecutorConfig, num_tasks: usize, first_tx_num: TxNum) -> Self {
        Self {
            scheduler: Scheduler::new(num_tasks, first_tx_num),
            dispatch: DispatchQueue::new(config.dispatch_capacity.max(1)),
            results: ResultsQueue::new(config.results_capacity.max(1), config.results_limit.max(1)),
            mv: MVHashMap::new(),
            first_tx_num,
            num_tasks,
        }
    }
}

/// Parallel speculative executor.
pub struct ParallelExecutor {
    config: ExecutorConfig,
}

impl ParallelExecutor {
    /// Creates a new parallel executor.
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Executes `blocks`, whose first task has TxNum `first_tx_num`, and
    /// commits every task to `store` in TxNum order.
    ///
    /// `on_commit` sees each result right after it reached the store. On
    /// error the committed prefix stays in the store.
    pub fn execute<S, I, F>(
        &self,
        blocks: &[Arc<BlockContext>],
        first_tx_num: TxNum,
        store: &S,
        interpreter: &I,
        cancel: &CancelToken,
        on_commit: F,
    ) -> Result<BatchOutcome>
    where
        S: StateStore,
        I: Interpreter,
        F: FnMut(&TaskResult),
    {
        let mut tasks = Vec::new();
        let mut tx_num = first_tx_num;
        for block in blocks {
            tasks.extend(block_tasks(block.clone(), tx_num));
            tx_num += block.task_count();
        }

        let batch = Batch::new(&self.config, tasks.len(), first_tx_num);
        self.run(&batch, tasks, store, interpreter, cancel, on_commit)
    }

    fn run<S, I, F>(
        &self,
        batch: &Batch,
        tasks: Vec<Task>,
        store: &S,
        interpreter: &I,
        cancel: &CancelToken,
        on_commit: F,
    ) -> Result<BatchOutcome>
    where
        S: StateStore,
        I: Interpreter,
        F: FnMut(&TaskResult),
    {
        let epoch = Instant::now();
        if tasks.is_empty() {
            return Ok(BatchOutcome::default());
        }
        // At least one worker, whatever the config says.
        let num_threads = self.config.num_threads.max(1);
        info!(
            tasks = tasks.len(),
            threads = num_threads,
            first_tx_num = batch.first_tx_num,
            "starting parallel execution"
        );

        // Fired on external cancellation, fatal errors, worker panics and
        // once the commit loop is done.
        let shutdown = Canceller::new();
        let token = shutdown.token();

        let (committed, panicked) = thread::scope(|s| {
            let shutdown = &shutdown;
            let token = &token;

            s.spawn(move || {
                crossbeam::select! {
                    recv(cancel.receiver()) -> _ => shutdown.cancel(),
                    recv(token.receiver()) -> _ => {}
                }
            });

            let producer = s.spawn(move || {
                let _guard = CancelOnPanic(shutdown);
                for task in tasks {
                    batch.dispatch.add(task, token)?;
                }
                Ok::<_, SchedulerError>(())
            });

            let workers: Vec<_> = (0..num_threads)
                .map(|id| {
                    let worker = Worker {
                        id,
                        interpreter: interpreter.clone(),
                        scheduler: &batch.scheduler,
                        dispatch: &batch.dispatch,
                        results: &batch.results,
                        mv: &batch.mv,
                        store,
                        cancel: token.clone(),
                        epoch,
                    };
                    s.spawn(move || {
                        let _guard = CancelOnPanic(shutdown);
                        worker.run()
                    })
                })
                .collect();

            let committed = self.commit_loop(batch, store, cancel, token, epoch, on_commit);

            batch.dispatch.close();
            batch.results.close();
            shutdown.cancel();

            match producer.join() {
                Ok(Err(e)) => trace!(error = %e, "producer stopped early"),
                Ok(Ok(())) => {}
                Err(_) => warn!("producer panicked"),
            }

            let mut panicked = None;
            for (id, handle) in workers.into_iter().enumerate() {
                match handle.join() {
                    Ok(Ok(executed)) => trace!(worker = id, executed, "worker joined"),
                    Ok(Err(e)) => warn!(worker = id, error = %e, "worker failed"),
                    Err(_) => {
                        panicked.get_or_insert(id);
                    }
                }
            }

            (committed, panicked)
        });

        if let Some(id) = panicked {
            return Err(SchedulerError::WorkerPanicked(id));
        }
        let (mut outcome, timings) = committed?;

        let stats = batch.scheduler.stats();
        outcome.executions = stats.executions;
        outcome.aborts = stats.aborts;
        outcome.conflicts = stats.conflicts;
        outcome.duration = epoch.elapsed();

        if self.config.profile {
            let graph = batch.scheduler.dependency_graph();
            report::report(&graph, &timings, |line| outcome.report.push(line));
        }

        info!(
            committed = outcome.committed,
            executions = outcome.executions,
            aborts = outcome.aborts,
            conflicts = outcome.conflicts,
            duration = ?outcome.duration,
            "parallel execution finished"
        );
        Ok(outcome)
    }

    /// Commits results strictly in TxNum order until the window is done.
    fn commit_loop<S, F>(
        &self,
        batch: &Batch,
        store: &S,
        cancel: &CancelToken,
        token: &CancelToken,
        epoch: Instant,
        mut on_commit: F,
    ) -> Result<(BatchOutcome, HashMap<usize, ExecutionStat>)>
    where
        S: StateStore,
        F: FnMut(&TaskResult),
    {
        let end = batch.first_tx_num + batch.num_tasks as TxNum;
        let mut next = batch.first_tx_num;
        let mut outcome = BatchOutcome::default();
        let mut timings = HashMap::new();

        while next < end {
            batch.results.drain(token)?;

            while let Some(tx_num) = batch.results.peek_tx_num() {
                if cancel.is_cancelled() || token.is_cancelled() {
                    return Err(SchedulerError::Cancelled);
                }
                if tx_num > next {
                    break;
                }
                let Some(result) = batch.results.pop_next() else {
                    break;
                };
                if tx_num < next || !batch.scheduler.is_current(&result) {
                    trace!(tx_num, incarnation = result.incarnation, "dropping stale result");
                    continue;
                }

                let version = result.version();
                let output = match &result.outcome {
                    Ok(output) => output,
                    Err(ExecError::Fatal(reason)) => {
                        return Err(SchedulerError::Fatal {
                            version,
                            reason: reason.clone(),
                        });
                    }
                    Err(ExecError::Abort { .. }) => unreachable!("aborts are retried by workers"),
                };

                let stale = result
                    .reads
                    .iter()
                    .find(|read| store.read(&read.key, next).version != read.version);
                if let Some(read) = stale {
                    debug!(%version, key = %read.key, "stale read at commit");
                    batch.scheduler.revalidate(version, &batch.dispatch, &batch.mv);
                    continue;
                }

                store.commit(ValueVersion::new(next, result.incarnation), &result.writes);
                batch.mv.remove(next);
                batch.scheduler.on_commit(version, &batch.dispatch);

                if result.task.kind() == TaskKind::Tx {
                    if output.failed {
                        outcome.failed += 1;
                    } else {
                        outcome.successful += 1;
                    }
                }
                outcome.gas_used += output.gas_used;

                if self.config.profile {
                    let tx_idx = (next - batch.first_tx_num) as usize;
                    timings.insert(
                        tx_idx,
                        ExecutionStat {
                            tx_idx,
                            incarnation: result.incarnation,
                            start: result.started.as_nanos() as u64,
                            end: result.finished.as_nanos() as u64,
                            worker: result.worker,
                        },
                    );
                }

                on_commit(&result);
                outcome.committed += 1;
                next += 1;

                if outcome.committed % 1000 == 0 {
                    info!(
                        committed = outcome.committed,
                        total = batch.num_tasks,
                        elapsed = ?epoch.elapsed(),
                        "commit progress"
                    );
                }
            }
        }

        Ok((outcome, timings))
    }
}
