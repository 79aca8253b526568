//! Scheduler coordinating speculative execution of a window of tasks.
//!
//! All bookkeeping (status sets, dependency edges, incarnations, parked tasks)
//! sits behind a single lock. Workers and the commit loop only hold it for
//! the duration of one transition; the dispatch queue is always called after
//! the lock is released.

use crate::dispatch::DispatchQueue;
use crate::mvhashmap::MVHashMap;
use crate::report::DependencyGraph;
use crate::status::StatusManager;
use crate::task::{Task, TaskResult};
use crate::types::{ExecutionStatus, Incarnation, TxNum, Version};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

pub struct Scheduler {
    first_tx_num: TxNum,
    num_tasks: usize,
    state: Mutex<SchedulerState>,
}

struct SchedulerState {
    status: StatusManager,
    incarnations: Vec<Incarnation>,
    /// Tasks that have been started and not yet committed.
    tasks: HashMap<usize, Task>,
    /// Tasks waiting for a blocker to commit.
    parked: HashMap<usize, Task>,
    /// Index of the next task to commit.
    committed: usize,
    executions: usize,
    aborts: usize,
    conflicts: usize,
    graph: DependencyGraph,
}

impl Scheduler {
    /// Creates a scheduler for `num_tasks` tasks numbered from `first_tx_num`.
    pub fn new(num_tasks: usize, first_tx_num: TxNum) -> Self {
        Self {
            first_tx_num,
            num_tasks,
            state: Mutex::new(SchedulerState {
                status: StatusManager::new(num_tasks),
                incarnations: vec![0; num_tasks],
                tasks: HashMap::new(),
                parked: HashMap::new(),
                committed: 0,
                executions: 0,
                aborts: 0,
                conflicts: 0,
                graph: DependencyGraph::new(num_tasks),
            }),
        }
    }

    fn index(&self, tx_num: TxNum) -> Option<usize> {
        let idx = usize::try_from(tx_num.checked_sub(self.first_tx_num)?).ok()?;
        (idx < self.num_tasks).then_some(idx)
    }

    fn window_index(&self, tx_num: TxNum) -> usize {
        match self.index(tx_num) {
            Some(idx) => idx,
            None => panic!(
                "tx_num {tx_num} outside of window [{}, {})",
                self.first_tx_num,
                self.first_tx_num + self.num_tasks as TxNum
            ),
        }
    }

    pub fn num_tasks(&self) -> usize {
        self.num_tasks
    }

    /// Marks `task` as executing and returns the incarnation of the attempt.
    ///
    /// # Panics
    /// This and the other transitions panic on a TxNum outside the window;
    /// the executor only schedules tasks it created the window for.
    pub fn start(&self, task: &Task) -> Incarnation {
        let idx = self.window_index(task.tx_num());
        let mut state = self.state.lock();
        state.status.start(idx);
        state.tasks.entry(idx).or_insert_with(|| task.clone());
        state.executions += 1;
        state.incarnations[idx]
    }

    /// The attempt finished; its result is on its way to the commit loop.
    pub fn on_executed(&self, version: Version) {
        let idx = self.window_index(version.tx_num);
        self.state.lock().status.mark_complete(idx);
    }

    /// The attempt read an estimate and must run again.
    ///
    /// If the blocker is still uncommitted the task is parked until it
    /// commits; otherwise it goes straight back to the dispatch queue.
    pub fn on_abort(&self, task: Task, dependency: Option<TxNum>, dispatch: &DispatchQueue) {
        let version = task.version();
        let idx = self.window_index(version.tx_num);
        let blocker = dependency.and_then(|tx_num| self.index(tx_num));

        let parked = {
            let mut state = self.state.lock();
            state.aborts += 1;
            state.status.clear_in_progress(idx);
            state.incarnations[idx] += 1;

            let blocked = match blocker {
                Some(blocker) if blocker < idx => {
                    state.graph.add_edge(blocker, idx);
                    blocker >= state.committed && state.status.add_dependency(blocker, idx)
                }
                _ => false,
            };

            if blocked {
                state.parked.insert(idx, task);
                None
            } else {
                state.status.push_pending(idx);
                Some(task)
            }
        };

        match parked {
            None => debug!(%version, ?dependency, "task aborted, waiting for dependency"),
            Some(task) => {
                debug!(%version, ?dependency, "task aborted, retrying");
                dispatch.retry(task);
            }
        }
    }

    /// `version` was written to the store. Releases its dependents.
    pub fn on_commit(&self, version: Version, dispatch: &DispatchQueue) {
        let idx = self.window_index(version.tx_num);
        let released: Vec<Task> = {
            let mut state = self.state.lock();
            debug_assert_eq!(idx, state.committed, "commits must be in order");
            state.committed = idx + 1;
            state.tasks.remove(&idx);

            let dependents = state.status.remove_dependency(idx);
            dependents
                .into_iter()
                .filter_map(|dependent| state.parked.remove(&dependent))
                .collect()
        };

        for task in released {
            debug!(version = %task.version(), blocker = version.tx_num, "dependency released");
            dispatch.retry(task);
        }
    }

    /// A read of `version` was found stale at commit time.
    ///
    /// Every executed result from `version` up to the end of the contiguous
    /// executed prefix may have built on the stale value: their published
    /// writes become estimates, their incarnations are bumped so results in
    /// flight are discarded, and they are queued again. Returns their TxNums.
    pub fn revalidate(
        &self,
        version: Version,
        dispatch: &DispatchQueue,
        mv: &MVHashMap,
    ) -> Vec<TxNum> {
        let idx = self.window_index(version.tx_num);
        let retried: Vec<Task> = {
            let mut state = self.state.lock();
            state.conflicts += 1;

            let range = state.status.revalidation_range(idx);
            for &tx in &range {
                state.incarnations[tx] += 1;
            }
            state.status.push_pending_set(&range);

            range
                .iter()
                .filter_map(|tx| state.tasks.get(tx).cloned())
                .collect()
        };

        let tx_nums: Vec<TxNum> = retried.iter().map(Task::tx_num).collect();
        for &tx_num in &tx_nums {
            mv.mark_estimate(tx_num);
        }
        debug!(%version, revalidated = tx_nums.len(), "read conflict at commit");

        for task in retried {
            dispatch.retry(task);
        }
        tx_nums
    }

    /// True iff `result` comes from the latest incarnation of its task.
    /// Results from outside the window are never current.
    pub fn is_current(&self, result: &TaskResult) -> bool {
        self.incarnation(result.tx_num()) == Some(result.incarnation)
    }

    /// `None` outside the window.
    pub fn incarnation(&self, tx_num: TxNum) -> Option<Incarnation> {
        let idx = self.index(tx_num)?;
        Some(self.state.lock().incarnations[idx])
    }

    /// `None` outside the window.
    pub fn status(&self, tx_num: TxNum) -> Option<ExecutionStatus> {
        let idx = self.index(tx_num)?;
        let state = self.state.lock();
        let incarnation = state.incarnations[idx];

        let status = if idx < state.committed {
            ExecutionStatus::Committed
        } else if state.status.is_in_progress(idx) {
            ExecutionStatus::Executing(incarnation)
        } else if state.status.is_complete(idx) {
            ExecutionStatus::Executed(incarnation)
        } else if state.status.is_pending(idx) {
            ExecutionStatus::Pending
        } else {
            ExecutionStatus::Blocked
        };
        Some(status)
    }

    /// True once every task of the window has committed.
    pub fn is_done(&self) -> bool {
        self.state.lock().committed >= self.num_tasks
    }

    /// Dependencies discovered from aborts so far.
    pub fn dependency_graph(&self) -> DependencyGraph {
        self.state.lock().graph.clone()
    }

    /// Gets statistics about execution progress.
    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        let committed = state.committed;

        SchedulerStats {
            pending: state.status.pending_len(),
            executing: state.status.in_progress_len(),
            executed: state.status.count_complete().saturating_sub(committed),
            blocked: state.parked.len(),
            committed,
            total_incarnations: state.incarnations.iter().map(|inc| inc + 1).sum(),
            executions: state.executions,
            aborts: state.aborts,
            conflicts: state.conflicts,
        }
    }
}

/// Statistics about scheduler state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub pending: usize,
    pub executing: usize,
    pub executed: usize,
    pub blocked: usize,
    pub committed: usize,
    pub total_incarnations: usize,
    /// Attempts started, including re-executions.
    pub executions: usize,
    pub aborts: usize,
    /// Reads found stale at commit time.
    pub conflicts: usize,
}
