//! Dispatch queue feeding tasks to workers.
//!
//! Two inputs are multiplexed into one blocking `next`:
//!
//! - fresh tasks, supplied by the producer in ascending TxNum order through a
//!   bounded channel (the producer blocks when workers fall behind);
//! - retried tasks, pushed in any order onto a TxNum-ordered min-heap.
//!
//! Retries always preempt fresh work: a retried task already paid for one
//! failed attempt and usually has its blocker committed by now.

use crate::cancel::{CancelToken, Signal};
use crate::error::{Result, SchedulerError};
use crate::task::{MinByTxNum, Task};
use crate::types::TxNum;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

pub struct DispatchQueue {
    fresh_tx: RwLock<Option<Sender<Task>>>,
    fresh_rx: Receiver<Task>,
    retries: Mutex<Retries>,
    /// Notified on every retry so blocked `next` calls re-check the heap.
    wake: Signal,
    capacity: usize,
    closed: AtomicBool,
}

#[derive(Default)]
struct Retries {
    heap: BinaryHeap<MinByTxNum<Task>>,
    /// Fresh tasks taken off the channel while retries were waiting.
    deferred: VecDeque<Task>,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        Self {
            fresh_tx: RwLock::new(Some(tx)),
            fresh_rx: rx,
            retries: Mutex::new(Retries::default()),
            wake: Signal::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Adds a task that was never executed. Blocks while the buffer is full.
    ///
    /// Tasks must be added in ascending TxNum order; the queue does not sort
    /// fresh work.
    pub fn add(&self, task: Task, cancel: &CancelToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }
        let sender = self
            .fresh_tx
            .read()
            .clone()
            .ok_or(SchedulerError::Closed)?;

        crossbeam::select! {
            send(sender, task) -> res => res.map_err(|_| SchedulerError::Closed),
            recv(cancel.receiver()) -> _ => Err(SchedulerError::Cancelled),
        }
    }

    /// Returns a conflicted task for re-execution. Never blocks.
    pub fn retry(&self, task: Task) {
        trace!(tx_num = task.tx_num(), "retry queued");
        self.retries.lock().heap.push(MinByTxNum(task));
        self.wake.notify();
    }

    /// Blocks until a task is available.
    ///
    /// Fails with `Cancelled` once cancellation is observed, or `Closed` once
    /// the queue is closed and both inputs are drained.
    pub fn next(&self, cancel: &CancelToken) -> Result<Task> {
        loop {
            if cancel.is_cancelled() {
                return Err(SchedulerError::Cancelled);
            }
            if let Some(task) = self.pop_ready() {
                return Ok(task);
            }

            crossbeam::select! {
                recv(self.fresh_rx) -> msg => match msg {
                    Ok(task) => return Ok(self.prefer_retry(task)),
                    Err(_) => return self.pop_ready().ok_or(SchedulerError::Closed),
                },
                recv(self.wake.receiver()) -> _ => continue,
                recv(cancel.receiver()) -> _ => return Err(SchedulerError::Cancelled),
            }
        }
    }

    /// Stops accepting fresh tasks. Safe to call multiple times.
    ///
    /// Retries already queued, or added later, are still handed out.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fresh_tx.write().take();
        self.wake.notify();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Pops the lowest retry, else the oldest deferred fresh task.
    fn pop_ready(&self) -> Option<Task> {
        let mut retries = self.retries.lock();
        if let Some(MinByTxNum(task)) = retries.heap.pop() {
            if !retries.heap.is_empty() {
                // Pass the wake-up on so another idle worker takes the rest.
                self.wake.notify();
            }
            return Some(task);
        }
        retries.deferred.pop_front()
    }

    /// A fresh task arrived; hand out a retry instead if one raced in.
    fn prefer_retry(&self, fresh: Task) -> Task {
        let mut retries = self.retries.lock();
        match retries.heap.pop() {
            Some(MinByTxNum(task)) => {
                retries.deferred.push_back(fresh);
                self.wake.notify();
                task
            }
            None => fresh,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fresh_len(&self) -> usize {
        self.fresh_rx.len() + self.retries.lock().deferred.len()
    }

    pub fn retries_len(&self) -> usize {
        self.retries.lock().heap.len()
    }

    pub fn len(&self) -> usize {
        self.fresh_len() + self.retries_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// TxNums of queued retries, ascending.
    pub fn retry_tx_nums(&self) -> Vec<TxNum> {
        let mut tx_nums: Vec<TxNum> = self
            .retries
            .lock()
            .heap
            .iter()
            .map(|t| t.0.tx_num())
            .collect();
        tx_nums.sort_unstable();
        tx_nums
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::Canceller;
    use crate::task::test_utils::tx_task;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fresh_tasks_in_order() {
        let queue = DispatchQueue::new(4);
        let cancel = CancelToken::never();
        for tx_num in 0..3 {
            queue.add(tx_task(tx_num), &cancel).unwrap();
        }
        assert_eq!(queue.len(), 3);

        for expected in 0..3 {
            assert_eq!(queue.next(&cancel).unwrap().tx_num(), expected);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_retry_preempts_fresh() {
        let queue = DispatchQueue::new(4);
        let cancel = CancelToken::never();

        // The fresh task has the lower TxNum, the retry still wins.
        queue.add(tx_task(2), &cancel).unwrap();
        queue.retry(tx_task(7));

        assert_eq!(queue.next(&cancel).unwrap().tx_num(), 7);
        assert_eq!(queue.next(&cancel).unwrap().tx_num(), 2);
    }

    #[test]
    fn test_racing_retry_preempts_fresh() {
        let cancel = CancelToken::never();
        for round in 0..100u64 {
            let queue = DispatchQueue::new(4);
            let barrier = std::sync::Barrier::new(2);
            // Alternate which side carries the lower TxNum.
            let (fresh, retried) = if round % 2 == 0 { (3, 9) } else { (9, 3) };

            thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    queue.add(tx_task(fresh), &cancel).unwrap();
                });
                s.spawn(|| {
                    barrier.wait();
                    queue.retry(tx_task(retried));
                });
            });

            assert_eq!(queue.next(&cancel).unwrap().tx_num(), retried, "round {round}");
            assert_eq!(queue.next(&cancel).unwrap().tx_num(), fresh, "round {round}");
        }
    }

    #[test]
    fn test_retries_pop_lowest_first() {
        let queue = DispatchQueue::new(4);
        let cancel = CancelToken::never();
        for tx_num in [9, 4, 6] {
            queue.retry(tx_task(tx_num));
        }
        assert_eq!(queue.retry_tx_nums(), vec![4, 6, 9]);

        let order: Vec<TxNum> = (0..3).map(|_| queue.next(&cancel).unwrap().tx_num()).collect();
        assert_eq!(order, vec![4, 6, 9]);
    }

    #[test]
    fn test_retry_wakes_blocked_next() {
        let queue = Arc::new(DispatchQueue::new(4));
        let worker = {
            let queue = queue.clone();
            thread::spawn(move || queue.next(&CancelToken::never()).map(|t| t.tx_num()))
        };

        thread::sleep(Duration::from_millis(20));
        queue.retry(tx_task(11));
        assert_eq!(worker.join().unwrap(), Ok(11));
    }

    #[test]
    fn test_close_is_idempotent_and_drains_retries() {
        let queue = DispatchQueue::new(4);
        let cancel = CancelToken::never();
        queue.add(tx_task(0), &cancel).unwrap();
        queue.retry(tx_task(5));

        queue.close();
        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.add(tx_task(1), &cancel), Err(SchedulerError::Closed));

        // A retry pushed after close is still handed out.
        queue.retry(tx_task(3));

        assert_eq!(queue.next(&cancel).unwrap().tx_num(), 3);
        assert_eq!(queue.next(&cancel).unwrap().tx_num(), 5);
        assert_eq!(queue.next(&cancel).unwrap().tx_num(), 0);
        assert!(matches!(queue.next(&cancel), Err(SchedulerError::Closed)));
    }

    #[test]
    fn test_cancel_unblocks_next_and_add() {
        let queue = Arc::new(DispatchQueue::new(1));
        let canceller = Canceller::new();

        queue.add(tx_task(0), &canceller.token()).unwrap();
        let producer = {
            let queue = queue.clone();
            let token = canceller.token();
            // Buffer is full, so this blocks until cancelled.
            thread::spawn(move || queue.add(tx_task(1), &token))
        };

        let empty = Arc::new(DispatchQueue::new(1));
        let worker = {
            let empty = empty.clone();
            let token = canceller.token();
            thread::spawn(move || empty.next(&token).map(|t| t.tx_num()))
        };

        thread::sleep(Duration::from_millis(20));
        canceller.cancel();

        assert_eq!(producer.join().unwrap(), Err(SchedulerError::Cancelled));
        assert_eq!(worker.join().unwrap(), Err(SchedulerError::Cancelled));
        assert!(matches!(
            queue.add(tx_task(2), &canceller.token()),
            Err(SchedulerError::Cancelled)
        ));
    }
}
