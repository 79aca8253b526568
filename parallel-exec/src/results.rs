//! Results queue reordering completions into TxNum order.
//!
//! Workers finish in arbitrary order. Their results go through a bounded
//! channel (backpressure when the commit loop falls behind) and are swept into
//! a min-heap keyed by TxNum, from which the single commit loop pops strictly
//! in order. The key is always TxNum, never completion time or worker id.

use crate::cancel::{CancelToken, Signal};
use crate::error::{Result, SchedulerError};
use crate::task::{MinByTxNum, TaskResult};
use crate::types::TxNum;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct ResultsQueue {
    input_tx: RwLock<Option<Sender<TaskResult>>>,
    input_rx: Receiver<TaskResult>,
    heap: Mutex<BinaryHeap<MinByTxNum<TaskResult>>>,
    /// Notified whenever the heap changes outside of a drain.
    changed: Signal,
    /// Soft limit on how many results one sweep moves into the heap.
    limit: usize,
    capacity: usize,
    closed: AtomicBool,
}

impl ResultsQueue {
    pub fn new(capacity: usize, limit: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        Self {
            input_tx: RwLock::new(Some(tx)),
            input_rx: rx,
            heap: Mutex::new(BinaryHeap::new()),
            changed: Signal::new(),
            limit,
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Adds the result of an attempt. Blocks while the buffer is full.
    pub fn add(&self, result: TaskResult, cancel: &CancelToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }
        let sender = self
            .input_tx
            .read()
            .clone()
            .ok_or(SchedulerError::Closed)?;

        crossbeam::select! {
            send(sender, result) -> res => res.map_err(|_| SchedulerError::Closed),
            recv(cancel.receiver()) -> _ => Err(SchedulerError::Cancelled),
        }
    }

    /// Waits for at least one new result, then sweeps whatever else is ready.
    ///
    /// Also returns when the heap was changed through [`push`](Self::push), so
    /// a result already resident in the heap is never waited past. Returns
    /// immediately once the queue is closed and the buffer is empty.
    pub fn drain(&self, cancel: &CancelToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }

        crossbeam::select! {
            recv(self.input_rx) -> msg => match msg {
                Ok(result) => self.drain_no_block(Some(result), cancel),
                Err(_) => Ok(()),
            },
            recv(self.changed.receiver()) -> _ => Ok(()),
            recv(cancel.receiver()) -> _ => Err(SchedulerError::Cancelled),
        }
    }

    /// Sweeps ready results into the heap without waiting.
    pub fn drain_non_blocking(&self, cancel: &CancelToken) -> Result<()> {
        self.drain_no_block(None, cancel)
    }

    fn drain_no_block(&self, first: Option<TaskResult>, cancel: &CancelToken) -> Result<()> {
        let mut heap = self.heap.lock();
        if let Some(result) = first {
            heap.push(MinByTxNum(result));
        }

        while heap.len() <= self.limit {
            if cancel.is_cancelled() {
                return Err(SchedulerError::Cancelled);
            }
            match self.input_rx.try_recv() {
                Ok(result) => heap.push(MinByTxNum(result)),
                // Inside the lock, so never block here.
                Err(_) => break,
            }
        }
        Ok(())
    }

    pub fn has_next(&self) -> bool {
        !self.heap.lock().is_empty()
    }

    /// True iff the lowest queued result has TxNum `tx_num`.
    pub fn has(&self, tx_num: TxNum) -> bool {
        self.heap
            .lock()
            .peek()
            .is_some_and(|r| r.0.tx_num() == tx_num)
    }

    /// TxNum of the lowest queued result.
    pub fn peek_tx_num(&self) -> Option<TxNum> {
        self.heap.lock().peek().map(|r| r.0.tx_num())
    }

    /// Pops the lowest queued result.
    pub fn pop_next(&self) -> Option<TaskResult> {
        self.heap.lock().pop().map(|r| r.0)
    }

    /// Puts a result straight into the heap.
    pub fn push(&self, result: TaskResult) {
        self.heap.lock().push(MinByTxNum(result));
        self.changed.notify();
    }

    /// Empties the buffer and the heap, handing every result to `f`.
    pub fn drop_results(&self, mut f: impl FnMut(TaskResult)) {
        let mut heap = self.heap.lock();
        while let Ok(result) = self.input_rx.try_recv() {
            f(result);
        }
        while let Some(MinByTxNum(result)) = heap.pop() {
            f(result);
        }
    }

    /// Stops accepting results. Safe to call multiple times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.input_tx.write().take();
        self.changed.notify();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Results waiting in the heap.
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Results waiting in the input buffer.
    pub fn buffered_len(&self) -> usize {
        self.input_rx.len()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::Canceller;
    use crate::error::ExecError;
    use crate::mvhashmap::MVHashMap;
    use crate::store::InMemoryStore;
    use crate::task::test_utils::tx_task;
    use crate::task::{BlockContext, ExecOutput, Interpreter, Transaction};
    use crate::types::Version;
    use crate::view::VersionedView;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[derive(Clone)]
    struct Noop;

    impl Interpreter for Noop {
        fn execute_tx(
            &mut self,
            _block: &BlockContext,
            _tx: &Transaction,
            _version: Version,
            _view: &mut VersionedView<'_>,
        ) -> std::result::Result<ExecOutput, ExecError> {
            Ok(ExecOutput::default())
        }
    }

    fn result(tx_num: TxNum) -> TaskResult {
        let store = InMemoryStore::new();
        let mv = MVHashMap::new();
        let task = tx_task(tx_num);
        let view = VersionedView::new(&store, &mv, task.version());
        task.execute(&mut Noop, view, 0)
    }

    #[test]
    fn test_reorders_by_tx_num() {
        let queue = ResultsQueue::new(8, 8);
        let cancel = CancelToken::never();
        for tx_num in [3, 0, 2, 1] {
            queue.add(result(tx_num), &cancel).unwrap();
        }

        queue.drain(&cancel).unwrap();
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.buffered_len(), 0);

        for expected in 0..4 {
            assert!(queue.has(expected));
            assert!(!queue.has(expected + 1));
            assert_eq!(queue.pop_next().unwrap().tx_num(), expected);
        }
        assert!(!queue.has_next());
    }

    #[test]
    fn test_sweep_respects_soft_limit() {
        let queue = ResultsQueue::new(8, 2);
        let cancel = CancelToken::never();
        for tx_num in 0..6 {
            queue.add(result(tx_num), &cancel).unwrap();
        }

        queue.drain(&cancel).unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.buffered_len(), 3);

        queue.drain_non_blocking(&cancel).unwrap();
        queue.pop_next();
        queue.pop_next();
        queue.pop_next();
        queue.drain_non_blocking(&cancel).unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.buffered_len(), 0);
    }

    #[test]
    fn test_push_wakes_drain() {
        let queue = Arc::new(ResultsQueue::new(4, 4));
        let committer = {
            let queue = queue.clone();
            thread::spawn(move || queue.drain(&CancelToken::never()))
        };

        thread::sleep(Duration::from_millis(20));
        queue.push(result(4));
        assert_eq!(committer.join().unwrap(), Ok(()));
        assert!(queue.has(4));
    }

    #[test]
    fn test_cancel_unblocks_drain() {
        let queue = Arc::new(ResultsQueue::new(4, 4));
        let canceller = Canceller::new();
        let committer = {
            let queue = queue.clone();
            let token = canceller.token();
            thread::spawn(move || queue.drain(&token))
        };

        thread::sleep(Duration::from_millis(20));
        canceller.cancel();
        assert_eq!(committer.join().unwrap(), Err(SchedulerError::Cancelled));
    }

    #[test]
    fn test_close_and_drop_results() {
        let queue = ResultsQueue::new(4, 1);
        let cancel = CancelToken::never();
        queue.add(result(1), &cancel).unwrap();
        queue.add(result(2), &cancel).unwrap();
        queue.push(result(0));

        queue.close();
        queue.close();
        assert!(matches!(queue.add(result(3), &cancel), Err(SchedulerError::Closed)));

        let mut dropped = Vec::new();
        queue.drop_results(|r| dropped.push(r.tx_num()));
        dropped.sort_unstable();
        assert_eq!(dropped, vec![0, 1, 2]);
        assert!(queue.is_empty());

        // Closed and empty: drain does not block.
        assert_eq!(queue.drain(&cancel), Ok(()));
    }
}
