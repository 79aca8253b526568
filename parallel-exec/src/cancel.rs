//! Cancellation and wake-up primitives shared by the queues.
//!
//! Both are built on crossbeam channels so that blocking calls can wait on a
//! queue and on cancellation in one `select!`.

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::Arc;

/// Owner side of a cancellation signal.
///
/// Cancelling drops the only sender; every [`CancelToken`] receiver then
/// reports disconnection, which makes it permanently ready in `select!`.
#[derive(Clone)]
pub struct Canceller {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Canceller {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                tx: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    /// Fires the signal. Safe to call multiple times.
    pub fn cancel(&self) {
        self.inner.tx.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.tx.lock().is_none()
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.inner.rx.clone(),
        }
    }
}

impl Default for Canceller {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation signal, passed to every blocking call.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: Receiver<()>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        CancelToken {
            rx: channel::never(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Receiver that becomes ready once cancelled; for use in `select!`.
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// Level-triggered wake-up with a single pending notification.
///
/// `notify` never blocks; a notification sent while nobody waits is kept
/// until the next wait, so no wake-up is lost.
pub(crate) struct Signal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Signal {
    pub(crate) fn new() -> Self {
        let (tx, rx) = channel::bounded(1);
        Self { tx, rx }
    }

    pub(crate) fn notify(&self) {
        let _ = self.tx.try_send(());
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}
