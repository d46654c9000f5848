//! Cooperative cancellation and pause primitives shared by the scheduler
//! and the step executor. Hand-rolled on `tokio::sync` primitives already
//! in the dependency tree, rather than pulling in `tokio-util` for the one
//! `CancellationToken` type this needs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};

/// A single cancellation flag, cloneable and shareable down into every
/// batch, device run, and handler call spawned from one scheduler tick (or
/// one interactive `stop` command).
#[derive(Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel()` has been called; for use in `select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A global pause switch. Cooperative suspension points call `wait()`,
/// which blocks while paused and returns immediately otherwise.
pub struct PauseGate {
    paused: AtomicBool,
    notify: Notify,
}

impl PauseGate {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Blocks until the gate is open. Registers for notification *before*
    /// checking `paused` so a `resume()` landing between the check and the
    /// await can't be missed — `Notify` only guarantees delivery to waiters
    /// already registered when `notify_waiters` runs.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.paused.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}
