//! Worker thread lifecycle shared by every engine.
//!
//! A [`Worker`] owns one named thread. Stopping it drops the stop sender, so
//! every blocking wait on the [`StopSignal`] wakes immediately, then joins the
//! thread with a bounded wait. All workers spawned against one
//! [`WorkerRegistry`] are counted, which lets a session prove that teardown
//! left nothing running.

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Counts live worker threads.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    active: AtomicUsize,
}

impl WorkerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(WorkerRegistry::default())
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Handed to the worker body. Never receives a value: the sender is dropped
/// to request shutdown.
#[derive(Clone)]
pub struct StopSignal {
    rx: Receiver<()>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps for `period` unless stopped first. Returns true when stopped.
    pub fn sleep(&self, period: Duration) -> bool {
        match self.rx.recv_timeout(period) {
            Err(RecvTimeoutError::Timeout) => false,
            _ => true,
        }
    }

    /// For use inside `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

struct ExitGuard {
    registry: Arc<WorkerRegistry>,
    done: Sender<()>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.registry.active.fetch_sub(1, Ordering::SeqCst);
        let _ = self.done.try_send(());
    }
}

pub struct Worker {
    name: String,
    stop_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: &str, registry: &Arc<WorkerRegistry>, body: F) -> Result<Self>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        registry.active.fetch_add(1, Ordering::SeqCst);
        let guard = ExitGuard { registry: registry.clone(), done: done_tx };
        let signal = StopSignal { rx: stop_rx };

        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _guard = guard;
            body(signal);
        });

        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                // The closure (and its guard) was dropped, so the count is already restored.
                return Err(e.into());
            }
        };

        debug!("[Worker] {} started", name);
        Ok(Worker {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            done_rx,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Signals the worker and waits up to `timeout` for it to exit.
    /// Returns false if the thread had to be detached.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.stop_tx.take();
        let Some(handle) = self.handle.take() else {
            return true;
        };

        if thread::current().id() == handle.thread().id() {
            // Stopping from inside the worker itself; it exits when the body returns.
            return true;
        }

        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!("[Worker] {} panicked", self.name);
                }
                debug!("[Worker] {} stopped", self.name);
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("[Worker] {} did not stop within {:?}; detaching", self.name, timeout);
                false
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop(DEFAULT_STOP_TIMEOUT);
        }
    }
}
