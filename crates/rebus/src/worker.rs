//! Worker engine: per-resource serialization of request and event work.
//!
//! Each unit of work (an inbound request, a `with`-initiated task) is keyed
//! by the affinity key of its resource, by default the resource ID. The
//! engine runs one worker task per active key, started lazily on first use
//! and retired after an idle interval. Units for the same key run in FIFO
//! order on the same worker; units for different keys run concurrently.
//!
//! Workers retire only after re-checking their queue under the dispatch
//! lock, so a unit enqueued concurrently with retirement is never lost or
//! reordered.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// One unit of work, executed to completion on the owning worker.
pub(crate) type Unit = Box<dyn FnOnce() + Send + 'static>;

const DRAIN_WARN_INTERVAL: Duration = Duration::from_secs(10);

struct PoolInner {
    workers: HashMap<String, mpsc::UnboundedSender<Unit>>,
    handles: Vec<JoinHandle<()>>,
    stopped: bool,
}

/// Dispatches units of work to workers keyed by affinity key.
#[derive(Clone)]
pub(crate) struct WorkerPool {
    inner: Arc<Mutex<PoolInner>>,
    idle_timeout: Duration,
    runtime: tokio::runtime::Handle,
}

impl WorkerPool {
    /// Create a pool spawning workers on the current tokio runtime.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                workers: HashMap::new(),
                handles: Vec::new(),
                stopped: false,
            })),
            idle_timeout,
            runtime: tokio::runtime::Handle::current(),
        }
    }

    /// Enqueue a unit on the worker owning `key`, starting the worker if
    /// needed. Units enqueued after [`stop`](Self::stop) are dropped.
    pub fn enqueue(&self, key: &str, unit: Unit) {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            debug!(key, "dropping unit, worker pool is stopped");
            return;
        }
        let unit = match inner.workers.get(key) {
            Some(tx) => match tx.send(unit) {
                Ok(()) => return,
                // The worker is gone; start a fresh one below.
                Err(err) => err.0,
            },
            None => unit,
        };
        inner.workers.remove(key);
        inner.handles.retain(|h| !h.is_finished());

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(unit).is_err() {
            return;
        }
        inner.workers.insert(key.to_string(), tx);
        let worker = Worker {
            key: key.to_string(),
            pool: Arc::clone(&self.inner),
            idle_timeout: self.idle_timeout,
        };
        let handle = self.runtime.spawn(worker.run(rx));
        inner.handles.push(handle);
    }

    /// Stop accepting new units, drain every worker queue and wait for all
    /// in-flight units to complete. Handlers are never cancelled; a warning
    /// is logged while the drain is blocked on a long-running unit.
    pub async fn stop(&self) {
        let handles = {
            let mut inner = self.inner.lock().unwrap();
            inner.stopped = true;
            // Dropping the senders closes each queue; workers drain what is
            // left and exit.
            inner.workers.clear();
            std::mem::take(&mut inner.handles)
        };
        for mut handle in handles {
            loop {
                match tokio::time::timeout(DRAIN_WARN_INTERVAL, &mut handle).await {
                    Ok(_) => break,
                    Err(_) => warn!("still waiting for worker to finish during shutdown"),
                }
            }
        }
    }

    #[cfg(test)]
    fn worker_count(&self) -> usize {
        self.inner.lock().unwrap().workers.len()
    }
}

struct Worker {
    key: String,
    pool: Arc<Mutex<PoolInner>>,
    idle_timeout: Duration,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Unit>) {
        loop {
            match tokio::time::timeout(self.idle_timeout, rx.recv()).await {
                Ok(Some(unit)) => run_unit(unit),
                Ok(None) => break,
                Err(_) => {
                    // Idle: retire unless a unit raced in. The re-check
                    // happens under the dispatch lock, so a concurrent
                    // enqueue either completed before the lock was taken
                    // (the unit is visible here) or finds the worker gone
                    // and starts a new one.
                    let unit = {
                        let mut inner = self.pool.lock().unwrap();
                        match rx.try_recv() {
                            Ok(unit) => Some(unit),
                            Err(TryRecvError::Empty) => {
                                inner.workers.remove(&self.key);
                                None
                            }
                            Err(TryRecvError::Disconnected) => None,
                        }
                    };
                    match unit {
                        Some(unit) => run_unit(unit),
                        None => break,
                    }
                }
            }
        }
        // Drain anything left after the queue closed.
        while let Ok(unit) = rx.try_recv() {
            run_unit(unit);
        }
    }
}

fn run_unit(unit: Unit) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(unit)) {
        // Request units convert panics to error responses themselves; this
        // guards with-tasks and internal work so a panic never takes the
        // worker down.
        error!(
            "unhandled panic in worker unit: {}",
            crate::error::panic_message(payload)
        );
    }
}
