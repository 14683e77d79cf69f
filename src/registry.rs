//! Registry of long-lived, cancellable workers keyed by namespace.
//!
//! Both the prober and the weeder manage their workers through the same
//! discipline: at most one live worker per key, install-only registration,
//! and cooperative cancellation on removal. Cancellation is asynchronous:
//! [`WorkerRegistry::unregister`] returns after removing the entry and
//! signalling the worker's token; the worker drains on its own task and
//! flips [`Worker::is_closed`] when its run loop returns.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

/// A long-lived unit of background work owned by a registry.
pub trait Worker: Clone + Send + Sync + 'static {
    /// Registry key. Workers with equal keys are considered the same worker.
    fn key(&self) -> String;

    /// Spawn the worker's run loop. Called exactly once, by the registry,
    /// right after installation.
    fn start(&self);

    /// Signal the worker's cancellation token. The worker exits its run
    /// loop cooperatively.
    fn cancel(&self);

    /// True once the worker's run loop has returned.
    fn is_closed(&self) -> bool;
}

/// Map from key to live worker. All operations are safe under concurrent
/// callers and never fail.
pub struct WorkerRegistry<W: Worker> {
    workers: Mutex<HashMap<String, W>>,
}

impl<W: Worker> WorkerRegistry<W> {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Install `worker` unless an entry for its key already exists.
    ///
    /// Returns `true` if the worker was installed and started, `false` if a
    /// prior entry is present. Never overwrites; replacement requires an
    /// explicit [`unregister`](Self::unregister) first.
    pub fn register(&self, worker: W) -> bool {
        let mut workers = self.workers.lock().unwrap();
        let key = worker.key();
        if workers.contains_key(&key) {
            debug!(key, "worker already registered, skipping");
            return false;
        }
        worker.start();
        workers.insert(key, worker);
        true
    }

    /// Cancel and remove the worker for `key`, returning whether an entry
    /// existed. The worker's resources drain asynchronously; observe
    /// completion through [`Worker::is_closed`].
    pub fn unregister(&self, key: &str) -> bool {
        let removed = self.workers.lock().unwrap().remove(key);
        match removed {
            Some(worker) => {
                worker.cancel();
                debug!(key, "worker unregistered and cancelled");
                true
            }
            None => false,
        }
    }

    /// Look up the worker for `key`.
    pub fn get_worker(&self, key: &str) -> Option<W> {
        self.workers.lock().unwrap().get(key).cloned()
    }

    /// Snapshot of all live workers, for teardown.
    pub fn get_all_workers(&self) -> Vec<W> {
        self.workers.lock().unwrap().values().cloned().collect()
    }
}

impl<W: Worker> Default for WorkerRegistry<W> {
    fn default() -> Self {
        Self::new()
    }
}
