//! Per-service weeder worker.
//!
//! A weeder is installed when a service's endpoints transition from empty
//! to non-empty. It runs one pod watcher per configured selector and lets
//! them weed out crash-looping dependents until the watch duration
//! elapses or the worker is unregistered, whichever comes first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::registry::Worker;
use crate::weeder::config::{selector_to_query, DependantSelectors};
use crate::weeder::watcher::{PodDeleter, PodWatcher};

/// Registry key for the weeder of `service_name` in `namespace`.
pub fn weeder_key(namespace: &str, service_name: &str) -> String {
    format!("{}/{}", namespace, service_name)
}

/// Weeding worker for one `(namespace, service)` pair.
///
/// Cheap to clone; clones share the cancellation token and closed flag.
#[derive(Clone)]
pub struct Weeder {
    namespace: String,
    endpoints_name: String,
    selectors: Arc<DependantSelectors>,
    client: Client,
    deleter: Arc<dyn PodDeleter>,
    token: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl Weeder {
    pub fn new(
        namespace: &str,
        endpoints_name: &str,
        selectors: DependantSelectors,
        client: Client,
        deleter: Arc<dyn PodDeleter>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            endpoints_name: endpoints_name.to_string(),
            selectors: Arc::new(selectors),
            client,
            deleter,
            token: CancellationToken::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn endpoints_name(&self) -> &str {
        &self.endpoints_name
    }

    async fn run(self) {
        info!(
            namespace = %self.namespace,
            service = %self.endpoints_name,
            watch_duration = ?self.selectors.watch_duration(),
            "starting weeder"
        );

        let mut handles = Vec::with_capacity(self.selectors.pod_selectors.len());
        for selector in &self.selectors.pod_selectors {
            // selectors were validated at config load time
            let selector_query = match selector_to_query(selector) {
                Ok(query) => query,
                Err(err) => {
                    error!(
                        namespace = %self.namespace,
                        service = %self.endpoints_name,
                        error = %err,
                        "skipping selector that does not compile"
                    );
                    continue;
                }
            };
            let watcher = PodWatcher {
                namespace: self.namespace.clone(),
                service_name: self.endpoints_name.clone(),
                selector_query,
                client: self.client.clone(),
                deleter: self.deleter.clone(),
                token: self.token.clone(),
            };
            handles.push(tokio::spawn(watcher.run()));
        }

        tokio::select! {
            _ = self.token.cancelled() => {
                debug!(
                    namespace = %self.namespace,
                    service = %self.endpoints_name,
                    "weeder cancelled"
                );
            }
            _ = tokio::time::sleep(self.selectors.watch_duration()) => {
                debug!(
                    namespace = %self.namespace,
                    service = %self.endpoints_name,
                    "watch duration elapsed, stopping pod watchers"
                );
                self.token.cancel();
            }
        }

        for handle in handles {
            let _ = handle.await;
        }
        self.closed.store(true, Ordering::SeqCst);
        info!(
            namespace = %self.namespace,
            service = %self.endpoints_name,
            "weeder closed"
        );
    }
}

impl Worker for Weeder {
    fn key(&self) -> String {
        weeder_key(&self.namespace, &self.endpoints_name)
    }

    fn start(&self) {
        let weeder = self.clone();
        tokio::spawn(async move { weeder.run().await });
    }

    fn cancel(&self) {
        self.token.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
