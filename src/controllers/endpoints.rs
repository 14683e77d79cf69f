//! Endpoints controller
//!
//! Watches the endpoints of the configured services. When a service's
//! endpoints transition from empty to non-empty, any running weeder for
//! that service is cancelled and a fresh one installed, so the watch
//! duration always counts from the most recent recovery.

use crate::controllers::error_policy_backoff;
use crate::error::{Result, WatchdogError};
use crate::weeder::{weeder_key, KubePodDeleter, PodDeleter, Weeder, WeederConfig, WeederManager};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

/// Context for the endpoints controller
pub struct EndpointsController {
    client: Client,
    config: Arc<WeederConfig>,
    deleter: Arc<dyn PodDeleter>,
    manager: Arc<WeederManager>,
    last_ready: Mutex<HashMap<String, bool>>,
}

impl EndpointsController {
    /// Create a new endpoints controller from a validated weeder config.
    pub fn new(client: Client, config: WeederConfig) -> Self {
        Self {
            deleter: Arc::new(KubePodDeleter::new(client.clone())),
            manager: Arc::new(WeederManager::new()),
            config: Arc::new(config),
            client,
            last_ready: Mutex::new(HashMap::new()),
        }
    }

    /// The registry of weeders owned by this controller.
    pub fn manager(&self) -> &Arc<WeederManager> {
        &self.manager
    }

    /// Run the endpoints controller until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let endpoints: Api<Endpoints> = Api::all(self.client.clone());

        info!("Starting endpoints controller");

        Controller::new(endpoints, Config::default())
            .shutdown_on_signal()
            .run(
                |endpoints, ctx| async move { ctx.reconcile(endpoints).await },
                |_endpoints, error, _ctx| {
                    error!("Reconciliation error: {:?}", error);
                    error_policy_backoff(_endpoints, error, _ctx)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!("Reconciled endpoints: {}", obj.name);
                    }
                    Err(e) => {
                        error!("Reconciliation failed: {:?}", e);
                    }
                }
            })
            .await;

        Ok(())
    }

    async fn reconcile(
        &self,
        endpoints: Arc<Endpoints>,
    ) -> std::result::Result<Action, WatchdogError> {
        let name = endpoints.name_any();
        let Some(selectors) = self.config.services_and_dependant_selectors.get(&name) else {
            // not a service this weeder cares about
            return Ok(Action::await_change());
        };
        let namespace = endpoints
            .namespace()
            .unwrap_or_else(|| "default".to_string());

        let key = weeder_key(&namespace, &name);
        let ready = has_ready_addresses(&endpoints);
        if observe_readiness(&self.last_ready, &key, ready) {
            info!(
                namespace,
                service = %name,
                "endpoints transitioned from empty to non-empty, installing weeder"
            );
            // cancel-and-replace on re-trigger
            self.manager.unregister(&key);
            let weeder = Weeder::new(
                &namespace,
                &name,
                selectors.clone(),
                self.client.clone(),
                self.deleter.clone(),
            );
            self.manager.register(weeder);
        }
        Ok(Action::await_change())
    }
}

/// True if any subset of the endpoints carries at least one ready address.
pub(crate) fn has_ready_addresses(endpoints: &Endpoints) -> bool {
    endpoints
        .subsets
        .as_ref()
        .map(|subsets| {
            subsets
                .iter()
                .any(|s| s.addresses.as_ref().is_some_and(|a| !a.is_empty()))
        })
        .unwrap_or(false)
}

/// Record the observed readiness for `key` and report whether this
/// observation is an empty to non-empty transition. A service never seen
/// before counts as previously empty.
pub(crate) fn observe_readiness(
    seen: &Mutex<HashMap<String, bool>>,
    key: &str,
    ready: bool,
) -> bool {
    let mut seen = seen.lock().unwrap();
    let previous = seen.insert(key.to_string(), ready).unwrap_or(false);
    ready && !previous
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset};

    fn endpoints_with_addresses(count: usize) -> Endpoints {
        Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(
                    (0..count)
                        .map(|i| EndpointAddress {
                            ip: format!("10.0.0.{}", i + 1),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn test_has_ready_addresses() {
        assert!(!has_ready_addresses(&Endpoints::default()));
        assert!(!has_ready_addresses(&endpoints_with_addresses(0)));
        assert!(has_ready_addresses(&endpoints_with_addresses(1)));
    }

    #[test]
    fn test_observe_readiness_detects_only_rising_edges() {
        let seen = Mutex::new(HashMap::new());

        // first observation of a ready service is a transition
        assert!(observe_readiness(&seen, "ns/etcd-main", true));
        // staying ready is not
        assert!(!observe_readiness(&seen, "ns/etcd-main", true));
        // going empty is not
        assert!(!observe_readiness(&seen, "ns/etcd-main", false));
        // recovering again is
        assert!(observe_readiness(&seen, "ns/etcd-main", true));
    }

    #[test]
    fn test_observe_readiness_keys_are_independent() {
        let seen = Mutex::new(HashMap::new());
        assert!(observe_readiness(&seen, "ns1/etcd-main", true));
        assert!(observe_readiness(&seen, "ns2/etcd-main", true));
    }

    #[test]
    fn test_first_observation_of_empty_service_is_not_a_transition() {
        let seen = Mutex::new(HashMap::new());
        assert!(!observe_readiness(&seen, "ns/etcd-main", false));
        assert!(observe_readiness(&seen, "ns/etcd-main", true));
    }
}
