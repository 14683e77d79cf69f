//! Cluster controller
//!
//! Reconciles the `Cluster` parent objects and keeps one prober per
//! active tenant namespace: a prober is registered on the first reconcile
//! of an active cluster, left untouched while the cluster stays active,
//! and cancelled when the cluster hibernates or is deleted.

use crate::controllers::error_policy_backoff;
use crate::crd::{cluster_state, Cluster, ClusterState};
use crate::error::{Result, WatchdogError};
use crate::prober::{
    KubeWorkloadAccess, ProbeConfig, Prober, ProberManager, SecretKubeconfigProber,
    WorkloadScaler,
};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Context for the cluster controller
pub struct ClusterController {
    client: Client,
    probe_config: Arc<ProbeConfig>,
    // REST mappings are resolved once per process and shared by all probers
    workload_access: Arc<KubeWorkloadAccess>,
    manager: Arc<ProberManager>,
}

impl ClusterController {
    /// Create a new cluster controller from a validated probe config.
    pub fn new(client: Client, probe_config: ProbeConfig) -> Self {
        Self {
            workload_access: Arc::new(KubeWorkloadAccess::new(client.clone())),
            manager: Arc::new(ProberManager::new()),
            probe_config: Arc::new(probe_config),
            client,
        }
    }

    /// The registry of probers owned by this controller.
    pub fn manager(&self) -> &Arc<ProberManager> {
        &self.manager
    }

    /// Run the cluster controller until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let clusters: Api<Cluster> = Api::all(self.client.clone());

        info!("Starting cluster controller");

        Controller::new(clusters, Config::default())
            .shutdown_on_signal()
            .run(
                |cluster, ctx| async move { ctx.reconcile(cluster).await },
                |_cluster, error, _ctx| {
                    error!("Reconciliation error: {:?}", error);
                    error_policy_backoff(_cluster, error, _ctx)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!("Reconciled cluster: {}", obj.name);
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
        cluster: Arc<Cluster>,
    ) -> std::result::Result<Action, WatchdogError> {
        let namespace = cluster
            .namespace()
            .unwrap_or_else(|| "default".to_string());

        match cluster_state(&cluster) {
            ClusterState::Deleted => {
                if self.manager.unregister(&namespace) {
                    info!(namespace, "cluster deleted, prober unregistered");
                }
            }
            ClusterState::Hibernated => {
                if self.manager.unregister(&namespace) {
                    info!(namespace, "cluster hibernated, prober unregistered");
                }
            }
            ClusterState::Active => {
                if self.manager.get_worker(&namespace).is_none() {
                    let prober = self.new_prober(&namespace);
                    if self.manager.register(prober) {
                        info!(namespace, "prober registered");
                    }
                }
            }
        }
        Ok(Action::await_change())
    }

    fn new_prober(&self, namespace: &str) -> Prober {
        let mut config = (*self.probe_config).clone();
        config.namespace = namespace.to_string();
        let config = Arc::new(config);
        let scaler = Arc::new(WorkloadScaler::new(
            namespace,
            &config,
            self.workload_access.clone(),
        ));
        let probe_client = Arc::new(SecretKubeconfigProber::new(
            self.client.clone(),
            namespace,
            config.probe_timeout(),
        ));
        Prober::new(namespace, config, probe_client, scaler)
    }
}
