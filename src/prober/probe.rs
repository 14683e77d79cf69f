//! Per-namespace prober worker.
//!
//! A prober runs an infinite loop that performs one probe round every
//! (jittered) probe interval. Each round health-checks the tenant API
//! server through two paths: the "internal" kubeconfig reaches it
//! directly, the "external" one goes through the load-balanced path the
//! workloads also use. Only the combination of both results is
//! meaningful: both healthy means the tenant API is fine, internal-only
//! healthy means the load-balanced path is down and dependent workloads
//! must be scaled down before they trample the cluster with retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::{Result, WatchdogError};
use crate::prober::config::ProbeConfig;
use crate::prober::scaler::DeploymentScaler;
use crate::registry::Worker;
use crate::retry::sleep_with_cancel;

/// Key inside a kubeconfig Secret holding the serialized kubeconfig.
const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

/// Issues one health check against the tenant API server, reached through
/// the kubeconfig stored in the named Secret.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApiServerProber: Send + Sync {
    async fn probe(&self, kubeconfig_secret_name: &str) -> Result<()>;
}

/// Production prober: resolves the kubeconfig Secret in the worker's
/// namespace, builds a short-lived client from it and lists namespaces
/// with a tiny limit as the health check.
pub struct SecretKubeconfigProber {
    client: Client,
    namespace: String,
    probe_timeout: Duration,
}

impl SecretKubeconfigProber {
    pub fn new(client: Client, namespace: &str, probe_timeout: Duration) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            probe_timeout,
        }
    }
}

#[async_trait]
impl ApiServerProber for SecretKubeconfigProber {
    async fn probe(&self, kubeconfig_secret_name: &str) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = secrets.get(kubeconfig_secret_name).await?;
        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
            .ok_or_else(|| {
                WatchdogError::Configuration(format!(
                    "secret {}/{} has no {:?} key",
                    self.namespace, kubeconfig_secret_name, KUBECONFIG_SECRET_KEY
                ))
            })?;
        let yaml = std::str::from_utf8(&raw.0).map_err(|e| {
            WatchdogError::Configuration(format!(
                "kubeconfig in secret {}/{} is not valid UTF-8: {}",
                self.namespace, kubeconfig_secret_name, e
            ))
        })?;
        let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|e| {
            WatchdogError::Configuration(format!(
                "failed to parse kubeconfig from secret {}/{}: {}",
                self.namespace, kubeconfig_secret_name, e
            ))
        })?;
        let mut config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                WatchdogError::Configuration(format!(
                    "failed to build client config from secret {}/{}: {}",
                    self.namespace, kubeconfig_secret_name, e
                ))
            })?;
        config.connect_timeout = Some(self.probe_timeout);
        config.read_timeout = Some(self.probe_timeout);
        let client = Client::try_from(config)?;

        let namespaces: Api<Namespace> = Api::all(client);
        match tokio::time::timeout(
            self.probe_timeout,
            namespaces.list(&ListParams::default().limit(1)),
        )
        .await
        {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(WatchdogError::Probe(format!(
                "health check through secret {}/{} timed out after {:?}",
                self.namespace, kubeconfig_secret_name, self.probe_timeout
            ))),
        }
    }
}

/// Running success/failure counters for one probed endpoint. A success
/// zeroes the failure counter and vice-versa, so the counters always
/// describe the current streak.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProbeStatus {
    success_count: u32,
    failure_count: u32,
}

impl ProbeStatus {
    pub fn record_success(&mut self) {
        self.success_count = self.success_count.saturating_add(1);
        self.failure_count = 0;
    }

    pub fn record_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.success_count = 0;
    }

    pub fn is_healthy(&self, success_threshold: u32) -> bool {
        self.success_count >= success_threshold
    }

    pub fn is_unhealthy(&self, failure_threshold: u32) -> bool {
        self.failure_count >= failure_threshold
    }
}

/// Scaling state of the probed namespace. Transitions are driven solely by
/// the probe thresholds; re-entry of the current state runs nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingState {
    Unknown,
    ScalingUpDone,
    ScalingDownDone,
}

#[derive(Debug)]
struct ProberState {
    internal: ProbeStatus,
    external: ProbeStatus,
    scaling: ScalingState,
}

impl Default for ProberState {
    fn default() -> Self {
        Self {
            internal: ProbeStatus::default(),
            external: ProbeStatus::default(),
            scaling: ScalingState::Unknown,
        }
    }
}

/// Probing worker for one managed namespace.
///
/// Cheap to clone; clones share the cancellation token and closed flag.
#[derive(Clone)]
pub struct Prober {
    namespace: String,
    config: Arc<ProbeConfig>,
    probe_client: Arc<dyn ApiServerProber>,
    scaler: Arc<dyn DeploymentScaler>,
    token: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl Prober {
    pub fn new(
        namespace: &str,
        config: Arc<ProbeConfig>,
        probe_client: Arc<dyn ApiServerProber>,
        scaler: Arc<dyn DeploymentScaler>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            config,
            probe_client,
            scaler,
            token: CancellationToken::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    async fn run(self) {
        info!(namespace = %self.namespace, "starting prober");
        self.run_loop().await;
        self.closed.store(true, Ordering::SeqCst);
        info!(namespace = %self.namespace, "prober closed");
    }

    async fn run_loop(&self) {
        if sleep_with_cancel(&self.token, self.config.initial_delay())
            .await
            .is_err()
        {
            return;
        }
        let mut state = ProberState::default();
        loop {
            let wait = jittered_interval(
                self.config.probe_interval(),
                self.config.backoff_jitter_factor,
            );
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            // rounds are strictly serial; a flow invocation may outlast the
            // probe interval and the next round simply starts late
            self.probe_round(&mut state).await;
        }
    }

    async fn probe_round(&self, state: &mut ProberState) {
        match self
            .probe_client
            .probe(&self.config.internal_kubeconfig_secret_ref)
            .await
        {
            Ok(()) => state.internal.record_success(),
            Err(err) => {
                state.internal.record_failure();
                warn!(namespace = %self.namespace, error = %err, "internal probe failed");
            }
        }
        match self
            .probe_client
            .probe(&self.config.external_kubeconfig_secret_ref)
            .await
        {
            Ok(()) => state.external.record_success(),
            Err(err) => {
                state.external.record_failure();
                warn!(namespace = %self.namespace, error = %err, "external probe failed");
            }
        }

        if !state.internal.is_healthy(self.config.success_threshold) {
            // without a healthy internal view no reachability conclusion
            // can be drawn from the external probe
            debug!(namespace = %self.namespace, "internal probe not yet healthy, skipping scaling decision");
            return;
        }
        if state.external.is_unhealthy(self.config.failure_threshold) {
            self.transition(state, ScalingState::ScalingDownDone).await;
        } else if state.external.is_healthy(self.config.success_threshold) {
            self.transition(state, ScalingState::ScalingUpDone).await;
        }
    }

    async fn transition(&self, state: &mut ProberState, desired: ScalingState) {
        if state.scaling == desired {
            return;
        }
        let result = match desired {
            ScalingState::ScalingDownDone => {
                info!(
                    namespace = %self.namespace,
                    "external endpoint unreachable while internal is healthy, scaling down dependents"
                );
                self.scaler.scale_down(self.token.clone()).await
            }
            ScalingState::ScalingUpDone => {
                info!(
                    namespace = %self.namespace,
                    "external endpoint reachable again, scaling up dependents"
                );
                self.scaler.scale_up(self.token.clone()).await
            }
            ScalingState::Unknown => return,
        };
        match result {
            Ok(()) => {
                state.scaling = desired;
                info!(namespace = %self.namespace, state = ?desired, "scale flow completed");
            }
            Err(err) => {
                error!(
                    namespace = %self.namespace,
                    error = %err,
                    "scale flow failed, will re-attempt on the next probe round"
                );
            }
        }
    }
}

impl Worker for Prober {
    fn key(&self) -> String {
        self.namespace.clone()
    }

    fn start(&self) {
        let prober = self.clone();
        tokio::spawn(async move { prober.run().await });
    }

    fn cancel(&self) {
        self.token.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn jittered_interval(interval: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return interval;
    }
    let jitter = rand::thread_rng().gen_range(0.0..jitter_factor);
    interval.mul_f64(1.0 + jitter)
}
