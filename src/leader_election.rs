//! Kubernetes Lease-based leader election for HA watchdog deployments.
//!
//! The prober and weeder controllers each elect on their own Lease and
//! with their own cadence. The prober leases aggressively: while its
//! leader is stalled, nobody scales a recovering control plane back up.
//! The weeder only deletes pods that the next endpoints transition would
//! catch again, so it can afford a lazier takeover. Standby replicas
//! block in [`LeaderElector::acquire`] until the current leader's lease
//! expires or shutdown is requested.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::retry::sleep_with_cancel;

/// Election cadence for one controller.
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    /// How long a held lease stays valid without renewal
    pub lease_duration: Duration,
    /// How often the holder renews
    pub renew_interval: Duration,
    /// How long a standby waits between claim attempts
    pub retry_interval: Duration,
}

impl LeaseSettings {
    /// Cadence for a controller whose leader must fail over quickly.
    ///
    /// The prober uses this: for as long as its leader is gone, a
    /// recovering control plane stays scaled down and a failing one keeps
    /// its dependents thrashing.
    pub fn fast_failover() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(2),
        }
    }

    /// Cadence for a controller that only reacts to events which recur on
    /// their own.
    ///
    /// The weeder uses this: a crash-looping pod missed during a takeover
    /// gap is picked up again on the next endpoints transition, so there
    /// is no need to churn the Lease object.
    pub fn relaxed() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Detects the namespace for leader election.
///
/// Priority: explicit argument, then the service account file, then
/// `"default"`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

/// Leader election on a named `coordination.k8s.io/v1` Lease.
///
/// Claims go through optimistic concurrency: every write that loses a
/// `resourceVersion` race simply reports "not leader" and the caller's
/// cadence decides when to try again.
pub struct LeaderElector {
    lease_api: Api<Lease>,
    lease_name: String,
    identity: String,
    settings: LeaseSettings,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, lease_name: &str, settings: LeaseSettings) -> Self {
        let lease_api = Api::<Lease>::namespaced(client, namespace);
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("watchdog-{:08x}", rand::random::<u32>()));
        info!(
            identity = %identity,
            namespace = %namespace,
            lease = %lease_name,
            renew_interval = ?settings.renew_interval,
            "Initialized leader elector"
        );
        Self {
            lease_api,
            lease_name: lease_name.to_string(),
            identity,
            settings,
        }
    }

    /// Blocks until the lease is acquired or `token` is cancelled.
    ///
    /// A shutdown while standing by returns [`WatchdogError::Cancelled`]
    /// instead of leaving the replica stuck in the claim loop.
    ///
    /// [`WatchdogError::Cancelled`]: crate::error::WatchdogError::Cancelled
    pub async fn acquire(&self, token: &CancellationToken) -> Result<()> {
        info!(identity = %self.identity, lease = %self.lease_name, "Waiting to acquire leader lease");
        loop {
            match self.try_claim().await {
                Ok(true) => {
                    info!(identity = %self.identity, lease = %self.lease_name, "Acquired leader lease");
                    return Ok(());
                }
                Ok(false) => {
                    debug!(lease = %self.lease_name, "Lease held by another instance");
                }
                Err(err) => {
                    warn!(lease = %self.lease_name, error = %err, "Lease claim attempt failed");
                }
            }
            sleep_with_cancel(token, self.settings.retry_interval).await?;
        }
    }

    /// Renews the held lease. Returns `Ok(true)` while still leader and
    /// `Ok(false)` once leadership is lost.
    pub async fn renew(&self) -> Result<bool> {
        let Some(lease) = self.lease_api.get_opt(&self.lease_name).await? else {
            return Ok(false);
        };
        if !self.holds(&lease) {
            return Ok(false);
        }
        let mut renewed = lease;
        if let Some(spec) = renewed.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        self.swap_in(&renewed).await
    }

    /// Clears the holder identity so a standby replica can take over
    /// without waiting for expiry.
    pub async fn release(&self) {
        let lease = match self.lease_api.get_opt(&self.lease_name).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return,
            Err(err) => {
                warn!(lease = %self.lease_name, error = %err, "Failed to read lease for release");
                return;
            }
        };
        if !self.holds(&lease) {
            debug!(lease = %self.lease_name, "Lease not held by us, skipping release");
            return;
        }
        let mut released = lease;
        if let Some(spec) = released.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self.swap_in(&released).await {
            Ok(_) => info!(lease = %self.lease_name, "Released leader lease"),
            Err(err) => warn!(lease = %self.lease_name, error = %err, "Failed to release leader lease"),
        }
    }

    /// The renewal cadence the holder must keep.
    pub fn renew_interval(&self) -> Duration {
        self.settings.renew_interval
    }

    fn holds(&self, lease: &Lease) -> bool {
        lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            == Some(self.identity.as_str())
    }

    /// One claim attempt: create the lease if absent, refresh it if already
    /// ours, take it over if expired, back off otherwise.
    async fn try_claim(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());
        match self.lease_api.get_opt(&self.lease_name).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.lease_name.clone()),
                        ..Default::default()
                    },
                    spec: Some(self.claim_spec(&now, None, false)),
                };
                match self.lease_api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            Some(existing) => {
                if self.holds(&existing) {
                    let mut renewed = existing.clone();
                    renewed.spec = Some(self.claim_spec(&now, existing.spec.as_ref(), false));
                    self.swap_in(&renewed).await
                } else if lease_expired(existing.spec.as_ref(), self.settings.lease_duration) {
                    let mut taken = existing.clone();
                    taken.spec = Some(self.claim_spec(&now, existing.spec.as_ref(), true));
                    self.swap_in(&taken).await
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// The LeaseSpec this instance writes when claiming. A takeover bumps
    /// the transition counter and resets the acquire time; a refresh keeps
    /// both.
    fn claim_spec(
        &self,
        now: &MicroTime,
        previous: Option<&LeaseSpec>,
        takeover: bool,
    ) -> LeaseSpec {
        let transitions = previous.and_then(|s| s.lease_transitions).unwrap_or(0);
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.settings.lease_duration.as_secs() as i32),
            acquire_time: if takeover || previous.is_none() {
                Some(now.clone())
            } else {
                previous.and_then(|s| s.acquire_time.clone())
            },
            renew_time: Some(now.clone()),
            lease_transitions: Some(if takeover { transitions + 1 } else { transitions }),
            ..Default::default()
        }
    }

    /// Replace the lease, treating a `resourceVersion` conflict as losing
    /// the race rather than an error.
    async fn swap_in(&self, lease: &Lease) -> Result<bool> {
        match self
            .lease_api
            .replace(&self.lease_name, &PostParams::default(), lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(lease = %self.lease_name, "Lost the lease update race");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// A lease is expired once its renew time is older than its advertised
/// duration. The duration recorded on the lease wins over our own
/// settings: the previous holder may run a different cadence and its
/// promise is the one other standbys are honoring too.
fn lease_expired(spec: Option<&LeaseSpec>, fallback: Duration) -> bool {
    let duration_secs = spec
        .and_then(|s| s.lease_duration_seconds)
        .map(|s| s as i64)
        .unwrap_or(fallback.as_secs() as i64);
    match spec.and_then(|s| s.renew_time.as_ref()) {
        Some(MicroTime(renewed)) => {
            Utc::now().signed_duration_since(*renewed).num_seconds() > duration_secs
        }
        None => true,
    }
}
