//! Controllers dispatching cluster events to the worker registries.
//!
//! Each controller watches its parent resource and keeps the matching
//! registry population in sync: register on activation, cancel-and-replace
//! on re-trigger, unregister on hibernation or deletion.

mod cluster;
mod endpoints;

pub use cluster::ClusterController;
pub use endpoints::EndpointsController;

use crate::error::WatchdogError;
use kube::runtime::controller::Action;
use std::time::Duration;

/// Requeue policy for reconciliation failures. Reconcile here only ever
/// installs or removes workers; the workers own their operational retries,
/// so the delays follow from what each error means to the registration
/// path rather than from a generic backoff ladder.
pub(crate) fn error_policy_backoff<K>(
    _object: std::sync::Arc<K>,
    error: &WatchdogError,
    _ctx: std::sync::Arc<impl std::any::Any + Send + Sync>,
) -> Action {
    let delay = match error {
        // a cancelled reconcile belongs to a worker being torn down;
        // requeueing would only race the unregister
        WatchdogError::Cancelled => return Action::await_change(),
        // transient API trouble usually clears within one probe round
        WatchdogError::KubeApi(_) | WatchdogError::Probe(_) => Duration::from_secs(10),
        // parent objects and kubeconfig secrets are created by the
        // provisioner on its own cadence, polling faster gains nothing
        WatchdogError::NotFound(_) => Duration::from_secs(30),
        // a failed scale flow is re-attempted by the prober on its next
        // round anyway, the dispatcher keeps only a slow safety net
        WatchdogError::Flow(_) => Duration::from_secs(120),
        // invalid or unparseable configuration never heals on its own
        WatchdogError::Configuration(_) | WatchdogError::Serialization(_) => {
            Duration::from_secs(300)
        }
    };
    Action::requeue(delay)
}
