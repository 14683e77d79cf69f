//! Consumed custom resources.
//!
//! The watchdog does not own these definitions; it watches the `Cluster`
//! resource maintained by the control plane provisioner and only models
//! the fields it reads.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster is the parent object driving the lifecycle of a prober.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Cluster",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Whether the tenant control plane is hibernated. A hibernated
    /// cluster has its API server scaled down on purpose, so probing it
    /// would only produce false alarms.
    #[serde(default)]
    pub hibernated: bool,
}

/// Lifecycle state of a parent object, as seen by the dispatchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Active,
    Hibernated,
    Deleted,
}

/// Derive the lifecycle state from the object itself. A set deletion
/// timestamp counts as deleted even while finalizers hold the object.
pub fn cluster_state(cluster: &Cluster) -> ClusterState {
    if cluster.metadata.deletion_timestamp.is_some() {
        ClusterState::Deleted
    } else if cluster.spec.hibernated {
        ClusterState::Hibernated
    } else {
        ClusterState::Active
    }
}
