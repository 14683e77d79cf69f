//! Prober subsystem: per-namespace dual-endpoint API server probing with
//! dependency-ordered scaling of the namespace's workloads.

pub mod config;
pub mod probe;
pub mod scaler;

pub use config::{load_config, DependentResourceInfo, ProbeConfig, ResourceRef, ScaleInfo};
pub use probe::{ApiServerProber, ProbeStatus, Prober, ScalingState, SecretKubeconfigProber};
pub use scaler::{
    DeploymentScaler, KubeWorkloadAccess, WorkloadAccess, WorkloadScaler,
    IGNORE_SCALING_ANNOTATION,
};

use crate::registry::WorkerRegistry;

/// Registry of probers keyed by namespace.
pub type ProberManager = WorkerRegistry<Prober>;
