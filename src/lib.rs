//! Dependency watchdog for a Kubernetes control plane.
//!
//! Two controllers react to the availability of critical infrastructure
//! services:
//!
//! - The **prober** health-checks each tenant API server through two
//!   paths. When the load-balanced ("external") path goes down while the
//!   direct ("internal") path stays up, it scales down a dependency-ordered
//!   set of workloads in the tenant namespace; when the external path
//!   recovers, it scales them back up in the reverse configured order.
//! - The **weeder** reacts to the endpoints of a service recovering from
//!   empty to non-empty and deletes dependent pods stuck in
//!   `CrashLoopBackOff` so their controllers restart them healthy.
//!
//! Both sit on a shared substrate: a registry of long-lived, cancellable
//! per-namespace workers ([`registry`]), a level-ordered DAG runner
//! ([`flow`]) and cancellation-aware retry helpers ([`retry`]).

pub mod controllers;
pub mod crd;
pub mod error;
pub mod flow;
pub mod leader_election;
pub mod prober;
pub mod registry;
pub mod retry;
pub mod weeder;

pub use controllers::{ClusterController, EndpointsController};
pub use crd::{cluster_state, Cluster, ClusterSpec, ClusterState};
pub use error::{Result, WatchdogError};
pub use prober::{ProbeConfig, Prober, ProberManager};
pub use registry::{Worker, WorkerRegistry};
pub use weeder::{Weeder, WeederConfig, WeederManager};
