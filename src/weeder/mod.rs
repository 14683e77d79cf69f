//! Weeder subsystem: on endpoints recovery, watch dependent pods and
//! delete the ones stuck in a crash loop so their controllers restart
//! them against the now-available service.

pub mod config;
pub mod watcher;
#[allow(clippy::module_inception)]
pub mod weeder;

pub use config::{load_config, DependantSelectors, WeederConfig};
pub use watcher::{KubePodDeleter, PodDeleter};
pub use weeder::{weeder_key, Weeder};

use crate::registry::WorkerRegistry;

/// Registry of weeders keyed by `namespace/serviceName`.
pub type WeederManager = WorkerRegistry<Weeder>;
