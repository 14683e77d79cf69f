//! Error types for the dependency-watchdog

use std::fmt;

/// Result type alias for watchdog operations
pub type Result<T> = std::result::Result<T, WatchdogError>;

/// Errors that can occur during watchdog operations
#[derive(Debug)]
pub enum WatchdogError {
    /// Kubernetes API error
    KubeApi(String),
    /// Configuration error
    Configuration(String),
    /// Serialization error
    Serialization(String),
    /// Resource not found
    NotFound(String),
    /// API server probe failure
    Probe(String),
    /// One or more tasks of a flow failed
    Flow(String),
    /// The operation was cancelled before it could complete
    Cancelled,
}

impl fmt::Display for WatchdogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchdogError::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            WatchdogError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            WatchdogError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            WatchdogError::NotFound(msg) => write!(f, "Resource not found: {}", msg),
            WatchdogError::Probe(msg) => write!(f, "Probe error: {}", msg),
            WatchdogError::Flow(msg) => write!(f, "Flow error: {}", msg),
            WatchdogError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for WatchdogError {}

impl From<kube::Error> for WatchdogError {
    fn from(err: kube::Error) -> Self {
        match err {
            // 404s become NotFound so callers can tolerate missing optional resources
            kube::Error::Api(ae) if ae.code == 404 => WatchdogError::NotFound(ae.message),
            e => WatchdogError::KubeApi(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for WatchdogError {
    fn from(err: serde_json::Error) -> Self {
        WatchdogError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for WatchdogError {
    fn from(err: serde_yaml::Error) -> Self {
        WatchdogError::Serialization(err.to_string())
    }
}
