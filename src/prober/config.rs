//! Probe configuration consumed by the prober controller.
//!
//! The configuration is a single YAML document loaded at startup. It is a
//! template: the `namespace` field is left empty in the file and filled in
//! by the cluster controller for each managed namespace. Validation happens
//! once at load time; a worker is never started with an invalid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatchdogError};

/// Reference to a scalable workload, resolvable through API discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    /// API version in `group/version` form, or a bare `version` for the
    /// core group
    pub api_version: String,
    /// Workload kind, typically `Deployment`
    pub kind: String,
    /// Workload name within the probed namespace
    pub name: String,
}

/// Split an apiVersion string into its group and version parts.
///
/// `"apps/v1"` yields `("apps", "v1")`; a bare `"v1"` yields `("", "v1")`.
pub fn parse_api_version(api_version: &str) -> Result<(&str, &str)> {
    let mut parts = api_version.splitn(2, '/');
    match (parts.next(), parts.next()) {
        (Some(version), None) if !version.is_empty() => Ok(("", version)),
        (Some(group), Some(version)) if !group.is_empty() && !version.is_empty() => {
            Ok((group, version))
        }
        _ => Err(WatchdogError::Configuration(format!(
            "apiVersion {:?} does not parse as group/version",
            api_version
        ))),
    }
}

/// Scaling parameters for one direction (up or down) of one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleInfo {
    /// Ordering level. Lower levels scale before higher levels; entries at
    /// the same level scale concurrently.
    pub level: u32,

    /// Delay before the scale action runs, once its turn has come
    #[serde(default)]
    pub initial_delay_seconds: u64,

    /// Bound on the scale update portion of the action
    #[serde(default = "default_resource_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Target replica count for this direction
    pub replicas: i32,
}

/// One workload the prober scales, with independent up and down orderings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependentResourceInfo {
    /// The workload reference
    #[serde(rename = "ref")]
    pub resource_ref: ResourceRef,
    /// Parameters applied when external reachability recovers
    pub scale_up_info: ScaleInfo,
    /// Parameters applied when external reachability is lost
    pub scale_down_info: ScaleInfo,
}

/// Validated probe configuration for one managed namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConfig {
    /// Namespace the prober operates in. Left empty in the config file and
    /// filled in by the cluster controller.
    #[serde(default)]
    pub namespace: String,

    /// Name of the Secret holding the kubeconfig that reaches the tenant
    /// API server directly
    pub internal_kubeconfig_secret_ref: String,

    /// Name of the Secret holding the kubeconfig that reaches the tenant
    /// API server through the load-balanced path
    pub external_kubeconfig_secret_ref: String,

    /// Interval between probe rounds
    #[serde(default = "default_probe_interval_seconds")]
    pub probe_interval_seconds: u64,

    /// Timeout for a single health check
    #[serde(default = "default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,

    /// Delay before the first probe round after worker start
    #[serde(default = "default_initial_delay_seconds")]
    pub initial_delay_seconds: u64,

    /// Fraction of the probe interval used to jitter round scheduling
    #[serde(default = "default_backoff_jitter_factor")]
    pub backoff_jitter_factor: f64,

    /// Consecutive successes before an endpoint counts as healthy
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Consecutive failures before an endpoint counts as unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Workloads scaled on threshold transitions, in dependency order
    pub dependent_resource_infos: Vec<DependentResourceInfo>,
}

fn default_probe_interval_seconds() -> u64 {
    10
}

fn default_probe_timeout_seconds() -> u64 {
    30
}

fn default_initial_delay_seconds() -> u64 {
    30
}

fn default_backoff_jitter_factor() -> f64 {
    0.2
}

fn default_success_threshold() -> u32 {
    1
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_resource_timeout_seconds() -> u64 {
    10
}

impl ProbeConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_seconds)
    }

    /// Check the invariants the rest of the prober relies on. Violations
    /// are reported together rather than one at a time.
    pub fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();

        if self.internal_kubeconfig_secret_ref.trim().is_empty() {
            problems.push("internalKubeconfigSecretRef must not be empty".to_string());
        }
        if self.external_kubeconfig_secret_ref.trim().is_empty() {
            problems.push("externalKubeconfigSecretRef must not be empty".to_string());
        }
        if self.success_threshold < 1 {
            problems.push("successThreshold must be at least 1".to_string());
        }
        if self.failure_threshold < 1 {
            problems.push("failureThreshold must be at least 1".to_string());
        }
        if !(self.backoff_jitter_factor > 0.0 && self.backoff_jitter_factor <= 1.0) {
            problems.push(format!(
                "backoffJitterFactor must be in (0, 1], found {}",
                self.backoff_jitter_factor
            ));
        }
        if self.dependent_resource_infos.is_empty() {
            problems.push("dependentResourceInfos must not be empty".to_string());
        }
        for info in &self.dependent_resource_infos {
            if info.resource_ref.kind.trim().is_empty() {
                problems.push(format!(
                    "resource {:?} must have a kind",
                    info.resource_ref.name
                ));
            }
            if info.resource_ref.name.trim().is_empty() {
                problems.push("resource references must have a name".to_string());
            }
            if let Err(err) = parse_api_version(&info.resource_ref.api_version) {
                problems.push(err.to_string());
            }
            for scale_info in [&info.scale_up_info, &info.scale_down_info] {
                if scale_info.replicas < 0 {
                    problems.push(format!(
                        "resource {:?} must not have negative target replicas",
                        info.resource_ref.name
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(WatchdogError::Configuration(problems.join("; ")))
        }
    }
}

/// Load and validate a probe configuration file.
pub fn load_config(path: &Path) -> Result<ProbeConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        WatchdogError::Configuration(format!(
            "failed to read probe config {}: {}",
            path.display(),
            e
        ))
    })?;
    let config: ProbeConfig = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn resource_ref(name: &str) -> ResourceRef {
        ResourceRef {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: name.to_string(),
        }
    }

    pub(crate) fn dependent_resource_info(
        name: &str,
        scale_up_level: u32,
        scale_down_level: u32,
        scale_up_replicas: i32,
        scale_down_replicas: i32,
    ) -> DependentResourceInfo {
        DependentResourceInfo {
            resource_ref: resource_ref(name),
            scale_up_info: ScaleInfo {
                level: scale_up_level,
                initial_delay_seconds: 0,
                timeout_seconds: 10,
                replicas: scale_up_replicas,
            },
            scale_down_info: ScaleInfo {
                level: scale_down_level,
                initial_delay_seconds: 0,
                timeout_seconds: 10,
                replicas: scale_down_replicas,
            },
        }
    }

    pub(crate) fn valid_config() -> ProbeConfig {
        ProbeConfig {
            namespace: "shoot--test".to_string(),
            internal_kubeconfig_secret_ref: "shoot-access-internal".to_string(),
            external_kubeconfig_secret_ref: "shoot-access-external".to_string(),
            probe_interval_seconds: default_probe_interval_seconds(),
            probe_timeout_seconds: default_probe_timeout_seconds(),
            initial_delay_seconds: default_initial_delay_seconds(),
            backoff_jitter_factor: default_backoff_jitter_factor(),
            success_threshold: default_success_threshold(),
            failure_threshold: default_failure_threshold(),
            dependent_resource_infos: vec![dependent_resource_info(
                "kube-controller-manager",
                0,
                0,
                1,
                0,
            )],
        }
    }

    #[test]
    fn test_parse_api_version_grouped() {
        assert_eq!(parse_api_version("apps/v1").unwrap(), ("apps", "v1"));
    }

    #[test]
    fn test_parse_api_version_core_group() {
        assert_eq!(parse_api_version("v1").unwrap(), ("", "v1"));
    }

    #[test]
    fn test_parse_api_version_rejects_malformed() {
        assert!(parse_api_version("").is_err());
        assert!(parse_api_version("/v1").is_err());
        assert!(parse_api_version("apps/").is_err());
    }

    #[test]
    fn test_config_defaults_from_yaml() {
        let yaml = r#"
internalKubeconfigSecretRef: internal
externalKubeconfigSecretRef: external
dependentResourceInfos:
  - ref:
      apiVersion: apps/v1
      kind: Deployment
      name: kube-controller-manager
    scaleUpInfo:
      level: 0
      replicas: 1
    scaleDownInfo:
      level: 0
      replicas: 0
"#;
        let config: ProbeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.probe_interval_seconds, 10);
        assert_eq!(config.probe_timeout_seconds, 30);
        assert_eq!(config.initial_delay_seconds, 30);
        assert_eq!(config.success_threshold, 1);
        assert_eq!(config.failure_threshold, 3);
        assert!((config.backoff_jitter_factor - 0.2).abs() < f64::EPSILON);

        let info = &config.dependent_resource_infos[0];
        assert_eq!(info.scale_up_info.initial_delay_seconds, 0);
        assert_eq!(info.scale_up_info.timeout_seconds, 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_accepts_well_formed_config() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_dependents() {
        let mut config = valid_config();
        config.dependent_resource_infos.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dependentResourceInfos"));
    }

    #[test]
    fn test_validate_rejects_zero_thresholds() {
        let mut config = valid_config();
        config.success_threshold = 0;
        config.failure_threshold = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("successThreshold"));
        assert!(err.contains("failureThreshold"));
    }

    #[test]
    fn test_validate_rejects_bad_api_version() {
        let mut config = valid_config();
        config.dependent_resource_infos[0].resource_ref.api_version = "apps/".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_jitter() {
        let mut config = valid_config();
        config.backoff_jitter_factor = 0.0;
        assert!(config.validate().is_err());
        config.backoff_jitter_factor = 1.5;
        assert!(config.validate().is_err());
    }
}
