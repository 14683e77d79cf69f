//! Weeder configuration consumed by the endpoints controller.
//!
//! The configuration maps service names to the label selectors of the pods
//! that depend on them. When a service's endpoints recover, one pod watch
//! per selector runs for the configured watch duration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WatchdogError};

/// Dependants of one service: the pod selectors to watch and for how long.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependantSelectors {
    /// Label selectors matching the pods that depend on the service
    pub pod_selectors: Vec<LabelSelector>,

    /// How long the pod watches stay installed after an endpoints recovery
    #[serde(default = "default_watch_duration_seconds")]
    pub watch_duration_seconds: u64,
}

fn default_watch_duration_seconds() -> u64 {
    300
}

impl DependantSelectors {
    pub fn watch_duration(&self) -> Duration {
        Duration::from_secs(self.watch_duration_seconds)
    }
}

/// Validated weeder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeederConfig {
    /// Watched services and the selectors of their dependent pods
    pub services_and_dependant_selectors: BTreeMap<String, DependantSelectors>,
}

impl WeederConfig {
    /// Check that every selector compiles to a non-empty match expression.
    pub fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();
        if self.services_and_dependant_selectors.is_empty() {
            problems.push("servicesAndDependantSelectors must not be empty".to_string());
        }
        for (service, selectors) in &self.services_and_dependant_selectors {
            if selectors.pod_selectors.is_empty() {
                problems.push(format!("service {:?} has no pod selectors", service));
            }
            for selector in &selectors.pod_selectors {
                if let Err(err) = selector_to_query(selector) {
                    problems.push(format!("service {:?}: {}", service, err));
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

/// Compile a Kubernetes label selector into its query string form, e.g.
/// `app=etcd,role in (main,events)`. An empty selector is rejected: a
/// selector matching every pod in the namespace is never what a weeder
/// configuration means.
pub fn selector_to_query(selector: &LabelSelector) -> Result<String> {
    let mut terms: Vec<String> = Vec::new();

    if let Some(labels) = &selector.match_labels {
        for (key, value) in labels {
            terms.push(format!("{}={}", key, value));
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let values = expr.values.clone().unwrap_or_default();
            match expr.operator.as_str() {
                "In" => {
                    if values.is_empty() {
                        return Err(WatchdogError::Configuration(format!(
                            "selector expression on {:?} uses In without values",
                            expr.key
                        )));
                    }
                    terms.push(format!("{} in ({})", expr.key, values.join(",")));
                }
                "NotIn" => {
                    if values.is_empty() {
                        return Err(WatchdogError::Configuration(format!(
                            "selector expression on {:?} uses NotIn without values",
                            expr.key
                        )));
                    }
                    terms.push(format!("{} notin ({})", expr.key, values.join(",")));
                }
                "Exists" => terms.push(expr.key.clone()),
                "DoesNotExist" => terms.push(format!("!{}", expr.key)),
                other => {
                    return Err(WatchdogError::Configuration(format!(
                        "selector expression on {:?} has unknown operator {:?}",
                        expr.key, other
                    )));
                }
            }
        }
    }

    if terms.is_empty() {
        return Err(WatchdogError::Configuration(
            "label selector compiles to an empty match expression".to_string(),
        ));
    }
    Ok(terms.join(","))
}

/// Load and validate a weeder configuration file.
pub fn load_config(path: &Path) -> Result<WeederConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        WatchdogError::Configuration(format!(
            "failed to read weeder config {}: {}",
            path.display(),
            e
        ))
    })?;
    let config: WeederConfig = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    pub(crate) fn etcd_selector() -> LabelSelector {
        LabelSelector {
            match_labels: Some(
                [("gardener.cloud/role".to_string(), "controlplane".to_string())]
                    .into_iter()
                    .collect(),
            ),
            match_expressions: None,
        }
    }

    pub(crate) fn valid_config() -> WeederConfig {
        WeederConfig {
            services_and_dependant_selectors: [(
                "etcd-main".to_string(),
                DependantSelectors {
                    pod_selectors: vec![etcd_selector()],
                    watch_duration_seconds: default_watch_duration_seconds(),
                },
            )]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn test_selector_with_match_labels() {
        let query = selector_to_query(&etcd_selector()).unwrap();
        assert_eq!(query, "gardener.cloud/role=controlplane");
    }

    #[test]
    fn test_selector_with_expressions() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "role".to_string(),
                    operator: "In".to_string(),
                    values: Some(vec!["main".to_string(), "events".to_string()]),
                },
                LabelSelectorRequirement {
                    key: "phase".to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                },
            ]),
        };
        let query = selector_to_query(&selector).unwrap();
        assert_eq!(query, "role in (main,events),!phase");
    }

    #[test]
    fn test_empty_selector_is_rejected() {
        let selector = LabelSelector::default();
        assert!(selector_to_query(&selector).is_err());
    }

    #[test]
    fn test_in_expression_without_values_is_rejected() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "role".to_string(),
                operator: "In".to_string(),
                values: None,
            }]),
        };
        assert!(selector_to_query(&selector).is_err());
    }

    #[test]
    fn test_config_from_yaml_with_defaults() {
        let yaml = r#"
servicesAndDependantSelectors:
  etcd-main:
    podSelectors:
      - matchLabels:
          gardener.cloud/role: controlplane
"#;
        let config: WeederConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        let selectors = &config.services_and_dependant_selectors["etcd-main"];
        assert_eq!(selectors.watch_duration_seconds, 300);
        assert_eq!(selectors.pod_selectors.len(), 1);
    }

    #[test]
    fn test_validate_rejects_service_without_selectors() {
        let mut config = valid_config();
        config
            .services_and_dependant_selectors
            .get_mut("etcd-main")
            .unwrap()
            .pod_selectors
            .clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_mapping() {
        let config = WeederConfig {
            services_and_dependant_selectors: BTreeMap::new(),
        };
        assert!(config.validate().is_err());
    }
}
