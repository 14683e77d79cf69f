//! Label-selected pod watch with automatic re-creation.
//!
//! Kubernetes watches close routinely, so a watcher that does not
//! re-create its watch is useless. Re-creation retries forever at a fixed
//! interval and is bounded only by the parent token. Accepted events are
//! `Added` and `Modified` for Pod objects; everything else is discarded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, WatchEvent, WatchParams};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::{Result, WatchdogError};
use crate::retry::retry_on_error;

const WATCH_CREATION_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Waiting reason indicating repeated container-restart failure.
const CRASH_LOOP_BACK_OFF: &str = "CrashLoopBackOff";

/// Deletes pods so their controller recreates them healthy.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodDeleter: Send + Sync {
    /// Delete a pod with the default propagation policy.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Pod deletion backed by the cluster client.
pub struct KubePodDeleter {
    client: Client,
}

impl KubePodDeleter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodDeleter for KubePodDeleter {
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

/// Watches pods matching one selector and weeds out the crash-looping ones.
pub(crate) struct PodWatcher {
    pub(crate) namespace: String,
    pub(crate) service_name: String,
    pub(crate) selector_query: String,
    pub(crate) client: Client,
    pub(crate) deleter: Arc<dyn PodDeleter>,
    pub(crate) token: CancellationToken,
}

impl PodWatcher {
    pub(crate) async fn run(self) {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let watch_params = WatchParams::default().labels(&self.selector_query);
        let operation = format!(
            "create pod watch in namespace {} for service {} with selector {}",
            self.namespace, self.service_name, self.selector_query
        );
        loop {
            let stream = match retry_on_error(
                &self.token,
                &operation,
                || async {
                    pods.watch(&watch_params, "0")
                        .await
                        .map_err(WatchdogError::from)
                },
                WATCH_CREATION_RETRY_INTERVAL,
            )
            .await
            {
                Ok(stream) => stream,
                Err(_) => {
                    debug!(
                        namespace = %self.namespace,
                        selector = %self.selector_query,
                        "exiting pod watcher, context was cancelled"
                    );
                    return;
                }
            };
            let mut stream = stream.boxed();
            loop {
                tokio::select! {
                    _ = self.token.cancelled() => {
                        debug!(
                            namespace = %self.namespace,
                            selector = %self.selector_query,
                            "stopping pod watch, context was cancelled"
                        );
                        return;
                    }
                    event = stream.next() => match event {
                        None => {
                            info!(
                                namespace = %self.namespace,
                                service = %self.service_name,
                                selector = %self.selector_query,
                                "pod watch has stopped, recreating"
                            );
                            break;
                        }
                        Some(Ok(event)) => {
                            if can_process_event(&event) {
                                if let WatchEvent::Added(pod) | WatchEvent::Modified(pod) = event {
                                    handle_pod_event(
                                        self.deleter.as_ref(),
                                        &self.namespace,
                                        &self.service_name,
                                        &pod,
                                    )
                                    .await;
                                }
                            }
                        }
                        Some(Err(err)) => {
                            warn!(
                                namespace = %self.namespace,
                                selector = %self.selector_query,
                                error = %err,
                                "pod watch error, recreating"
                            );
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Only `Added` and `Modified` pod events are processed.
pub(crate) fn can_process_event(event: &WatchEvent<Pod>) -> bool {
    matches!(event, WatchEvent::Added(_) | WatchEvent::Modified(_))
}

/// True if any container of the pod sits in `CrashLoopBackOff`.
pub(crate) fn is_pod_in_crash_loop(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses.iter().any(|cs| {
                cs.state
                    .as_ref()
                    .and_then(|state| state.waiting.as_ref())
                    .and_then(|waiting| waiting.reason.as_deref())
                    == Some(CRASH_LOOP_BACK_OFF)
            })
        })
        .unwrap_or(false)
}

/// Delete the pod if it is stuck because of the just-recovered dependency.
///
/// The selector is the configuration's assertion that the pod depends on the
/// service; the crash-loop state is the evidence it is stuck. A 404 on
/// delete is success, any other error is logged and the watcher continues.
pub(crate) async fn handle_pod_event(
    deleter: &dyn PodDeleter,
    namespace: &str,
    service_name: &str,
    pod: &Pod,
) {
    if !is_pod_in_crash_loop(pod) {
        return;
    }
    let name = pod.name_any();
    match deleter.delete_pod(namespace, &name).await {
        Ok(()) => {
            info!(
                namespace,
                pod = %name,
                service = %service_name,
                "deleted crash-looping dependent pod"
            );
        }
        Err(WatchdogError::NotFound(_)) => {
            debug!(namespace, pod = %name, "pod already gone");
        }
        Err(err) => {
            error!(
                namespace,
                pod = %name,
                error = %err,
                "failed to delete pod, watcher continues"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateWaiting, ContainerStatus, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod_with_waiting_reason(name: &str, reason: Option<&str>) -> Pod {
        let state = match reason {
            Some(reason) => ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(reason.to_string()),
                    message: None,
                }),
                ..Default::default()
            },
            None => ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            },
        };
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "main".to_string(),
                    state: Some(state),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_event_filter_accepts_added_and_modified() {
        let pod = pod_with_waiting_reason("p", None);
        assert!(can_process_event(&WatchEvent::Added(pod.clone())));
        assert!(can_process_event(&WatchEvent::Modified(pod.clone())));
        assert!(!can_process_event(&WatchEvent::Deleted(pod)));
        assert!(!can_process_event(&WatchEvent::Error(
            kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "expired".to_string(),
                reason: "Expired".to_string(),
                code: 410,
            }
        )));
    }

    #[test]
    fn test_crash_loop_detection() {
        assert!(is_pod_in_crash_loop(&pod_with_waiting_reason(
            "p",
            Some("CrashLoopBackOff")
        )));
        assert!(!is_pod_in_crash_loop(&pod_with_waiting_reason(
            "p",
            Some("ImagePullBackOff")
        )));
        assert!(!is_pod_in_crash_loop(&pod_with_waiting_reason("p", None)));
        assert!(!is_pod_in_crash_loop(&Pod::default()));
    }

    #[tokio::test]
    async fn test_crash_looping_pod_is_deleted() {
        let mut deleter = MockPodDeleter::new();
        deleter
            .expect_delete_pod()
            .withf(|ns, name| ns == "shoot--test" && name == "dependent")
            .times(1)
            .returning(|_, _| Ok(()));

        let pod = pod_with_waiting_reason("dependent", Some("CrashLoopBackOff"));
        handle_pod_event(&deleter, "shoot--test", "etcd-main", &pod).await;
    }

    #[tokio::test]
    async fn test_healthy_pod_is_left_alone() {
        let mut deleter = MockPodDeleter::new();
        deleter.expect_delete_pod().times(0);

        let pod = pod_with_waiting_reason("healthy", None);
        handle_pod_event(&deleter, "shoot--test", "etcd-main", &pod).await;
    }

    #[tokio::test]
    async fn test_delete_not_found_is_success() {
        let mut deleter = MockPodDeleter::new();
        deleter
            .expect_delete_pod()
            .times(1)
            .returning(|_, name| Err(WatchdogError::NotFound(format!("{} not found", name))));

        let pod = pod_with_waiting_reason("dependent", Some("CrashLoopBackOff"));
        // must not panic or escalate
        handle_pod_event(&deleter, "shoot--test", "etcd-main", &pod).await;
    }

    #[tokio::test]
    async fn test_delete_error_does_not_abort_watcher() {
        let mut deleter = MockPodDeleter::new();
        deleter
            .expect_delete_pod()
            .times(1)
            .returning(|_, _| Err(WatchdogError::KubeApi("timeout".to_string())));

        let pod = pod_with_waiting_reason("dependent", Some("CrashLoopBackOff"));
        handle_pod_event(&deleter, "shoot--test", "etcd-main", &pod).await;
    }
}
