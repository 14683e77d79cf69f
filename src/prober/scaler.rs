//! Dependency-ordered scaling of workloads in a probed namespace.
//!
//! At construction time the scaler compiles one flow per direction from the
//! configured `dependentResourceInfos`. Records are grouped by level; each
//! level becomes one task that depends on the previous level's task, and
//! records sharing a level scale concurrently inside that task. A task also
//! receives the previous level's records as its wait-on set: before writing
//! a scale, it checks that every upstream's *status* replicas already match
//! that upstream's target, and skips the round otherwise. The next probe
//! cycle retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::Scale;
use kube::api::{Api, DynamicObject, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::automock;

use crate::error::{Result, WatchdogError};
use crate::flow::{parallel, task_ids, Flow, Graph, Task, TaskFn, TaskId};
use crate::prober::config::{parse_api_version, DependentResourceInfo, ProbeConfig, ResourceRef};
use crate::retry::{always_retry, retry, sleep_with_cancel};

/// Annotation that suppresses scaling of a workload in both directions.
pub const IGNORE_SCALING_ANNOTATION: &str = "dependency-watchdog.gardener.cloud/ignore-scaling";

const MAX_RESOURCE_SCALING_ATTEMPTS: u32 = 3;
const SCALE_RESOURCE_BACKOFF: Duration = Duration::from_millis(100);

/// Replica comparison deciding whether a workload still needs scaling.
///
/// Scale-up uses `current < target` and scale-down `current > target`, so a
/// manually raised replica count is not clobbered on scale-up and a
/// deliberately zeroed workload is not revived on scale-down.
pub type MismatchReplicasFn = fn(i32, i32) -> bool;

pub fn scale_up_replicas_mismatch(current: i32, target: i32) -> bool {
    current < target
}

pub fn scale_down_replicas_mismatch(current: i32, target: i32) -> bool {
    current > target
}

/// A flattened scale-up or scale-down record for one resource reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScalableResourceInfo {
    pub resource_ref: ResourceRef,
    pub level: u32,
    pub initial_delay: Duration,
    pub timeout: Duration,
    pub replicas: i32,
}

/// Access to workloads and their scale subresource.
///
/// The indirection keeps scale decisions testable without a cluster; the
/// production implementation is [`KubeWorkloadAccess`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadAccess: Send + Sync {
    /// Fetch a Deployment in the given namespace.
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;

    /// Fetch the scale subresource of the referenced workload.
    async fn get_scale(&self, namespace: &str, resource_ref: &ResourceRef) -> Result<Scale>;

    /// Update the scale subresource of the referenced workload.
    async fn update_scale(
        &self,
        namespace: &str,
        resource_ref: &ResourceRef,
        scale: Scale,
    ) -> Result<Scale>;
}

/// Workload access backed by the cluster client.
///
/// Resource references are resolved to REST mappings through API discovery.
/// Resolutions are cached; the cache is shared process-wide by handing the
/// same instance to every prober.
pub struct KubeWorkloadAccess {
    client: Client,
    resolved: Mutex<HashMap<String, ApiResource>>,
}

impl KubeWorkloadAccess {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    async fn resolve(&self, resource_ref: &ResourceRef) -> Result<ApiResource> {
        let key = format!("{}/{}", resource_ref.api_version, resource_ref.kind);
        if let Some(ar) = self.resolved.lock().unwrap().get(&key) {
            return Ok(ar.clone());
        }
        // apiVersion validity was checked at config load time
        let (group, version) = parse_api_version(&resource_ref.api_version)?;
        let gvk = GroupVersionKind::gvk(group, version, &resource_ref.kind);
        let (ar, _caps) = kube::discovery::oneshot::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| {
                WatchdogError::KubeApi(format!(
                    "failed to resolve {} {}: {}",
                    resource_ref.api_version, resource_ref.kind, e
                ))
            })?;
        self.resolved.lock().unwrap().insert(key, ar.clone());
        Ok(ar)
    }
}

#[async_trait]
impl WorkloadAccess for KubeWorkloadAccess {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_scale(&self, namespace: &str, resource_ref: &ResourceRef) -> Result<Scale> {
        let ar = self.resolve(resource_ref).await?;
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        Ok(api.get_scale(&resource_ref.name).await?)
    }

    async fn update_scale(
        &self,
        namespace: &str,
        resource_ref: &ResourceRef,
        scale: Scale,
    ) -> Result<Scale> {
        let ar = self.resolve(resource_ref).await?;
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let body = serde_json::to_vec(&scale)?;
        Ok(api
            .replace_scale(&resource_ref.name, &PostParams::default(), body)
            .await?)
    }
}

/// Executes the compiled scale flows under a caller-supplied token.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentScaler: Send + Sync {
    /// Run the scale-up flow once.
    async fn scale_up(&self, token: CancellationToken) -> Result<()>;

    /// Run the scale-down flow once.
    async fn scale_down(&self, token: CancellationToken) -> Result<()>;
}

/// One step of a compiled scale flow, kept for introspection.
#[derive(Debug, Clone)]
pub(crate) struct ScaleStepInfo {
    pub task_id: TaskId,
    pub dependent_task_ids: Vec<TaskId>,
    pub wait_on_resource_infos: Vec<ScalableResourceInfo>,
}

/// A compiled flow plus its per-level step records.
pub(crate) struct ScaleFlow {
    pub flow: Flow,
    pub steps: Vec<ScaleStepInfo>,
}

/// Scaler for the workloads of one probed namespace.
pub struct WorkloadScaler {
    scale_up_flow: ScaleFlow,
    scale_down_flow: ScaleFlow,
}

impl WorkloadScaler {
    pub fn new(namespace: &str, config: &ProbeConfig, access: Arc<dyn WorkloadAccess>) -> Self {
        let scale_down_flow = create_resource_scale_flow(
            namespace,
            &format!("scale-down-{}", namespace),
            create_scale_down_resource_infos(&config.dependent_resource_infos),
            scale_down_replicas_mismatch,
            access.clone(),
        );
        let scale_up_flow = create_resource_scale_flow(
            namespace,
            &format!("scale-up-{}", namespace),
            create_scale_up_resource_infos(&config.dependent_resource_infos),
            scale_up_replicas_mismatch,
            access,
        );
        Self {
            scale_up_flow,
            scale_down_flow,
        }
    }
}

#[async_trait]
impl DeploymentScaler for WorkloadScaler {
    async fn scale_up(&self, token: CancellationToken) -> Result<()> {
        self.scale_up_flow.flow.run(&token).await
    }

    async fn scale_down(&self, token: CancellationToken) -> Result<()> {
        self.scale_down_flow.flow.run(&token).await
    }
}

fn is_ignore_scaling_annotation_set(deployment: &Deployment) -> bool {
    deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(IGNORE_SCALING_ANNOTATION))
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Compile one direction's records into a level-ordered chain of tasks.
pub(crate) fn create_resource_scale_flow(
    namespace: &str,
    flow_name: &str,
    resource_infos: Vec<ScalableResourceInfo>,
    mismatch_replicas: MismatchReplicasFn,
    access: Arc<dyn WorkloadAccess>,
) -> ScaleFlow {
    let levels = sort_and_get_unique_levels(&resource_infos);
    let mut infos_by_level = collect_resource_infos_by_level(resource_infos);
    let mut graph = Graph::new(flow_name);
    let mut steps: Vec<ScaleStepInfo> = Vec::with_capacity(levels.len());
    let mut previous_task_id: Option<TaskId> = None;
    let mut previous_level_infos: Vec<ScalableResourceInfo> = Vec::new();
    for level in levels {
        let Some(level_infos) = infos_by_level.remove(&level) else {
            continue;
        };
        let task_fn = create_scale_task_fn(
            namespace,
            access.clone(),
            level_infos.clone(),
            mismatch_replicas,
            previous_level_infos.clone(),
        );
        let dependencies = task_ids([previous_task_id]);
        let task_id = graph.add(Task {
            name: format!("scale resources at level {}", level),
            f: task_fn,
            dependencies: dependencies.clone(),
        });
        steps.push(ScaleStepInfo {
            task_id,
            dependent_task_ids: dependencies,
            wait_on_resource_infos: previous_level_infos.clone(),
        });
        // carry the just-processed level forward as the next level's barrier
        previous_level_infos = level_infos;
        previous_task_id = Some(task_id);
    }
    ScaleFlow {
        flow: graph.compile(),
        steps,
    }
}

/// Build the task function for one level. A level with several records runs
/// them as a parallel composition; a single record keeps its function as-is.
fn create_scale_task_fn(
    namespace: &str,
    access: Arc<dyn WorkloadAccess>,
    resource_infos: Vec<ScalableResourceInfo>,
    mismatch_replicas: MismatchReplicasFn,
    wait_on_resource_infos: Vec<ScalableResourceInfo>,
) -> TaskFn {
    let wait_on = Arc::new(wait_on_resource_infos);
    let mut task_fns: Vec<TaskFn> = Vec::with_capacity(resource_infos.len());
    for resource_info in resource_infos {
        let access = access.clone();
        let namespace = namespace.to_string();
        let wait_on = wait_on.clone();
        task_fns.push(Arc::new(move |token: CancellationToken| {
            let access = access.clone();
            let namespace = namespace.clone();
            let resource_info = resource_info.clone();
            let wait_on = wait_on.clone();
            Box::pin(async move {
                let operation =
                    format!("scale-resource-{}.{}", namespace, resource_info.resource_ref.name);
                retry(
                    &token,
                    &operation,
                    || {
                        scale_resource(
                            access.clone(),
                            &namespace,
                            &resource_info,
                            mismatch_replicas,
                            &wait_on,
                            &token,
                        )
                    },
                    MAX_RESOURCE_SCALING_ATTEMPTS,
                    SCALE_RESOURCE_BACKOFF,
                    always_retry,
                )
                .await
            })
        }));
    }
    if task_fns.len() == 1 {
        task_fns.swap_remove(0)
    } else {
        parallel(task_fns)
    }
}

/// Scale one workload toward its target, honoring the initial delay, the
/// ignore annotation, idempotence and the upstream barrier.
async fn scale_resource(
    access: Arc<dyn WorkloadAccess>,
    namespace: &str,
    resource_info: &ScalableResourceInfo,
    mismatch_replicas: MismatchReplicasFn,
    wait_on_resource_infos: &[ScalableResourceInfo],
    token: &CancellationToken,
) -> Result<()> {
    let name = &resource_info.resource_ref.name;
    let deployment = match access.get_deployment(namespace, name).await {
        Ok(deployment) => deployment,
        Err(WatchdogError::NotFound(_)) => {
            // missing optional dependency, nothing to scale
            debug!(namespace, resource = %name, "deployment not found, skipping scaling");
            return Ok(());
        }
        Err(err) => {
            error!(namespace, resource = %name, error = %err, "error getting deployment");
            return Err(err);
        }
    };

    sleep_with_cancel(token, resource_info.initial_delay).await?;

    if !should_scale(
        access.as_ref(),
        namespace,
        &deployment,
        resource_info.replicas,
        mismatch_replicas,
        wait_on_resource_infos,
    )
    .await
    {
        return Ok(());
    }

    let operation = format!("update-scale-{}.{}", namespace, name);
    let update = retry(
        token,
        &operation,
        || do_scale(access.clone(), namespace, resource_info),
        MAX_RESOURCE_SCALING_ATTEMPTS,
        SCALE_RESOURCE_BACKOFF,
        always_retry,
    );
    match tokio::time::timeout(resource_info.timeout, update).await {
        Ok(result) => {
            result?;
            info!(
                namespace,
                resource = %name,
                replicas = resource_info.replicas,
                "resource has been scaled"
            );
            Ok(())
        }
        Err(_) => Err(WatchdogError::KubeApi(format!(
            "timed out after {:?} updating scale of {}.{}",
            resource_info.timeout, namespace, name
        ))),
    }
}

async fn should_scale(
    access: &dyn WorkloadAccess,
    namespace: &str,
    deployment: &Deployment,
    target_replicas: i32,
    mismatch_replicas: MismatchReplicasFn,
    wait_on_resource_infos: &[ScalableResourceInfo],
) -> bool {
    let name = deployment.metadata.name.as_deref().unwrap_or_default();
    if is_ignore_scaling_annotation_set(deployment) {
        debug!(
            namespace,
            deployment = %name,
            annotation = IGNORE_SCALING_ANNOTATION,
            "scaling ignored due to explicit instruction via annotation"
        );
        return false;
    }

    let spec_replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    if !mismatch_replicas(spec_replicas, target_replicas) {
        debug!(
            namespace,
            deployment = %name,
            spec_replicas,
            target_replicas,
            "spec replicas satisfy the target, scaling skipped"
        );
        return false;
    }

    // The barrier reads currently available replicas, not desired replicas,
    // on the upstream dependencies.
    for upstream in wait_on_resource_infos {
        let upstream_name = &upstream.resource_ref.name;
        let upstream_deployment = match access.get_deployment(namespace, upstream_name).await {
            Ok(deployment) => deployment,
            Err(err) => {
                error!(
                    namespace,
                    upstream = %upstream_name,
                    error = %err,
                    "failed to get upstream deployment, skipping scaling"
                );
                return false;
            }
        };
        let actual_replicas = upstream_deployment
            .status
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        if mismatch_replicas(actual_replicas, upstream.replicas) {
            debug!(
                namespace,
                deployment = %name,
                upstream = %upstream_name,
                actual_replicas,
                upstream_target = upstream.replicas,
                "upstream resource not yet at its target replicas, skipping scaling"
            );
            return false;
        }
    }
    true
}

async fn do_scale(
    access: Arc<dyn WorkloadAccess>,
    namespace: &str,
    resource_info: &ScalableResourceInfo,
) -> Result<Scale> {
    let mut scale = access.get_scale(namespace, &resource_info.resource_ref).await?;
    scale.spec.get_or_insert_with(Default::default).replicas = Some(resource_info.replicas);
    access
        .update_scale(namespace, &resource_info.resource_ref, scale)
        .await
}

fn collect_resource_infos_by_level(
    resource_infos: Vec<ScalableResourceInfo>,
) -> HashMap<u32, Vec<ScalableResourceInfo>> {
    let mut by_level: HashMap<u32, Vec<ScalableResourceInfo>> = HashMap::new();
    for info in resource_infos {
        by_level.entry(info.level).or_default().push(info);
    }
    by_level
}

fn sort_and_get_unique_levels(resource_infos: &[ScalableResourceInfo]) -> Vec<u32> {
    let mut levels: Vec<u32> = Vec::new();
    for info in resource_infos {
        if !levels.contains(&info.level) {
            levels.push(info.level);
        }
    }
    levels.sort_unstable();
    levels
}

pub(crate) fn create_scale_up_resource_infos(
    dependent_resource_infos: &[DependentResourceInfo],
) -> Vec<ScalableResourceInfo> {
    dependent_resource_infos
        .iter()
        .map(|info| ScalableResourceInfo {
            resource_ref: info.resource_ref.clone(),
            level: info.scale_up_info.level,
            initial_delay: Duration::from_secs(info.scale_up_info.initial_delay_seconds),
            timeout: Duration::from_secs(info.scale_up_info.timeout_seconds),
            replicas: info.scale_up_info.replicas,
        })
        .collect()
}

pub(crate) fn create_scale_down_resource_infos(
    dependent_resource_infos: &[DependentResourceInfo],
) -> Vec<ScalableResourceInfo> {
    dependent_resource_infos
        .iter()
        .map(|info| ScalableResourceInfo {
            resource_ref: info.resource_ref.clone(),
            level: info.scale_down_info.level,
            initial_delay: Duration::from_secs(info.scale_down_info.initial_delay_seconds),
            timeout: Duration::from_secs(info.scale_down_info.timeout_seconds),
            replicas: info.scale_down_info.replicas,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prober::config::tests::{dependent_resource_info, resource_ref, valid_config};
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::autoscaling::v1::{ScaleSpec, ScaleStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn scalable(name: &str, level: u32, replicas: i32) -> ScalableResourceInfo {
        ScalableResourceInfo {
            resource_ref: resource_ref(name),
            level,
            initial_delay: Duration::ZERO,
            timeout: Duration::from_secs(10),
            replicas,
        }
    }

    fn deployment(name: &str, spec_replicas: i32, status_replicas: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(spec_replicas),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                replicas: Some(status_replicas),
                ..Default::default()
            }),
        }
    }

    fn annotated_deployment(name: &str, spec_replicas: i32) -> Deployment {
        let mut d = deployment(name, spec_replicas, spec_replicas);
        let mut annotations = BTreeMap::new();
        annotations.insert(IGNORE_SCALING_ANNOTATION.to_string(), "true".to_string());
        d.metadata.annotations = Some(annotations);
        d
    }

    fn scale_with_replicas(replicas: i32) -> Scale {
        Scale {
            metadata: ObjectMeta::default(),
            spec: Some(ScaleSpec {
                replicas: Some(replicas),
            }),
            status: Some(ScaleStatus {
                replicas,
                selector: None,
            }),
        }
    }

    #[test]
    fn test_mismatch_predicates_are_asymmetric() {
        assert!(scale_up_replicas_mismatch(0, 1));
        assert!(!scale_up_replicas_mismatch(1, 1));
        // a manually bumped count is not clobbered on scale-up
        assert!(!scale_up_replicas_mismatch(3, 1));

        assert!(scale_down_replicas_mismatch(1, 0));
        assert!(!scale_down_replicas_mismatch(0, 0));
        // a deliberately zeroed workload is not revived on scale-down
        assert!(!scale_down_replicas_mismatch(0, 1));
    }

    #[test]
    fn test_sort_and_get_unique_levels() {
        let infos = vec![
            scalable("a", 2, 0),
            scalable("b", 0, 0),
            scalable("c", 1, 0),
            scalable("d", 0, 0),
            scalable("e", 1, 0),
        ];
        assert_eq!(sort_and_get_unique_levels(&infos), vec![0, 1, 2]);
        assert!(sort_and_get_unique_levels(&[]).is_empty());
    }

    #[test]
    fn test_create_scale_up_resource_infos_maps_fields() {
        let dep_infos = vec![
            dependent_resource_info("machine-controller-manager", 2, 0, 1, 0),
            dependent_resource_info("cluster-autoscaler", 0, 1, 1, 0),
            dependent_resource_info("kube-controller-manager", 1, 0, 1, 0),
        ];
        let infos = create_scale_up_resource_infos(&dep_infos);
        assert_eq!(infos.len(), dep_infos.len());
        for (info, dep) in infos.iter().zip(&dep_infos) {
            assert_eq!(info.resource_ref, dep.resource_ref);
            assert_eq!(info.level, dep.scale_up_info.level);
            assert_eq!(
                info.initial_delay,
                Duration::from_secs(dep.scale_up_info.initial_delay_seconds)
            );
            assert_eq!(
                info.timeout,
                Duration::from_secs(dep.scale_up_info.timeout_seconds)
            );
            assert_eq!(info.replicas, dep.scale_up_info.replicas);
        }
    }

    #[test]
    fn test_create_scale_down_resource_infos_maps_fields() {
        let dep_infos = vec![
            dependent_resource_info("machine-controller-manager", 1, 0, 1, 0),
            dependent_resource_info("cluster-autoscaler", 0, 1, 2, 1),
        ];
        let infos = create_scale_down_resource_infos(&dep_infos);
        assert_eq!(infos.len(), dep_infos.len());
        for (info, dep) in infos.iter().zip(&dep_infos) {
            assert_eq!(info.resource_ref, dep.resource_ref);
            assert_eq!(info.level, dep.scale_down_info.level);
            assert_eq!(info.replicas, dep.scale_down_info.replicas);
        }
    }

    #[test]
    fn test_scale_flow_has_one_node_per_level_with_chained_dependencies() {
        let infos = vec![
            scalable("cluster-autoscaler", 1, 0),
            scalable("machine-controller-manager", 0, 0),
            scalable("kube-controller-manager", 0, 0),
        ];
        let access: Arc<dyn WorkloadAccess> = Arc::new(MockWorkloadAccess::new());
        let sf = create_resource_scale_flow(
            "default",
            "test",
            infos.clone(),
            scale_down_replicas_mismatch,
            access,
        );

        assert_eq!(sf.flow.name(), "test");
        assert_eq!(sf.flow.len(), 2);
        assert_eq!(sf.steps.len(), 2);

        assert!(sf.steps[0].dependent_task_ids.is_empty());
        assert!(sf.steps[0].wait_on_resource_infos.is_empty());

        assert_eq!(sf.steps[1].dependent_task_ids, vec![sf.steps[0].task_id]);
        let wait_on_names: Vec<&str> = sf.steps[1]
            .wait_on_resource_infos
            .iter()
            .map(|i| i.resource_ref.name.as_str())
            .collect();
        assert_eq!(
            wait_on_names,
            vec!["machine-controller-manager", "kube-controller-manager"]
        );
    }

    #[tokio::test]
    async fn test_ignored_workload_gets_no_scale_write() {
        let mut mock = MockWorkloadAccess::new();
        mock.expect_get_deployment()
            .returning(|_, name| Ok(annotated_deployment(name, 1)));
        mock.expect_get_scale().times(0);
        mock.expect_update_scale().times(0);
        let access: Arc<dyn WorkloadAccess> = Arc::new(mock);

        let info = scalable("cluster-autoscaler", 0, 0);
        let token = CancellationToken::new();
        scale_resource(
            access,
            "default",
            &info,
            scale_down_replicas_mismatch,
            &[],
            &token,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_matching_spec_replicas_get_no_scale_write() {
        let mut mock = MockWorkloadAccess::new();
        mock.expect_get_deployment()
            .returning(|_, name| Ok(deployment(name, 0, 0)));
        mock.expect_update_scale().times(0);
        let access: Arc<dyn WorkloadAccess> = Arc::new(mock);

        let info = scalable("kube-controller-manager", 0, 0);
        let token = CancellationToken::new();
        scale_resource(
            access,
            "default",
            &info,
            scale_down_replicas_mismatch,
            &[],
            &token,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_upstream_mismatch_blocks_scale_write() {
        let mut mock = MockWorkloadAccess::new();
        // the workload to scale still runs 1 replica against a target of 0
        mock.expect_get_deployment()
            .withf(|_, name| name == "cluster-autoscaler")
            .returning(|_, name| Ok(deployment(name, 1, 1)));
        // the upstream's status replicas (1) still mismatch its target (0)
        mock.expect_get_deployment()
            .withf(|_, name| name == "kube-controller-manager")
            .returning(|_, name| Ok(deployment(name, 0, 1)));
        mock.expect_get_scale().times(0);
        mock.expect_update_scale().times(0);
        let access: Arc<dyn WorkloadAccess> = Arc::new(mock);

        let info = scalable("cluster-autoscaler", 1, 0);
        let upstream = scalable("kube-controller-manager", 0, 0);
        let token = CancellationToken::new();
        scale_resource(
            access,
            "default",
            &info,
            scale_down_replicas_mismatch,
            &[upstream],
            &token,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_missing_deployment_is_tolerated() {
        let mut mock = MockWorkloadAccess::new();
        mock.expect_get_deployment()
            .returning(|_, name| Err(WatchdogError::NotFound(format!("{} not found", name))));
        mock.expect_get_scale().times(0);
        mock.expect_update_scale().times(0);
        let access: Arc<dyn WorkloadAccess> = Arc::new(mock);

        let info = scalable("optional-dependency", 0, 0);
        let token = CancellationToken::new();
        scale_resource(
            access,
            "default",
            &info,
            scale_down_replicas_mismatch,
            &[],
            &token,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_mismatching_workload_is_scaled() {
        let mut mock = MockWorkloadAccess::new();
        mock.expect_get_deployment()
            .returning(|_, name| Ok(deployment(name, 1, 1)));
        mock.expect_get_scale()
            .returning(|_, _| Ok(scale_with_replicas(1)));
        mock.expect_update_scale()
            .withf(|_, _, scale| scale.spec.as_ref().and_then(|s| s.replicas) == Some(0))
            .times(1)
            .returning(|_, _, scale| Ok(scale));
        let access: Arc<dyn WorkloadAccess> = Arc::new(mock);

        let info = scalable("kube-controller-manager", 0, 0);
        let token = CancellationToken::new();
        scale_resource(
            access,
            "default",
            &info,
            scale_down_replicas_mismatch,
            &[],
            &token,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_scale_down_flow_end_to_end() {
        let mut mock = MockWorkloadAccess::new();
        mock.expect_get_deployment()
            .returning(|_, name| Ok(deployment(name, 1, 1)));
        mock.expect_get_scale()
            .returning(|_, _| Ok(scale_with_replicas(1)));
        mock.expect_update_scale()
            .withf(|_, _, scale| scale.spec.as_ref().and_then(|s| s.replicas) == Some(0))
            .times(1)
            .returning(|_, _, scale| Ok(scale));
        let access: Arc<dyn WorkloadAccess> = Arc::new(mock);

        let config = valid_config();
        let scaler = WorkloadScaler::new("default", &config, access);
        scaler.scale_down(CancellationToken::new()).await.unwrap();
    }
}
