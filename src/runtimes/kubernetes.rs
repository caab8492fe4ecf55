//! Kubernetes composite backend.
//!
//! Runs from within a cluster and is scoped to a single node. Every
//! container maps to one pod with two containers: the user's *task*
//! container and a *pause* sidecar that keeps the pod alive after the task
//! exits, so status and logs stay observable until an explicit remove. A
//! PodDisruptionBudget shields each pod from voluntary disruption.
//!
//! The Kubernetes API has no way to stop a container without deleting its
//! pod and reading logs through the apiserver is a detour, so logs, stop,
//! and stats are delegated to a node-local low-level runtime (CRI by
//! default). The low-level container id is resolved lazily from the pod's
//! container statuses and cached.

use crate::constants::{
    GPU_RESOURCE, KUBERNETES_TIMEOUT, MANAGED_LABEL, NODE_LABEL, PAUSE_CONTAINER, PAUSE_IMAGE,
    SHARED_MEMORY_MOUNT_PATH, SHARED_MEMORY_VOLUME, TASK_CONTAINER,
};
use crate::error::{Error, Result};
use crate::logging::LogReader;
use crate::runtime::{
    Container, ContainerInfo, ContainerOpts, ContainerStats, ContainerStatus, DockerImage,
    PullPolicy, Runtime,
};
use crate::runtimes::LowLevelBackend;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container as PodContainer, EmptyDirVolumeSource, EnvVar, HostPathVolumeSource, Namespace, Pod,
    PodSpec, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Config};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Valid label values must be 63 characters or less and must be empty or
/// begin and end with an alphanumeric character, with dashes, underscores,
/// and dots between.
fn label_value_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new("^([a-zA-Z0-9]([a-zA-Z0-9._-]{0,61}[a-zA-Z0-9])?)?$").expect("static regex")
    })
}

// =============================================================================
// Runtime
// =============================================================================

/// Wraps the Kubernetes runtime in a common interface.
///
/// The runtime must be used from within a Kubernetes cluster. All methods
/// are scoped to the current node.
pub struct KubernetesRuntime {
    pods: Api<Pod>,
    pdbs: Api<PodDisruptionBudget>,
    node: String,
    low_level: Arc<dyn Runtime>,
}

impl KubernetesRuntime {
    /// Creates a Kubernetes-backed runtime from a process running inside a
    /// cluster, scoped to `node`. The namespace must already exist.
    /// `backend` selects the node-local runtime that logs, stop, and stats
    /// are delegated to.
    pub async fn new_in_cluster(
        namespace: &str,
        node: impl Into<String>,
        backend: LowLevelBackend,
    ) -> Result<Self> {
        let mut config = Config::incluster()
            .map_err(|e| Error::backend("loading in-cluster kubeconfig", e))?;
        config.connect_timeout = Some(KUBERNETES_TIMEOUT);
        config.read_timeout = Some(KUBERNETES_TIMEOUT);

        let client = Client::try_from(config)
            .map_err(|e| Error::backend("creating kubernetes client", e))?;

        let namespaces: Api<Namespace> = Api::all(client.clone());
        namespaces
            .get(namespace)
            .await
            .map_err(|e| Error::backend(format!("getting namespace {namespace}"), e))?;

        Ok(Self {
            pods: Api::namespaced(client.clone(), namespace),
            pdbs: Api::namespaced(client, namespace),
            node: node.into(),
            low_level: backend.connect().await?,
        })
    }

    fn container(&self, pod_name: String) -> KubernetesContainer {
        KubernetesContainer {
            pods: self.pods.clone(),
            pdbs: self.pdbs.clone(),
            pod_name,
            low_level: Arc::clone(&self.low_level),
            resolved: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Runtime for KubernetesRuntime {
    /// A no-op on Kubernetes; images are pulled implicitly on pod creation.
    async fn pull_image(
        &self,
        _image: &DockerImage,
        _policy: PullPolicy,
        _quiet: bool,
    ) -> Result<()> {
        Ok(())
    }

    /// Creates a new container. The container is started implicitly.
    async fn create_container(&self, opts: &ContainerOpts) -> Result<Box<dyn Container>> {
        opts.validate()?;
        if opts.interactive || !opts.user.is_empty() || !opts.working_dir.is_empty() {
            // Interactive shells, users, and working directories have no pod
            // translation here yet.
            return Err(Error::NotImplemented);
        }

        let name = match &opts.name {
            Some(name) => name.clone(),
            None => Uuid::new_v4().to_string(),
        };

        let pod_spec = build_pod(&self.node, &name, opts);
        let pod = self
            .pods
            .create(&PostParams::default(), &pod_spec)
            .await
            .map_err(|e| Error::backend("creating pod", e))?;

        let pdb = PodDisruptionBudget {
            metadata: ObjectMeta {
                name: pod.metadata.name.clone(),
                ..Default::default()
            },
            spec: Some(PodDisruptionBudgetSpec {
                min_available: Some(IntOrString::Int(1)),
                selector: Some(LabelSelector {
                    match_labels: pod.metadata.labels.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.pdbs
            .create(&PostParams::default(), &pdb)
            .await
            .map_err(|e| Error::backend("creating pod disruption budget", e))?;

        Ok(Box::new(self.container(name)))
    }

    /// Enumerates all containers created by this runtime on the current
    /// node.
    async fn list_containers(&self) -> Result<Vec<Box<dyn Container>>> {
        let params = ListParams::default().labels(&format!("{NODE_LABEL}={}", self.node));
        let pods = self
            .pods
            .list(&params)
            .await
            .map_err(|e| Error::backend("listing pods", e))?;

        Ok(pods
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .map(|name| Box::new(self.container(name)) as Box<dyn Container>)
            .collect())
    }

    async fn close(&self) -> Result<()> {
        self.low_level.close().await
    }
}

// =============================================================================
// Pod Shape
// =============================================================================

/// Builds the pod for a create request: the task container plus the pause
/// sidecar, pinned to `node` and never restarted.
fn build_pod(node: &str, name: &str, opts: &ContainerOpts) -> Pod {
    let mut labels = BTreeMap::new();
    labels.insert(NODE_LABEL.to_string(), node.to_string());
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

    // User labels become annotations, which accept any value. Values that
    // also satisfy the label grammar are mirrored into labels so they can be
    // used as query filters.
    let mut annotations = BTreeMap::new();
    for (k, v) in &opts.labels {
        annotations.insert(k.clone(), v.clone());
        if k != NODE_LABEL && label_value_regex().is_match(v) {
            labels.insert(k.clone(), v.clone());
        }
    }

    let env: Vec<EnvVar> = opts
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    let mut volumes = Vec::new();
    let mut volume_mounts = Vec::new();

    if opts.shared_memory > 0 {
        volumes.push(Volume {
            name: SHARED_MEMORY_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                size_limit: Some(Quantity(opts.shared_memory.to_string())),
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: SHARED_MEMORY_VOLUME.to_string(),
            mount_path: SHARED_MEMORY_MOUNT_PATH.to_string(),
            ..Default::default()
        });
    }

    for (i, mount) in opts.mounts.iter().enumerate() {
        let volume_name = format!("volume-{i}");
        volumes.push(Volume {
            name: volume_name.clone(),
            host_path: Some(HostPathVolumeSource {
                path: mount.host_path.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: volume_name,
            mount_path: mount.container_path.clone(),
            read_only: Some(mount.read_only),
            ..Default::default()
        });
    }

    // Requests are a tenth of limits: enough of a hint for utilization
    // tracking without making pods unschedulable on small nodes. Evictable
    // opts set nothing at all, leaving the pod BestEffort so it is evicted
    // first under pressure.
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();
    if opts.memory != 0 {
        requests.insert("memory".to_string(), Quantity((opts.memory / 10).to_string()));
        limits.insert("memory".to_string(), Quantity(opts.memory.to_string()));
    }
    if opts.cpu_count != 0.0 {
        let milli = (opts.cpu_count * 1000.0) as i64;
        requests.insert("cpu".to_string(), Quantity(format!("{}m", milli / 10)));
        limits.insert("cpu".to_string(), Quantity(format!("{milli}m")));
    }
    if !opts.gpus.is_empty() {
        // Individual GPUs cannot be pinned through the apiserver; only the
        // count is honored.
        limits.insert(GPU_RESOURCE.to_string(), Quantity(opts.gpus.len().to_string()));
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![
                PodContainer {
                    name: PAUSE_CONTAINER.to_string(),
                    image: Some(PAUSE_IMAGE.to_string()),
                    ..Default::default()
                },
                PodContainer {
                    name: TASK_CONTAINER.to_string(),
                    image: Some(opts.image.tag.clone()),
                    command: some_if_nonempty(&opts.command),
                    args: some_if_nonempty(&opts.arguments),
                    env: if env.is_empty() { None } else { Some(env) },
                    volume_mounts: if volume_mounts.is_empty() {
                        None
                    } else {
                        Some(volume_mounts)
                    },
                    resources: Some(ResourceRequirements {
                        requests: if requests.is_empty() {
                            None
                        } else {
                            Some(requests)
                        },
                        limits: if limits.is_empty() { None } else { Some(limits) },
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
            node_name: Some(node.to_string()),
            restart_policy: Some("Never".to_string()),
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn some_if_nonempty(items: &[String]) -> Option<Vec<String>> {
    if items.is_empty() {
        None
    } else {
        Some(items.to_vec())
    }
}

// =============================================================================
// Container
// =============================================================================

/// Wraps a Kubernetes pod in the common runtime container interface.
///
/// Standalone containers do not exist in Kubernetes; the handle names the
/// pod and operates on the task container inside it.
pub struct KubernetesContainer {
    pods: Api<Pod>,
    pdbs: Api<PodDisruptionBudget>,
    pod_name: String,
    low_level: Arc<dyn Runtime>,

    /// Lazily resolved low-level container. Callers may race to populate
    /// this; the loser's handle is discarded.
    resolved: Mutex<Option<Arc<dyn Container>>>,
}

impl KubernetesContainer {
    /// Finds the task container through the node-local low-level runtime.
    ///
    /// The read is optimistic: the cache is usually populated, so the lock
    /// is dropped before the resolve round trip and retaken to install the
    /// result, last writer wins.
    async fn resolve(&self) -> Result<Arc<dyn Container>> {
        let cached = self
            .resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(container) = cached {
            return Ok(container);
        }

        let pod = match self.pods.get(&self.pod_name).await {
            Ok(pod) => pod,
            Err(e) if is_not_found(&e) => return Err(Error::NotFound),
            Err(e) => return Err(Error::backend("finding pod", e)),
        };

        let id = task_container_id(&pod).ok_or(Error::NotStarted)?;
        let container: Arc<dyn Container> = Arc::from(self.low_level.container_by_id(&id)?);

        *self
            .resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&container));
        Ok(container)
    }

    /// Makes a low-level NotFound specific: a missing pod stays NotFound,
    /// while an existing pod whose container is gone means the container
    /// was never created.
    async fn disambiguate_not_found(&self) -> Error {
        match self.pods.get_opt(&self.pod_name).await {
            Ok(Some(_)) => Error::NotStarted,
            Ok(None) => Error::NotFound,
            Err(e) => Error::backend("finding pod", e),
        }
    }

    async fn delegated<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Container>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let container = self.resolve().await?;
        match op(container).await {
            Err(e) if e.is_not_found() => Err(self.disambiguate_not_found().await),
            other => other,
        }
    }
}

#[async_trait]
impl Container for KubernetesContainer {
    fn name(&self) -> &str {
        &self.pod_name
    }

    /// Does nothing on Kubernetes; containers start on creation.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn info(&self) -> Result<ContainerInfo> {
        let pod = match self.pods.get(&self.pod_name).await {
            Ok(pod) => pod,
            Err(e) if is_not_found(&e) => return Err(Error::NotFound),
            Err(e) => return Err(Error::backend("getting pod", e)),
        };
        Ok(project_pod(&pod))
    }

    /// Reads logs through the low-level runtime. Pulling from the node's
    /// own runtime is cheaper and more reliable than going through the
    /// apiserver, and this handle is guaranteed to be on the same host.
    async fn logs(&self, since: Option<DateTime<Utc>>) -> Result<Box<dyn LogReader>> {
        self.delegated(|c| async move { c.logs(since).await }).await
    }

    async fn stats(&self) -> Result<ContainerStats> {
        self.delegated(|c| async move { c.stats().await }).await
    }

    /// Stops the task container through the low-level runtime; the
    /// Kubernetes API offers no way to stop a container without removal.
    async fn stop(&self, timeout: Option<Duration>) -> Result<()> {
        self.delegated(|c| async move { c.stop(timeout).await })
            .await
    }

    /// Removes the pod with no grace period, along with its disruption
    /// budget.
    async fn remove(&self) -> Result<()> {
        let params = DeleteParams::default().grace_period(0);
        if let Err(e) = self.pods.delete(&self.pod_name, &params).await {
            if is_not_found(&e) {
                return Err(Error::NotFound);
            }
            return Err(Error::backend("deleting pod", e));
        }

        self.pdbs
            .delete(&self.pod_name, &DeleteParams::default())
            .await
            .map_err(|e| Error::backend("deleting pod disruption budget", e))?;
        Ok(())
    }
}

// =============================================================================
// Status Projection
// =============================================================================

/// Projects a pod onto the normalized status machine, driven by the task
/// container's state with pod-level fallbacks.
fn project_pod(pod: &Pod) -> ContainerInfo {
    let mut info = ContainerInfo::default();

    if let Some(annotations) = &pod.metadata.annotations {
        info.labels = annotations.clone().into_iter().collect();
    }
    info.created_at = pod.metadata.creation_timestamp.as_ref().map(|t| t.0);

    if let Some(spec) = &pod.spec {
        if let Some(task) = spec.containers.iter().find(|c| c.name == TASK_CONTAINER) {
            if let Some(limits) = task.resources.as_ref().and_then(|r| r.limits.as_ref()) {
                if let Some(cpu) = limits.get("cpu") {
                    info.cpu_count = parse_cpu_quantity(cpu);
                }
                if let Some(memory) = limits.get("memory") {
                    info.memory = parse_memory_quantity(memory);
                }
            }
        }
    }

    let status = pod.status.as_ref();
    let state = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.name == TASK_CONTAINER))
        .and_then(|c| c.state.as_ref());

    let waiting = state.and_then(|s| s.waiting.as_ref());
    let running = state.and_then(|s| s.running.as_ref());
    let terminated = state.and_then(|s| s.terminated.as_ref());

    if let Some(waiting) = waiting {
        // A waiting container is still being brought up; treat it as live.
        info.status = Some(ContainerStatus::Running);
        info.message = join_reason(waiting.reason.as_deref(), waiting.message.as_deref());
    } else if let Some(running) = running {
        info.status = Some(ContainerStatus::Running);
        info.started_at = running.started_at.as_ref().map(|t| t.0);
    } else if let Some(terminated) = terminated {
        info.status = Some(ContainerStatus::Exited);
        info.started_at = terminated.started_at.as_ref().map(|t| t.0);
        info.ended_at = terminated.finished_at.as_ref().map(|t| t.0);
        info.message = join_reason(terminated.reason.as_deref(), terminated.message.as_deref());
        info.exit_code = Some(terminated.exit_code);
    } else if status.and_then(|s| s.phase.as_deref()) == Some("Failed") {
        // No container state to go on; the pod phase still captures some
        // pod-level failures such as eviction under memory pressure.
        info.status = Some(ContainerStatus::Exited);
        info.message = join_reason(
            status.and_then(|s| s.reason.as_deref()),
            status.and_then(|s| s.message.as_deref()),
        );
    } else {
        // A container state with no member set defaults to waiting, and an
        // unknown pod phase is assumed alive.
        info.status = Some(ContainerStatus::Running);
        debug!(
            phase = status.and_then(|s| s.phase.as_deref()).unwrap_or(""),
            pod = pod.metadata.name.as_deref().unwrap_or(""),
            "no container state found; assumed running"
        );
    }

    info
}

fn join_reason(reason: Option<&str>, message: Option<&str>) -> String {
    match (reason.unwrap_or(""), message.unwrap_or("")) {
        (reason, "") => reason.to_string(),
        ("", message) => message.to_string(),
        (reason, message) => format!("{reason}: {message}"),
    }
}

/// Extracts the task container's low-level id, e.g.
/// `containerd://3f4e...` becomes `3f4e...`.
fn task_container_id(pod: &Pod) -> Option<String> {
    let uri = pod
        .status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|c| c.name == TASK_CONTAINER)?
        .container_id
        .clone()?;
    let id = match uri.split_once("://") {
        Some((_, id)) => id,
        None => &uri,
    };
    if id.is_empty() {
        return None;
    }
    Some(id.to_string())
}

/// Parses a CPU quantity ("2", "1500m") into a core count.
fn parse_cpu_quantity(q: &Quantity) -> f64 {
    if let Some(milli) = q.0.strip_suffix('m') {
        milli.parse::<f64>().unwrap_or(0.0) / 1000.0
    } else {
        q.0.parse().unwrap_or(0.0)
    }
}

/// Parses a memory quantity into bytes. Pods built here always carry plain
/// byte counts; binary suffixes appear when reading back foreign pods.
fn parse_memory_quantity(q: &Quantity) -> i64 {
    let s = q.0.as_str();
    let suffixes = [
        ("Ki", 1i64 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
    ];
    for (suffix, scale) in suffixes {
        if let Some(count) = s.strip_suffix(suffix) {
            return count.parse::<i64>().unwrap_or(0) * scale;
        }
    }
    s.parse().unwrap_or(0)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}
