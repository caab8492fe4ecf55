//! Runtime contract - the backend-neutral lifecycle interface.
//!
//! This module defines the abstract operations every backend implements:
//! - `pull_image`: Fetch an image per pull policy
//! - `create_container`: Validate opts and create a container
//! - `list_containers`: Enumerate managed containers
//! - per-container: `start`, `info`, `logs`, `stats`, `stop`, `remove`
//!
//! Backends live in [`crate::runtimes`]; they differ in how operations reach
//! their controller, never in the semantics observable through this module.

use crate::constants::{MANAGED_LABEL, VISIBLE_DEVICES_ENV};
use crate::error::{Error, Result};
use crate::logging::LogReader;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

// =============================================================================
// Pull Policy
// =============================================================================

/// Options for pulling images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Always pull, even if the image is already present.
    Always,

    /// Pull only if the image doesn't exist locally. The local image is not
    /// updated if the remote version has changed.
    #[serde(rename = "missing")]
    IfMissing,

    /// Validate that the image exists locally; never pull the remote
    /// version, even if the image is missing.
    Never,
}

impl std::fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::IfMissing => write!(f, "missing"),
            Self::Never => write!(f, "never"),
        }
    }
}

// =============================================================================
// Image
// =============================================================================

/// A Docker-style container image reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DockerImage {
    /// Image refspec, as a tag or resolvable image digest.
    pub tag: String,

    /// Credentials for private registry access.
    pub auth: Option<RegistryAuth>,
}

impl DockerImage {
    /// Creates an image reference without registry credentials.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            auth: None,
        }
    }
}

/// Credentials for private registry access.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    pub server_address: String,
    pub username: String,
    pub password: String,
}

// =============================================================================
// Container Options
// =============================================================================

/// A file or directory mounted into a container. The host path is resolved
/// to an absolute path at create time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// Options for container creation.
#[derive(Debug, Clone, Default)]
pub struct ContainerOpts {
    /// (optional) Name to give the container; randomly generated if absent.
    pub name: Option<String>,

    pub image: DockerImage,
    pub command: Vec<String>,
    pub arguments: Vec<String>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<Mount>,

    /// Attach STDIN/STDOUT/STDERR and shell into the container.
    pub interactive: bool,

    /// Hard limit on the amount of memory the container can use, in bytes.
    /// Zero means unlimited.
    pub memory: i64,

    /// Size of /dev/shm in bytes. Zero leaves the controller default.
    pub shared_memory: i64,

    /// Hard limit on the number of CPUs the container can use. Zero means
    /// unlimited.
    pub cpu_count: f64,

    /// Relative CPU weight under contention. Each container defaults to 1024
    /// shares; a container with 2048 shares can use twice as much CPU as one
    /// with 1024 during contention. Shares take precedence over `cpu_count`
    /// on CRI and are ignored on Kubernetes.
    pub cpu_shares: i64,

    /// GPUs assigned to the container as opaque device ids or indices.
    pub gpus: Vec<String>,

    /// (optional) User that will run commands inside the container. Also
    /// supports "user:group". Defaults to root.
    pub user: String,

    /// (optional) Working directory where the command will be launched.
    pub working_dir: String,
}

impl ContainerOpts {
    /// Returns true if the container is evictable. Evictable containers are
    /// the first to be killed during periods of memory contention.
    pub fn is_evictable(&self) -> bool {
        self.memory == 0 && self.cpu_count == 0.0 && self.cpu_shares == 0 && self.gpus.is_empty()
    }

    /// Rejects options that collide with reserved keys. Runs before any
    /// side effect in every backend.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.env.contains_key(VISIBLE_DEVICES_ENV) {
            return Err(Error::InvalidInput(format!(
                "forbidden environment variable: {VISIBLE_DEVICES_ENV}"
            )));
        }
        if self.labels.contains_key(MANAGED_LABEL) {
            return Err(Error::InvalidInput(format!(
                "forbidden label: {MANAGED_LABEL}"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Container Status
// =============================================================================

/// The runtime status of a containerized process.
///
/// `Exited` is terminal: once a backend reports it, subsequent observations
/// keep reporting it until the container is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// The container has been created, but not started.
    Created,
    /// The container is currently running.
    Running,
    /// The container exited.
    Exited,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// A container's details, normalized across backends. All timestamps UTC.
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub labels: HashMap<String, String>,

    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    pub status: Option<ContainerStatus>,

    /// Human-readable detail accompanying the status, e.g. the reason a
    /// container was killed.
    pub message: String,

    /// Exit code, present when the container exited and the controller
    /// observed one. Pod-level eviction can exit a container without a code.
    pub exit_code: Option<i32>,

    /// Memory limit in bytes. Zero means unlimited.
    pub memory: i64,

    /// CPU limit. Zero means unlimited.
    pub cpu_count: f64,
}

// =============================================================================
// Container Stats
// =============================================================================

/// An enumerated container statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatType {
    /// CPU usage as a percentage of the container's limit. If the container
    /// has no limit, the percentage is relative to total host CPU capacity.
    CpuUsagePercent,

    /// Memory usage in absolute bytes.
    MemoryUsageBytes,

    /// Memory usage as a percentage of the container's limit. If the
    /// container has no limit, the percentage is relative to total available
    /// memory on the host.
    MemoryUsagePercent,

    /// Total bytes received over the network.
    NetworkRxBytes,

    /// Total bytes sent over the network.
    NetworkTxBytes,

    /// Total bytes read from block devices.
    BlockReadBytes,

    /// Total bytes written to block devices.
    BlockWriteBytes,
}

impl std::fmt::Display for StatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CpuUsagePercent => "CPUUsagePercent",
            Self::MemoryUsageBytes => "MemoryUsageBytes",
            Self::MemoryUsagePercent => "MemoryUsagePercent",
            Self::NetworkRxBytes => "NetworkRxBytes",
            Self::NetworkTxBytes => "NetworkTxBytes",
            Self::BlockReadBytes => "BlockReadBytes",
            Self::BlockWriteBytes => "BlockWriteBytes",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time usage statistics for system resources.
#[derive(Debug, Clone)]
pub struct ContainerStats {
    /// System time at which stats were sampled.
    pub time: DateTime<Utc>,

    /// All tracked container statistics, keyed by type. Not every key is
    /// guaranteed to be present in every sample.
    pub stats: BTreeMap<StatType, f64>,
}

// =============================================================================
// Runtime Trait
// =============================================================================

/// Abstracts the specifics of interacting with the underlying container
/// runtime (e.g. Docker) for execution.
///
/// Implementations are thread-safe handles; cloneable wrappers may be used
/// from any number of tasks concurrently.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Pulls an image according to `policy`, writing progress to standard
    /// output unless `quiet` is set.
    async fn pull_image(&self, image: &DockerImage, policy: PullPolicy, quiet: bool) -> Result<()>;

    /// Validates `opts` and creates a new container. Call
    /// [`Container::start`] to run it.
    async fn create_container(&self, opts: &ContainerOpts) -> Result<Box<dyn Container>>;

    /// Enumerates all containers managed by this runtime.
    async fn list_containers(&self) -> Result<Vec<Box<dyn Container>>>;

    /// Builds a handle around an existing container by its backend-native
    /// id, without a controller round trip.
    ///
    /// This is an optional capability. The Kubernetes composite probes for
    /// it on its low-level runtime to delegate logs, stop, and stats.
    fn container_by_id(&self, id: &str) -> Result<Box<dyn Container>> {
        let _ = id;
        Err(Error::NotImplemented)
    }

    /// Releases the connection to the controller.
    async fn close(&self) -> Result<()>;
}

// =============================================================================
// Container Trait
// =============================================================================

/// A containerized process.
#[async_trait]
pub trait Container: Send + Sync {
    /// Returns the container's unique, stable name.
    fn name(&self) -> &str;

    /// Calls the entrypoint in a created container.
    async fn start(&self) -> Result<()>;

    /// Returns the container's details.
    async fn info(&self) -> Result<ContainerInfo>;

    /// Returns a reader over log messages starting at the given time
    /// (inclusive). Pass `None` to read the full log.
    ///
    /// The returned stream is lazy, finite, and non-restartable; it is not
    /// safe for concurrent use.
    async fn logs(&self, since: Option<DateTime<Utc>>) -> Result<Box<dyn LogReader>>;

    /// Samples resource usage statistics for the container.
    async fn stats(&self) -> Result<ContainerStats>;

    /// Sends SIGTERM to the container. If `timeout` is given and elapses,
    /// the container is killed with SIGKILL; a zero timeout kills
    /// immediately.
    async fn stop(&self, timeout: Option<Duration>) -> Result<()>;

    /// Kills and removes the container with no grace period. Returns
    /// [`Error::NotFound`] if the container does not exist.
    async fn remove(&self) -> Result<()>;
}
