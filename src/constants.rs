//! Constants for the runtime facade.
//!
//! All shared keys, limits, and timeouts are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Reserved Keys
// =============================================================================

/// Label set on every container created by this crate. List operations
/// filter on it so unmanaged containers stay invisible. Callers may not
/// supply this label themselves.
pub const MANAGED_LABEL: &str = "unirun.dev/managed";

/// Label carrying the node identifier on Kubernetes pods. Every list query
/// is scoped to the current node through it.
pub const NODE_LABEL: &str = "unirun.dev/node";

/// Environment variable controlling which GPU devices the Nvidia runtime
/// exposes to a container. The facade owns this variable: when no GPUs are
/// requested it is forced to "none", otherwise the daemon would expose every
/// GPU on the host. Callers may not supply it themselves.
pub const VISIBLE_DEVICES_ENV: &str = "NVIDIA_VISIBLE_DEVICES";

// =============================================================================
// Resource Limits
// =============================================================================

/// Smallest memory limit the Docker and CRI daemons accept (4 MiB).
/// Requests below this are raised to the floor.
pub const MIN_MEMORY_BYTES: i64 = 4 * 1024 * 1024;

/// CPU quota period for CRI resource mapping, in microseconds.
pub const CRI_CPU_PERIOD_USEC: i64 = 100_000;

/// OOM score adjustment applied to evictable CRI containers. The maximum
/// value, so evictable containers are the first killed under memory pressure.
pub const EVICTABLE_OOM_SCORE_ADJ: i64 = 1000;

/// Kubernetes extended resource name for Nvidia GPUs.
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

// =============================================================================
// Log Streaming
// =============================================================================

/// Maximum length of a single log line's text (64 KiB). Overflow bytes are
/// consumed and discarded so stream framing stays intact.
pub const MAX_LOG_LINE_BYTES: u64 = 64 * 1024;

// =============================================================================
// CRI
// =============================================================================

/// Default CRI endpoint, containerd's socket.
pub const DEFAULT_CRI_ADDRESS: &str = "unix:///run/containerd/containerd.sock";

// =============================================================================
// Kubernetes
// =============================================================================

/// Name of the task container inside every pod this crate creates.
pub const TASK_CONTAINER: &str = "task";

/// Name of the pause sidecar. The pause image does nothing; it keeps the pod
/// alive after the task container exits so status and logs remain observable
/// until the pod is explicitly removed.
pub const PAUSE_CONTAINER: &str = "pause";

/// Image run as the pause sidecar.
pub const PAUSE_IMAGE: &str = "registry.k8s.io/pause:3.9";

/// Volume name and mount path for the optional shared-memory mount.
pub const SHARED_MEMORY_VOLUME: &str = "shared-memory";
pub const SHARED_MEMORY_MOUNT_PATH: &str = "/dev/shm";

/// Per-call timeout for the Kubernetes API client.
pub const KUBERNETES_TIMEOUT: Duration = Duration::from_secs(60);
