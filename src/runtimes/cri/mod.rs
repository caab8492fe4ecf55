//! CRI backend.
//!
//! Talks to a Container Runtime Interface endpoint (containerd, CRI-O) over
//! gRPC. The CRI surface is narrower than Docker's: image pulls and listing
//! are not implemented, and logs are read straight from the runtime's log
//! file on disk, which is possible because this backend always runs on the
//! same host as the runtime it drives.

mod logs;
mod proto;

pub use logs::CriLogReader;

use crate::constants::{
    CRI_CPU_PERIOD_USEC, EVICTABLE_OOM_SCORE_ADJ, MANAGED_LABEL, MIN_MEMORY_BYTES,
    VISIBLE_DEVICES_ENV,
};
use crate::error::{Error, Result};
use crate::logging::LogReader;
use crate::runtime::{
    Container, ContainerInfo, ContainerOpts, ContainerStats, ContainerStatus, DockerImage,
    PullPolicy, Runtime,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hyper_util::rt::TokioIo;
use proto::RuntimeServiceClient;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Code, Status};
use tower::service_fn;
use uuid::Uuid;

/// Mount failures come back as long runtime messages; everything past this
/// marker is the part worth showing.
const PATH_DNE_ERROR: &str = "path does not exist";

// =============================================================================
// Runtime
// =============================================================================

/// Wraps a CRI endpoint in the common runtime interface.
#[derive(Clone)]
pub struct CriRuntime {
    client: RuntimeServiceClient,
}

impl CriRuntime {
    /// Connects to a CRI endpoint. `address` is either a `unix://` socket
    /// path or an `http://host:port` target.
    pub async fn connect(address: &str) -> Result<Self> {
        let channel = connect_channel(address).await?;
        Ok(Self {
            client: RuntimeServiceClient::new(channel),
        })
    }

    /// Creates an interface to an existing container.
    pub fn container(&self, id: impl Into<String>) -> CriContainer {
        CriContainer {
            client: self.client.clone(),
            id: id.into(),
        }
    }
}

async fn connect_channel(address: &str) -> Result<Channel> {
    if let Some(path) = address.strip_prefix("unix://") {
        let path = PathBuf::from(path);
        // The endpoint URI is a placeholder; the connector dials the socket.
        Endpoint::try_from("http://[::]:50051")
            .map_err(|e| Error::backend("building CRI endpoint", e))?
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    let stream = UnixStream::connect(path).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await
            .map_err(|e| Error::backend(format!("connecting to CRI endpoint {address}"), e))
    } else {
        Endpoint::from_shared(address.to_string())
            .map_err(|e| Error::backend("building CRI endpoint", e))?
            .connect()
            .await
            .map_err(|e| Error::backend(format!("connecting to CRI endpoint {address}"), e))
    }
}

#[async_trait]
impl Runtime for CriRuntime {
    async fn pull_image(
        &self,
        _image: &DockerImage,
        _policy: PullPolicy,
        _quiet: bool,
    ) -> Result<()> {
        Err(Error::NotImplemented)
    }

    async fn create_container(&self, opts: &ContainerOpts) -> Result<Box<dyn Container>> {
        opts.validate()?;

        let name = match &opts.name {
            Some(name) => name.clone(),
            None => Uuid::new_v4().to_string(),
        };

        let mut config = proto::ContainerConfig {
            metadata: Some(proto::ContainerMetadata { name, attempt: 0 }),
            image: Some(proto::ImageSpec {
                image: opts.image.tag.clone(),
            }),
            command: opts.command.clone(),
            args: opts.arguments.clone(),
            working_dir: opts.working_dir.clone(),
            ..Default::default()
        };

        if opts.interactive {
            config.stdin = true;
            config.tty = true;
        }

        config
            .labels
            .insert(MANAGED_LABEL.to_string(), "true".to_string());
        config.labels.extend(opts.labels.clone());

        for (key, value) in &opts.env {
            config.envs.push(proto::KeyValue {
                key: key.clone(),
                value: value.clone(),
            });
        }

        for m in &opts.mounts {
            config.mounts.push(proto::Mount {
                host_path: absolute_path(&m.host_path)?,
                container_path: m.container_path.clone(),
                readonly: m.read_only,
            });
        }

        // Hardware limits.
        let mut resources = proto::LinuxContainerResources::default();
        if opts.memory != 0 {
            resources.memory_limit_in_bytes = opts.memory.max(MIN_MEMORY_BYTES);
        }
        if opts.cpu_shares != 0 {
            resources.cpu_shares = opts.cpu_shares;
        } else if opts.cpu_count != 0.0 {
            // Period and quota are in microseconds.
            resources.cpu_period = CRI_CPU_PERIOD_USEC;
            resources.cpu_quota = (opts.cpu_count * CRI_CPU_PERIOD_USEC as f64) as i64;
        }
        if !opts.gpus.is_empty() {
            return Err(Error::NotImplemented);
        }
        // Without an explicit "none" the Nvidia runtime exposes every GPU on
        // the host to the container.
        config.envs.push(proto::KeyValue {
            key: VISIBLE_DEVICES_ENV.to_string(),
            value: "none".to_string(),
        });
        if opts.is_evictable() {
            resources.oom_score_adj = EVICTABLE_OOM_SCORE_ADJ;
        }
        config.linux = Some(proto::LinuxContainerConfig {
            resources: Some(resources),
        });

        let created = self
            .client
            .clone()
            .create_container(proto::CreateContainerRequest {
                pod_sandbox_id: String::new(),
                config: Some(config),
            })
            .await
            .map_err(sanitize_create_err)?;

        Ok(Box::new(self.container(created.container_id)))
    }

    async fn list_containers(&self) -> Result<Vec<Box<dyn Container>>> {
        Err(Error::NotImplemented)
    }

    fn container_by_id(&self, id: &str) -> Result<Box<dyn Container>> {
        Ok(Box::new(self.container(id)))
    }

    async fn close(&self) -> Result<()> {
        // The channel hangs up when its last clone drops.
        Ok(())
    }
}

// =============================================================================
// Container
// =============================================================================

/// Wraps a CRI container in the common runtime container interface.
pub struct CriContainer {
    client: RuntimeServiceClient,
    id: String,
}

#[async_trait]
impl Container for CriContainer {
    fn name(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<()> {
        self.client
            .clone()
            .start_container(proto::StartContainerRequest {
                container_id: self.id.clone(),
            })
            .await
            .map(|_| ())
            .map_err(|e| translate_err("starting container", e))
    }

    async fn info(&self) -> Result<ContainerInfo> {
        let resp = self
            .client
            .clone()
            .container_status(proto::ContainerStatusRequest {
                container_id: self.id.clone(),
                verbose: true,
            })
            .await
            .map_err(|e| translate_err("inspecting container", e))?;

        let status = resp
            .status
            .ok_or_else(|| Error::MalformedStream("status response without status".into()))?;
        project_status(&status, &resp.info)
    }

    async fn logs(&self, since: Option<DateTime<Utc>>) -> Result<Box<dyn LogReader>> {
        let resp = self
            .client
            .clone()
            .container_status(proto::ContainerStatusRequest {
                container_id: self.id.clone(),
                verbose: false,
            })
            .await
            .map_err(|e| translate_err("inspecting container", e))?;

        let log_path = resp.status.map(|s| s.log_path).unwrap_or_default();
        let file = tokio::fs::File::open(&log_path)
            .await
            .map_err(|e| Error::backend(format!("opening log file {log_path:?}"), e))?;
        Ok(Box::new(CriLogReader::new(file, since)))
    }

    async fn stats(&self) -> Result<ContainerStats> {
        Err(Error::NotImplemented)
    }

    async fn stop(&self, timeout: Option<Duration>) -> Result<()> {
        self.client
            .clone()
            .stop_container(proto::StopContainerRequest {
                container_id: self.id.clone(),
                timeout: timeout.map(|t| t.as_secs() as i64).unwrap_or(0),
            })
            .await
            .map(|_| ())
            .map_err(|e| translate_err("stopping container", e))
    }

    async fn remove(&self) -> Result<()> {
        self.client
            .clone()
            .remove_container(proto::RemoveContainerRequest {
                container_id: self.id.clone(),
            })
            .await
            .map(|_| ())
            .map_err(|e| translate_err("removing container", e))
    }
}

// =============================================================================
// Status Projection
// =============================================================================

/// Runtime-specific detail carried in the verbose status response. The
/// runtime serializes its container config there as JSON.
#[derive(Debug, Default, Deserialize)]
struct VerboseInfo {
    #[serde(default)]
    config: VerboseConfig,
}

#[derive(Debug, Default, Deserialize)]
struct VerboseConfig {
    #[serde(default)]
    linux: VerboseLinux,
}

#[derive(Debug, Default, Deserialize)]
struct VerboseLinux {
    #[serde(default)]
    resources: VerboseResources,
}

#[derive(Debug, Default, Deserialize)]
struct VerboseResources {
    #[serde(default)]
    memory_limit_in_bytes: i64,
    #[serde(default)]
    cpu_quota: i64,
    #[serde(default)]
    cpu_period: i64,
}

/// Projects a CRI container status onto the normalized status machine.
fn project_status(
    status: &proto::ContainerStatus,
    info: &HashMap<String, String>,
) -> Result<ContainerInfo> {
    let mut out = ContainerInfo {
        labels: status.labels.clone(),
        ..Default::default()
    };

    out.created_at = nano_time(status.created_at);
    out.started_at = nano_time(status.started_at);
    out.ended_at = nano_time(status.finished_at);

    match status.container_state() {
        proto::ContainerState::ContainerCreated => {
            out.status = Some(ContainerStatus::Created);
        }
        proto::ContainerState::ContainerRunning => {
            out.status = Some(ContainerStatus::Running);
        }
        proto::ContainerState::ContainerExited => {
            out.status = Some(ContainerStatus::Exited);
            out.exit_code = Some(status.exit_code);
        }
        proto::ContainerState::ContainerUnknown => {}
    }

    if let Some(raw) = info.get("info") {
        let verbose: VerboseInfo = serde_json::from_str(raw)
            .map_err(|e| Error::MalformedStream(format!("couldn't parse container config: {e}")))?;
        let resources = verbose.config.linux.resources;
        out.memory = resources.memory_limit_in_bytes;
        if resources.cpu_period > 0 {
            out.cpu_count = resources.cpu_quota as f64 / resources.cpu_period as f64;
        }
    }

    Ok(out)
}

fn nano_time(nanos: i64) -> Option<DateTime<Utc>> {
    if nanos == 0 {
        return None;
    }
    Some(Utc.timestamp_nanos(nanos))
}

// =============================================================================
// Helpers
// =============================================================================

fn absolute_path(p: &str) -> Result<String> {
    let path = Path::new(p);
    let abs: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(abs.to_string_lossy().into_owned())
}

/// Trims noisy runtime messages about nonexistent mount sources down to the
/// useful suffix; everything else is wrapped as a backend failure.
fn sanitize_create_err(status: Status) -> Error {
    let msg = status.message().to_string();
    if let Some(i) = msg.find(PATH_DNE_ERROR) {
        return Error::InvalidInput(msg[i..].to_string());
    }
    Error::backend("creating container", status)
}

fn translate_err(context: &str, status: Status) -> Error {
    match status.code() {
        Code::NotFound => Error::NotFound,
        Code::Cancelled => Error::Cancelled,
        _ => Error::backend(context, status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited_status() -> proto::ContainerStatus {
        proto::ContainerStatus {
            id: "abc".to_string(),
            state: proto::ContainerState::ContainerExited as i32,
            created_at: 1_700_000_000_000_000_000,
            started_at: 1_700_000_001_000_000_000,
            finished_at: 1_700_000_002_000_000_000,
            exit_code: 137,
            ..Default::default()
        }
    }

    #[test]
    fn test_project_exited() {
        let info = project_status(&exited_status(), &HashMap::new()).unwrap();
        assert_eq!(info.status, Some(ContainerStatus::Exited));
        assert_eq!(info.exit_code, Some(137));
        assert!(info.created_at < info.started_at);
        assert!(info.started_at < info.ended_at);
    }

    #[test]
    fn test_project_running_without_exit_code() {
        let status = proto::ContainerStatus {
            state: proto::ContainerState::ContainerRunning as i32,
            created_at: 1_700_000_000_000_000_000,
            started_at: 1_700_000_001_000_000_000,
            ..Default::default()
        };
        let info = project_status(&status, &HashMap::new()).unwrap();
        assert_eq!(info.status, Some(ContainerStatus::Running));
        assert!(info.exit_code.is_none());
        assert!(info.ended_at.is_none());
    }

    #[test]
    fn test_project_verbose_resources() {
        let mut info_map = HashMap::new();
        info_map.insert(
            "info".to_string(),
            r#"{"config":{"linux":{"resources":{"memory_limit_in_bytes":8388608,"cpu_quota":250000,"cpu_period":100000}}}}"#
                .to_string(),
        );
        let info = project_status(&exited_status(), &info_map).unwrap();
        assert_eq!(info.memory, 8 * 1024 * 1024);
        assert_eq!(info.cpu_count, 2.5);
    }

    #[test]
    fn test_project_rejects_bad_verbose_info() {
        let mut info_map = HashMap::new();
        info_map.insert("info".to_string(), "not json".to_string());
        assert!(project_status(&exited_status(), &info_map).is_err());
    }
}
