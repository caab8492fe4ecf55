//! Docker backend.
//!
//! Wraps the Docker daemon's HTTP API in the common runtime interface. The
//! daemon owns image storage and container state; this module translates
//! the abstract contract to daemon calls and projects the daemon's inspect
//! view onto the normalized status machine.

mod logs;

pub use logs::DockerLogReader;

use crate::constants::{MANAGED_LABEL, MIN_MEMORY_BYTES, VISIBLE_DEVICES_ENV};
use crate::error::{Error, Result};
use crate::logging::LogReader;
use crate::runtime::{
    Container, ContainerInfo, ContainerOpts, ContainerStats, ContainerStatus, DockerImage,
    PullPolicy, Runtime, StatType,
};
use async_trait::async_trait;
use bollard::container::{
    BlkioStatsEntry, CPUStats, Config, CreateContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, MemoryStats, MemoryStatsStats, NetworkStats, RemoveContainerOptions,
    StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, DeviceRequest, HostConfig, Mount, MountTypeEnum,
};
use bollard::auth::DockerCredentials;
use bollard::Docker;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Datelike, Utc};
use futures::{Stream, StreamExt, TryStreamExt};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use uuid::Uuid;

/// Mount failures come back as long daemon messages; everything past this
/// marker is the part worth showing.
const PATH_DNE_ERROR: &str = "path does not exist";

// =============================================================================
// Runtime
// =============================================================================

/// Wraps the Docker daemon in the common runtime interface.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Creates a new Docker-backed runtime against the local daemon.
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::backend("connecting to Docker daemon", e))?;
        Ok(Self { docker })
    }

    /// Returns true when the image is present in the daemon's local store.
    async fn image_present(&self, tag: &str) -> Result<bool> {
        match self.docker.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(Error::backend("inspecting image", e)),
        }
    }

    async fn pull(&self, image: &DockerImage, quiet: bool) -> Result<()> {
        let credentials = image.auth.as_ref().map(|auth| DockerCredentials {
            serveraddress: Some(auth.server_address.clone()),
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            ..Default::default()
        });

        let mut progress = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.tag.clone(),
                ..Default::default()
            }),
            None,
            credentials,
        );

        // The pull is not complete until the progress stream is drained.
        while let Some(info) = progress.next().await {
            let info = info.map_err(|e| Error::backend("pulling image", e))?;
            if quiet {
                continue;
            }
            match (info.status, info.progress) {
                (Some(status), Some(progress)) => println!("{status} {progress}"),
                (Some(status), None) => println!("{status}"),
                _ => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn pull_image(&self, image: &DockerImage, policy: PullPolicy, quiet: bool) -> Result<()> {
        match policy {
            PullPolicy::Always => self.pull(image, quiet).await,
            PullPolicy::IfMissing => {
                if self.image_present(&image.tag).await? {
                    return Ok(());
                }
                self.pull(image, quiet).await
            }
            PullPolicy::Never => {
                if !self.image_present(&image.tag).await? {
                    return Err(Error::InvalidInput(format!(
                        "image not present locally: {}",
                        image.tag
                    )));
                }
                Ok(())
            }
        }
    }

    async fn create_container(&self, opts: &ContainerOpts) -> Result<Box<dyn Container>> {
        opts.validate()?;

        let mut config: Config<String> = Config {
            image: Some(opts.image.tag.clone()),
            entrypoint: Some(opts.command.clone()),
            cmd: Some(opts.arguments.clone()),
            user: Some(opts.user.clone()),
            working_dir: Some(opts.working_dir.clone()),
            ..Default::default()
        };
        let mut host = HostConfig::default();

        if opts.interactive {
            config.open_stdin = Some(true);
            config.attach_stdin = Some(true);
            config.attach_stdout = Some(true);
            config.attach_stderr = Some(true);
            config.tty = Some(true);

            // Init inserts a tiny init process as PID 1 so that background
            // processes are reaped when the interactive shell exits.
            host.init = Some(true);
        }

        let mut labels = HashMap::with_capacity(opts.labels.len() + 1);
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.extend(opts.labels.clone());
        config.labels = Some(labels);

        let mut env: Vec<String> = opts.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mut mounts = Vec::with_capacity(opts.mounts.len());
        for m in &opts.mounts {
            mounts.push(Mount {
                typ: Some(MountTypeEnum::BIND),
                source: Some(absolute_path(&m.host_path)?),
                target: Some(m.container_path.clone()),
                read_only: Some(m.read_only),
                ..Default::default()
            });
        }
        host.mounts = Some(mounts);

        // Hardware limits.
        if opts.memory != 0 {
            host.memory = Some(opts.memory.max(MIN_MEMORY_BYTES));
        }
        if opts.shared_memory > 0 {
            host.shm_size = Some(opts.shared_memory);
        }
        if opts.cpu_count != 0.0 {
            host.nano_cpus = Some((opts.cpu_count * 1_000_000_000.0) as i64);
        }
        if !opts.gpus.is_empty() {
            host.device_requests = Some(vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                device_ids: Some(opts.gpus.clone()),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]);
        } else {
            // Without an explicit "none" the Nvidia runtime exposes every
            // GPU on the host to the container.
            env.push(format!("{VISIBLE_DEVICES_ENV}=none"));
        }
        config.env = Some(env);
        config.host_config = Some(host);

        // Docker's auto-generated names frequently collide, so generate a
        // random one when the caller didn't pick one.
        let name = match &opts.name {
            Some(name) => name.clone(),
            None => Uuid::new_v4().to_string(),
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(sanitize_create_err)?;

        Ok(Box::new(DockerContainer::new(self.docker.clone(), created.id)))
    }

    async fn list_containers(&self) -> Result<Vec<Box<dyn Container>>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![MANAGED_LABEL.to_string()]);

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::backend("listing containers", e))?;

        Ok(summaries
            .into_iter()
            .filter_map(|c| c.id)
            .map(|id| Box::new(DockerContainer::new(self.docker.clone(), id)) as Box<dyn Container>)
            .collect())
    }

    fn container_by_id(&self, id: &str) -> Result<Box<dyn Container>> {
        Ok(Box::new(DockerContainer::new(
            self.docker.clone(),
            id.to_string(),
        )))
    }

    async fn close(&self) -> Result<()> {
        // The bollard client releases its connections on drop.
        Ok(())
    }
}

// =============================================================================
// Container
// =============================================================================

/// Wraps a Docker container in the common runtime container interface.
pub struct DockerContainer {
    docker: Docker,
    id: String,
}

impl DockerContainer {
    pub(crate) fn new(docker: Docker, id: String) -> Self {
        Self { docker, id }
    }
}

#[async_trait]
impl Container for DockerContainer {
    fn name(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<()> {
        self.docker
            .start_container(&self.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| translate_err("starting container", e))
    }

    async fn info(&self) -> Result<ContainerInfo> {
        let body = self
            .docker
            .inspect_container(&self.id, None)
            .await
            .map_err(|e| translate_err("inspecting container", e))?;
        project_info(&body)
    }

    async fn logs(&self, since: Option<DateTime<Utc>>) -> Result<Box<dyn LogReader>> {
        let stream = self.docker.logs(
            &self.id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                timestamps: true,
                since: since.map(|t| t.timestamp()).unwrap_or(0),
                ..Default::default()
            }),
        );
        Ok(Box::new(DockerLogReader::new(
            mux_frames(Box::pin(stream)),
            since,
        )))
    }

    async fn stats(&self) -> Result<ContainerStats> {
        let mut samples = self.docker.stats(
            &self.id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        let sample = match samples.next().await {
            Some(sample) => sample.map_err(|e| translate_err("sampling stats", e))?,
            None => return Err(Error::MalformedStream("empty stats response".into())),
        };
        Ok(derive_stats(&sample))
    }

    async fn stop(&self, timeout: Option<Duration>) -> Result<()> {
        let options = timeout.map(|t| StopContainerOptions {
            t: t.as_secs() as i64,
        });
        self.docker
            .stop_container(&self.id, options)
            .await
            .map_err(|e| translate_err("stopping container", e))
    }

    async fn remove(&self) -> Result<()> {
        self.docker
            .remove_container(
                &self.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| translate_err("removing container", e))
    }
}

// =============================================================================
// Status Projection
// =============================================================================

/// Projects the daemon's inspect view onto the normalized status machine.
fn project_info(body: &ContainerInspectResponse) -> Result<ContainerInfo> {
    let mut info = ContainerInfo::default();

    if let Some(config) = &body.config {
        info.labels = config.labels.clone().unwrap_or_default();
    }
    if let Some(host) = &body.host_config {
        info.cpu_count = host.nano_cpus.unwrap_or(0) as f64 / 1_000_000_000.0;
        info.memory = host.memory.unwrap_or(0);
    }

    info.created_at = parse_docker_time(body.created.as_deref())?;
    let state = match &body.state {
        Some(state) => state,
        None => return Err(Error::MalformedStream("inspect response without state".into())),
    };
    info.started_at = parse_docker_time(state.started_at.as_deref())?;
    info.ended_at = parse_docker_time(state.finished_at.as_deref())?;

    let exit_code = state.exit_code.unwrap_or(0) as i32;
    let state_error = state.error.clone().unwrap_or_default();

    if state.running == Some(true) {
        info.status = Some(ContainerStatus::Running);
    } else if info.ended_at.is_some() {
        // Container ended.
        info.status = Some(ContainerStatus::Exited);
        info.message = state_error;
        info.exit_code = Some(exit_code);
        if state.oom_killed == Some(true) {
            info.message = add_context(&info.message, "out of memory");
        }
    } else if exit_code != 0 {
        // Container failed to start. It's dead.
        info.status = Some(ContainerStatus::Exited);
        info.ended_at = info.started_at;
        info.message = add_context(&state_error, "failed start");
    } else {
        // Container hasn't started yet.
        info.status = Some(ContainerStatus::Created);
    }

    Ok(info)
}

fn add_context(message: &str, context: &str) -> String {
    if message.is_empty() {
        context.to_string()
    } else {
        format!("{context}: {message}")
    }
}

/// Parses a daemon timestamp. The daemon reports unset times as the year-1
/// zero value, which maps to `None`.
fn parse_docker_time(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    let s = match s {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(None),
    };
    let t = DateTime::parse_from_rfc3339(s)
        .map_err(|e| Error::MalformedStream(format!("invalid container time {s:?}: {e}")))?
        .with_timezone(&Utc);
    if t.year() <= 1 {
        return Ok(None);
    }
    Ok(Some(t))
}

// =============================================================================
// Stats Derivation
// =============================================================================

/// Derives the normalized stat set from a daemon stats sample. The CPU and
/// memory math follows the Docker CLI's own stats presentation.
fn derive_stats(s: &Stats) -> ContainerStats {
    let mut stats = BTreeMap::new();

    stats.insert(
        StatType::CpuUsagePercent,
        cpu_percent(&s.cpu_stats, &s.precpu_stats),
    );

    let mem = mem_usage_without_cache(&s.memory_stats);
    stats.insert(StatType::MemoryUsageBytes, mem);
    let limit = s.memory_stats.limit.unwrap_or(0) as f64;
    // The limit is only zero when the container isn't running and the
    // cgroup reported nothing.
    let mem_percent = if limit != 0.0 { mem / limit * 100.0 } else { 0.0 };
    stats.insert(StatType::MemoryUsagePercent, mem_percent);

    let (rx, tx) = network_bytes(s.networks.as_ref());
    stats.insert(StatType::NetworkRxBytes, rx);
    stats.insert(StatType::NetworkTxBytes, tx);

    let (read, write) = block_io_bytes(s.blkio_stats.io_service_bytes_recursive.as_deref());
    stats.insert(StatType::BlockReadBytes, read);
    stats.insert(StatType::BlockWriteBytes, write);

    ContainerStats {
        time: Utc::now(),
        stats,
    }
}

fn cpu_percent(cpu: &CPUStats, precpu: &CPUStats) -> f64 {
    let cpu_delta = cpu.cpu_usage.total_usage as f64 - precpu.cpu_usage.total_usage as f64;
    let system_delta =
        cpu.system_cpu_usage.unwrap_or(0) as f64 - precpu.system_cpu_usage.unwrap_or(0) as f64;

    let online_cpus = cpu.online_cpus.filter(|&n| n > 0).unwrap_or_else(|| {
        cpu.cpu_usage
            .percpu_usage
            .as_ref()
            .map(|v| v.len() as u64)
            .unwrap_or(0)
    }) as f64;

    if system_delta > 0.0 && cpu_delta > 0.0 {
        cpu_delta / system_delta * online_cpus * 100.0
    } else {
        0.0
    }
}

/// Memory usage with the page cache excluded, to avoid misreading cache
/// pressure as container usage.
fn mem_usage_without_cache(mem: &MemoryStats) -> f64 {
    let usage = mem.usage.unwrap_or(0);
    let cache = match &mem.stats {
        Some(MemoryStatsStats::V1(v1)) => v1.cache,
        Some(MemoryStatsStats::V2(v2)) => v2.inactive_file,
        None => 0,
    };
    usage.saturating_sub(cache) as f64
}

fn network_bytes(networks: Option<&HashMap<String, NetworkStats>>) -> (f64, f64) {
    let mut rx = 0.0;
    let mut tx = 0.0;
    if let Some(networks) = networks {
        for net in networks.values() {
            rx += net.rx_bytes as f64;
            tx += net.tx_bytes as f64;
        }
    }
    (rx, tx)
}

fn block_io_bytes(entries: Option<&[BlkioStatsEntry]>) -> (f64, f64) {
    let mut read = 0u64;
    let mut write = 0u64;
    for entry in entries.unwrap_or_default() {
        match entry.op.chars().next() {
            Some('r') | Some('R') => read += entry.value,
            Some('w') | Some('W') => write += entry.value,
            _ => {}
        }
    }
    (read as f64, write as f64)
}

// =============================================================================
// Helpers
// =============================================================================

/// Restores the daemon's stream-multiplexing frames around a demultiplexed
/// log stream. The client strips the 8-byte headers while reading the HTTP
/// response; the frame parser wants the wire format, so they are rebuilt
/// verbatim here.
fn mux_frames<S>(stream: S) -> impl AsyncRead + Send + Unpin + 'static
where
    S: Stream<Item = std::result::Result<LogOutput, BollardError>> + Send + Unpin + 'static,
{
    let frames = stream
        .map_ok(|output| {
            let (code, payload): (u8, Bytes) = match output {
                LogOutput::StdIn { message } => (0, message),
                LogOutput::StdOut { message } => (1, message),
                LogOutput::StdErr { message } => (2, message),
                LogOutput::Console { message } => (1, message),
            };
            let mut frame = BytesMut::with_capacity(8 + payload.len());
            frame.put_u8(code);
            frame.put_bytes(0, 3);
            frame.put_u32(payload.len() as u32);
            frame.extend_from_slice(&payload);
            frame.freeze()
        })
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    StreamReader::new(frames)
}

fn absolute_path(p: &str) -> Result<String> {
    let path = Path::new(p);
    let abs: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(abs.to_string_lossy().into_owned())
}

/// Trims noisy daemon messages about nonexistent mount sources down to the
/// useful suffix; everything else is wrapped as a backend failure.
fn sanitize_create_err(err: BollardError) -> Error {
    let msg = err.to_string();
    if let Some(i) = msg.find(PATH_DNE_ERROR) {
        return Error::InvalidInput(msg[i..].to_string());
    }
    Error::backend("creating container", err)
}

fn translate_err(context: &str, err: BollardError) -> Error {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => Error::NotFound,
        other => Error::backend(context, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, ContainerState};

    fn inspect_body(state: ContainerState) -> ContainerInspectResponse {
        ContainerInspectResponse {
            created: Some("2024-02-12T10:00:00.000000001Z".to_string()),
            config: Some(ContainerConfig {
                labels: Some(HashMap::from([(
                    MANAGED_LABEL.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            }),
            host_config: Some(HostConfig {
                nano_cpus: Some(2_000_000_000),
                memory: Some(64 * 1024 * 1024),
                ..Default::default()
            }),
            state: Some(state),
            ..Default::default()
        }
    }

    #[test]
    fn test_project_running() {
        let info = project_info(&inspect_body(ContainerState {
            running: Some(true),
            started_at: Some("2024-02-12T10:00:01Z".to_string()),
            finished_at: Some("0001-01-01T00:00:00Z".to_string()),
            ..Default::default()
        }))
        .unwrap();

        assert_eq!(info.status, Some(ContainerStatus::Running));
        assert!(info.started_at.is_some());
        assert!(info.ended_at.is_none());
        assert_eq!(info.cpu_count, 2.0);
        assert_eq!(info.memory, 64 * 1024 * 1024);
    }

    #[test]
    fn test_project_exited() {
        let info = project_info(&inspect_body(ContainerState {
            running: Some(false),
            exit_code: Some(137),
            oom_killed: Some(true),
            started_at: Some("2024-02-12T10:00:01Z".to_string()),
            finished_at: Some("2024-02-12T10:00:02Z".to_string()),
            ..Default::default()
        }))
        .unwrap();

        assert_eq!(info.status, Some(ContainerStatus::Exited));
        assert_eq!(info.exit_code, Some(137));
        assert_eq!(info.message, "out of memory");
        assert!(info.ended_at > info.started_at);
    }

    #[test]
    fn test_project_failed_start() {
        let info = project_info(&inspect_body(ContainerState {
            running: Some(false),
            exit_code: Some(127),
            error: Some("no such file".to_string()),
            started_at: Some("0001-01-01T00:00:00Z".to_string()),
            finished_at: Some("0001-01-01T00:00:00Z".to_string()),
            ..Default::default()
        }))
        .unwrap();

        assert_eq!(info.status, Some(ContainerStatus::Exited));
        assert_eq!(info.message, "failed start: no such file");
        // A container that never started carries no end time either.
        assert!(info.started_at.is_none());
        assert_eq!(info.ended_at, info.started_at);
        assert!(info.exit_code.is_none());
    }

    #[test]
    fn test_project_created() {
        let info = project_info(&inspect_body(ContainerState {
            running: Some(false),
            exit_code: Some(0),
            started_at: Some("0001-01-01T00:00:00Z".to_string()),
            finished_at: Some("0001-01-01T00:00:00Z".to_string()),
            ..Default::default()
        }))
        .unwrap();

        assert_eq!(info.status, Some(ContainerStatus::Created));
        assert!(info.exit_code.is_none());
    }

    #[test]
    fn test_block_io_direction() {
        let entries = vec![
            BlkioStatsEntry {
                major: 8,
                minor: 0,
                op: "Read".to_string(),
                value: 100,
            },
            BlkioStatsEntry {
                major: 8,
                minor: 0,
                op: "write".to_string(),
                value: 50,
            },
            BlkioStatsEntry {
                major: 8,
                minor: 0,
                op: "sync".to_string(),
                value: 25,
            },
        ];

        let (read, write) = block_io_bytes(Some(&entries));
        assert_eq!(read, 100.0);
        assert_eq!(write, 50.0);
        assert_eq!(block_io_bytes(None), (0.0, 0.0));
    }

    #[test]
    fn test_cpu_percent_deltas() {
        use bollard::container::{CPUUsage, ThrottlingData};

        let usage = |total| CPUUsage {
            total_usage: total,
            percpu_usage: Some(vec![0, 0]),
            usage_in_kernelmode: 0,
            usage_in_usermode: 0,
        };
        let throttling = ThrottlingData {
            periods: 0,
            throttled_periods: 0,
            throttled_time: 0,
        };
        let cpu = CPUStats {
            cpu_usage: usage(400),
            system_cpu_usage: Some(2_000),
            online_cpus: Some(2),
            throttling_data: throttling.clone(),
        };
        let precpu = CPUStats {
            cpu_usage: usage(200),
            system_cpu_usage: Some(1_000),
            online_cpus: Some(2),
            throttling_data: throttling,
        };

        // 200 of 1000 system ticks across two CPUs.
        assert_eq!(cpu_percent(&cpu, &precpu), 40.0);
    }
}
