//! # unirun
//!
//! **Uniform facade over heterogeneous container backends.**
//!
//! This crate exposes a single lifecycle and introspection contract for
//! managed single-container workloads on one host, regardless of whether the
//! workload runs under a Docker daemon, a CRI endpoint, or a Kubernetes
//! node. Callers program against the [`Runtime`] and [`Container`] traits;
//! each backend translates those operations to its controller's wire API and
//! projects the controller's state onto one normalized status machine.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             unirun                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                 Runtime / Container Traits                  │    │
//! │  │   pull_image → create_container → start → info/logs/stats   │    │
//! │  │                      → stop → remove                        │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                  Log Framing Engine                       │      │
//! │  │  Docker mux frames │ CRI text lines │ Docker-JSON lines   │      │
//! │  │        all decoded to one structured Message stream       │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! ├──────────────────────────────┼──────────────────────────────────────┤
//! │                         Backends                                    │
//! │  ┌──────────────┐  ┌───────────────┐  ┌────────────────────────┐    │
//! │  │ DockerRuntime│  │  CriRuntime   │  │   KubernetesRuntime    │    │
//! │  │  (bollard)   │  │ (tonic gRPC)  │  │ (kube + low-level CRI) │    │
//! │  └──────────────┘  └───────────────┘  └────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Status Machine
//!
//! Every backend projects its controller's view onto three states:
//!
//! ```text
//!   ┌─────────┐   start   ┌─────────┐   exit    ┌─────────┐
//!   │ Created │ ────────► │ Running │ ────────► │ Exited  │
//!   └─────────┘           └─────────┘           └─────────┘
//! ```
//!
//! `Exited` is terminal; `remove` deletes the container (and, on Kubernetes,
//! its pod and disruption budget) with no grace period.
//!
//! # Logs
//!
//! Container logs arrive in three distinct wire formats: the Docker
//! multiplexed binary stream, CRI newline-delimited text, and JSON-per-line
//! records. Each decoder yields canonical [`logging::Message`] values;
//! [`logging::Encoder`]/[`logging::Decoder`] provide a compact MessagePack
//! representation of those messages for persistence and interchange.
//!
//! # Example
//!
//! ```rust,ignore
//! use unirun::{ContainerOpts, DockerImage, DockerRuntime, PullPolicy, Runtime};
//!
//! #[tokio::main]
//! async fn main() -> unirun::Result<()> {
//!     let rt = DockerRuntime::new()?;
//!
//!     let image = DockerImage::new("docker.io/busybox:latest");
//!     rt.pull_image(&image, PullPolicy::IfMissing, true).await?;
//!
//!     let ctr = rt
//!         .create_container(&ContainerOpts {
//!             image,
//!             command: vec!["echo".into(), "hello".into()],
//!             ..Default::default()
//!         })
//!         .await?;
//!     ctr.start().await?;
//!
//!     let mut logs = ctr.logs(None).await?;
//!     while let Some(msg) = logs.read_message().await? {
//!         print!("{}", msg.text);
//!     }
//!
//!     ctr.remove().await?;
//!     rt.close().await
//! }
//! ```

// =============================================================================
// Modules
// =============================================================================

pub mod constants;
mod error;
pub mod logging;
mod runtime;
pub mod runtimes;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{Error, Result};
pub use runtime::{
    Container, ContainerInfo, ContainerOpts, ContainerStats, ContainerStatus, DockerImage, Mount,
    PullPolicy, RegistryAuth, Runtime, StatType,
};
pub use runtimes::cri::CriRuntime;
pub use runtimes::docker::DockerRuntime;
pub use runtimes::kubernetes::KubernetesRuntime;
pub use runtimes::LowLevelBackend;
