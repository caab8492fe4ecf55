//! Backend implementations of the runtime contract.
//!
//! Each backend translates the abstract operations in [`crate::runtime`] to
//! its controller's wire API:
//!
//! - [`docker`]: the Docker daemon over its HTTP API
//! - [`cri`]: a CRI endpoint over gRPC
//! - [`kubernetes`]: pods on the current node, delegating logs/stop/stats to
//!   a node-local low-level backend

pub mod cri;
pub mod docker;
pub mod kubernetes;

use crate::constants::DEFAULT_CRI_ADDRESS;
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use std::sync::Arc;

/// Selects the node-local runtime the Kubernetes composite delegates
/// logs, stop, and stats to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowLevelBackend {
    /// A CRI gRPC endpoint. The default, pointing at containerd's socket.
    Cri { address: String },

    /// The node's Docker daemon.
    Docker,
}

impl Default for LowLevelBackend {
    fn default() -> Self {
        Self::Cri {
            address: DEFAULT_CRI_ADDRESS.to_string(),
        }
    }
}

impl std::str::FromStr for LowLevelBackend {
    type Err = Error;

    /// Parses a backend name. An empty string or "cri" selects CRI at the
    /// default address; "docker" selects the Docker daemon.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "cri" => Ok(Self::default()),
            "docker" => Ok(Self::Docker),
            other => Err(Error::InvalidInput(format!(
                "unknown low-level backend: {other}"
            ))),
        }
    }
}

impl LowLevelBackend {
    /// Connects the selected backend.
    pub(crate) async fn connect(&self) -> Result<Arc<dyn Runtime>> {
        match self {
            Self::Cri { address } => Ok(Arc::new(cri::CriRuntime::connect(address).await?)),
            Self::Docker => Ok(Arc::new(docker::DockerRuntime::new()?)),
        }
    }
}
