//! Error types for the runtime facade.

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the runtime facade.
///
/// These are canonical *kinds*, shared by every backend: a caller matching
/// on [`Error::NotFound`] gets the same answer whether the container lives
/// under Docker, CRI, or Kubernetes. Controller-specific failures are
/// wrapped in [`Error::Backend`] with the failing operation as context.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// The target container (or its pod) does not exist.
    #[error("container not found")]
    NotFound,

    /// The pod exists but its container has not been created yet.
    #[error("container has not started")]
    NotStarted,

    /// The backend does not implement the requested operation.
    #[error("not implemented")]
    NotImplemented,

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Input validation failed before any side effect was taken.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // =========================================================================
    // Log Stream Errors
    // =========================================================================
    /// Log framing or timestamp parsing failed; the reader is unusable.
    #[error("malformed log stream: {0}")]
    MalformedStream(String),

    /// A log stream ended mid-record. Logs never terminate mid-record in
    /// normal operation, so this is distinct from a clean end of stream.
    #[error("unexpected EOF in log stream")]
    UnexpectedEof,

    // =========================================================================
    // Controller Errors
    // =========================================================================
    /// A controller API call failed. Carries the failing operation.
    #[error("{context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps a controller error with the operation that failed.
    pub fn backend(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Returns true for [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}
