//! Structured log messages and the reader contract.
//!
//! Every backend's log wire format decodes to the one [`Message`] shape
//! defined here; [`codec`] adds a compact binary representation of those
//! messages for persistence and interchange.

mod codec;

pub use codec::{Decoder, Encoder};

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// IO Streams
// =============================================================================

/// A Unix standard stream.
///
/// Only `Stdout` and `Stderr` are valid in log messages; `Stdin` is
/// reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IOStream {
    Stdin,
    Stdout,
    Stderr,
}

impl IOStream {
    /// Returns the stream's wire number (0/1/2).
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }

    /// Maps a wire number back to a stream.
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

impl std::fmt::Display for IOStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdin => write!(f, "stdin"),
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// A structured log message. `text` includes the trailing newline when the
/// source line had one; empty text is valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub stream: IOStream,
    /// Emission time, always UTC.
    pub time: DateTime<Utc>,
    pub text: String,
}

// =============================================================================
// Reader Trait
// =============================================================================

/// Reads structured log messages in the sequential order the container
/// emitted them.
///
/// Readers own their underlying byte source and release it when dropped.
/// They are not safe for concurrent use: one reader per caller.
#[async_trait]
pub trait LogReader: Send {
    /// Reads the next log message. The message time is UTC.
    ///
    /// Returns `Ok(None)` once all messages emitted by the container have
    /// been consumed.
    async fn read_message(&mut self) -> Result<Option<Message>>;
}
