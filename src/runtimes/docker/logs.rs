//! Parser for the Docker multiplexed log stream.
//!
//! The daemon frames non-TTY container output as discrete records:
//!
//! ```text
//! +---------------------------------------+
//! | 0  | 1  | 2  | 3  | 4  | 5  | 6  | 7  |
//! | FD | 0            | payload length    |
//! +---------------------------------------+
//! ```
//!
//! followed by `length` payload bytes. With timestamps requested, each
//! payload is `<RFC3339Nano time> <text>`.

use crate::constants::MAX_LOG_LINE_BYTES;
use crate::error::{Error, Result};
use crate::logging::{IOStream, LogReader, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Translates a streamed Docker log into discrete, structured log messages.
/// This reader is not safe for concurrent use.
pub struct DockerLogReader<R> {
    r: R,
    since: Option<DateTime<Utc>>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> DockerLogReader<R> {
    /// Wraps a streaming Docker log. The stream must include timestamps.
    ///
    /// The daemon's own since parameter is second-granular, so the reader
    /// additionally skips any message before `since` itself.
    pub fn new(r: R, since: Option<DateTime<Utc>>) -> Self {
        Self {
            r,
            since,
            buf: Vec::new(),
        }
    }

    /// Reads one 8-byte record header. Returns `Ok(None)` on a clean end of
    /// stream; a partial header is an unexpected EOF.
    async fn read_header(&mut self) -> Result<Option<(IOStream, u64)>> {
        let mut header = [0u8; 8];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.r.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::UnexpectedEof);
            }
            filled += n;
        }

        let stream = match header[0] {
            1 => IOStream::Stdout,
            2 => IOStream::Stderr,
            b => {
                return Err(Error::MalformedStream(format!(
                    "unexpected log stream: {b:#x}"
                )))
            }
        };

        let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as u64;
        Ok(Some((stream, size)))
    }

    /// Reads a record payload of `size` bytes into the line buffer, keeping
    /// at most the line cap and draining the rest so framing stays intact.
    async fn read_payload(&mut self, size: u64) -> Result<()> {
        let keep = size.min(MAX_LOG_LINE_BYTES);
        let mut discard = size - keep;

        self.buf.resize(keep as usize, 0);
        self.r
            .read_exact(&mut self.buf)
            .await
            .map_err(|_| Error::UnexpectedEof)?;

        let mut scratch = [0u8; 4096];
        while discard > 0 {
            let want = discard.min(scratch.len() as u64) as usize;
            self.r
                .read_exact(&mut scratch[..want])
                .await
                .map_err(|_| Error::UnexpectedEof)?;
            discard -= want as u64;
        }
        Ok(())
    }

    /// Splits the buffered payload into its timestamp and text.
    fn parse_payload(&self, stream: IOStream) -> Result<Message> {
        let sep = self
            .buf
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::MalformedStream("invalid log time: missing delimiter".into()))?;

        let ts = std::str::from_utf8(&self.buf[..sep])
            .map_err(|e| Error::MalformedStream(format!("invalid log time: {e}")))?;
        let time = DateTime::parse_from_rfc3339(ts)
            .map_err(|e| Error::MalformedStream(format!("invalid log time: {e}")))?
            .with_timezone(&Utc);

        Ok(Message {
            stream,
            time,
            text: String::from_utf8_lossy(&self.buf[sep + 1..]).into_owned(),
        })
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> LogReader for DockerLogReader<R> {
    async fn read_message(&mut self) -> Result<Option<Message>> {
        loop {
            let (stream, size) = match self.read_header().await? {
                Some(header) => header,
                None => return Ok(None),
            };
            self.read_payload(size).await?;
            let msg = self.parse_payload(stream)?;

            if let Some(since) = self.since {
                if msg.time < since {
                    continue;
                }
            }
            return Ok(Some(msg));
        }
    }
}
