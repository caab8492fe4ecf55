//! Parsers for on-disk container log files.
//!
//! CRI runtimes write newline-delimited log files in one of two formats:
//!
//! ```text
//! 2016-10-06T00:17:09.669794202Z stdout P log content 1
//! {"log":"content 2","stream":"stderr","time":"2016-10-06T00:17:10.113242941Z"}
//! ```
//!
//! The reader probes both formats on the first line and sticks with the
//! winner for the rest of the stream. A line that later fails to parse is
//! logged and skipped; the stream does not halt on malformed lines.

use crate::error::{Error, Result};
use crate::logging::{IOStream, LogReader, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::warn;

/// Tag marking a line as a fragment of a longer logical line. The trailing
/// newline of a partial line is an artifact of the file format and is
/// stripped; full (`F`) lines keep theirs.
const TAG_PARTIAL: &str = "P";

/// Sub-tags are joined with this delimiter, e.g. `P:first`.
const TAG_DELIMITER: char = ':';

/// The wire format of a log file, fixed once detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineFormat {
    /// `<time> <stream> <tag> <text>` lines.
    CriText,
    /// One JSON object per line.
    DockerJson,
}

/// Translates a CRI-managed log file into discrete, structured log
/// messages. This reader is not safe for concurrent use.
pub struct CriLogReader<R> {
    buf: BufReader<R>,
    since: Option<DateTime<Utc>>,
    format: Option<LineFormat>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> CriLogReader<R> {
    /// Wraps a log byte stream, skipping messages before `since`.
    ///
    /// The reader introduces its own buffering and may read beyond the bytes
    /// consumed through messages.
    pub fn new(r: R, since: Option<DateTime<Utc>>) -> Self {
        Self {
            buf: BufReader::new(r),
            since,
            format: None,
            line: Vec::new(),
        }
    }

    /// Picks the parser for the whole stream based on a sample line.
    fn detect_format(line: &[u8]) -> Result<LineFormat> {
        if parse_cri_line(line).is_ok() {
            return Ok(LineFormat::CriText);
        }
        if parse_json_line(line).is_ok() {
            return Ok(LineFormat::DockerJson);
        }
        Err(Error::MalformedStream(format!(
            "unsupported log format: {:?}",
            String::from_utf8_lossy(line)
        )))
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> LogReader for CriLogReader<R> {
    async fn read_message(&mut self) -> Result<Option<Message>> {
        loop {
            self.line.clear();
            let n = self.buf.read_until(b'\n', &mut self.line).await?;
            if n == 0 {
                // File ended normally.
                return Ok(None);
            }
            if self.line.last() != Some(&b'\n') {
                // File ended in a partial line.
                return Err(Error::UnexpectedEof);
            }

            let format = match self.format {
                Some(format) => format,
                None => {
                    let format = Self::detect_format(&self.line)?;
                    self.format = Some(format);
                    format
                }
            };

            let parsed = match format {
                LineFormat::CriText => parse_cri_line(&self.line),
                LineFormat::DockerJson => parse_json_line(&self.line),
            };
            let msg = match parsed {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(error = %err, "failed to parse log line");
                    continue;
                }
            };

            // Skip lines before the start time.
            if let Some(since) = self.since {
                if msg.time < since {
                    continue;
                }
            }
            return Ok(Some(msg));
        }
    }
}

// =============================================================================
// CRI Text Format
// =============================================================================

/// Parses one `<time> <stream> <tag> <text>` line.
pub(crate) fn parse_cri_line(line: &[u8]) -> Result<Message> {
    let (ts, rest) = split_field(line).ok_or_else(malformed("timestamp is not found"))?;
    let time = parse_rfc3339(ts)?;

    let (stream_token, rest) = split_field(rest).ok_or_else(malformed("stream type is not found"))?;
    let stream = match stream_token {
        b"stdout" => IOStream::Stdout,
        b"stderr" => IOStream::Stderr,
        other => {
            return Err(Error::MalformedStream(format!(
                "unexpected stream type {:?}",
                String::from_utf8_lossy(other)
            )))
        }
    };

    let (tag, mut text) = split_field(rest).ok_or_else(malformed("log tag is not found"))?;
    let first_tag = std::str::from_utf8(tag)
        .ok()
        .and_then(|t| t.split(TAG_DELIMITER).next())
        .unwrap_or_default();
    if first_tag == TAG_PARTIAL && text.last() == Some(&b'\n') {
        text = &text[..text.len() - 1];
    }

    Ok(Message {
        stream,
        time,
        text: String::from_utf8_lossy(text).into_owned(),
    })
}

/// Splits `data` at its first space, returning the field and the remainder.
fn split_field(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let idx = data.iter().position(|&b| b == b' ')?;
    Some((&data[..idx], &data[idx + 1..]))
}

// =============================================================================
// Docker JSON Format
// =============================================================================

#[derive(Deserialize)]
struct JsonLogLine {
    #[serde(default)]
    log: String,
    #[serde(default)]
    stream: Option<String>,
    time: String,
}

/// Parses one `{"log": ..., "stream": ..., "time": ...}` line.
pub(crate) fn parse_json_line(line: &[u8]) -> Result<Message> {
    let parsed: JsonLogLine = serde_json::from_slice(line).map_err(|e| {
        Error::MalformedStream(format!(
            "failed to unmarshal log {:?}: {e}",
            String::from_utf8_lossy(line)
        ))
    })?;

    let stream = match parsed.stream.as_deref() {
        None | Some("") | Some("stdout") => IOStream::Stdout,
        Some("stderr") => IOStream::Stderr,
        Some(other) => {
            return Err(Error::MalformedStream(format!(
                "unexpected stream type {other:?}"
            )))
        }
    };

    Ok(Message {
        stream,
        time: parse_rfc3339(parsed.time.as_bytes())?,
        text: parsed.log,
    })
}

// =============================================================================
// Helpers
// =============================================================================

fn parse_rfc3339(bytes: &[u8]) -> Result<DateTime<Utc>> {
    let s = std::str::from_utf8(bytes)
        .map_err(|e| Error::MalformedStream(format!("unexpected timestamp format: {e}")))?;
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| Error::MalformedStream(format!("unexpected timestamp format {s:?}: {e}")))?
        .with_timezone(&Utc))
}

fn malformed(msg: &'static str) -> impl Fn() -> Error {
    move || Error::MalformedStream(msg.to_string())
}
