//! Compact binary codec for structured log messages.
//!
//! Each message is a three-element MessagePack array: the stream as a small
//! integer (1 stdout, 2 stderr), the time as a timestamp extension, and the
//! text as a length-prefixed string. The encoding is self-describing, so a
//! decoder needs no schema beyond this module.

use super::{IOStream, Message};
use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use rmp::decode::{self, NumValueReadError, ValueReadError};
use rmp::encode::{self, ValueWriteError};
use std::io::{Read, Write};

const FIELD_COUNT: u32 = 3;

/// MessagePack extension type reserved for timestamps.
const TIMESTAMP_EXT: i8 = -1;

/// Mask selecting the 34-bit seconds field of the 64-bit timestamp form.
const SECONDS_34_MASK: u64 = (1 << 34) - 1;

// =============================================================================
// Encoder
// =============================================================================

/// Writes structured log messages to an output stream.
pub struct Encoder<W: Write> {
    w: W,
}

impl<W: Write> Encoder<W> {
    /// Returns a new encoder that writes to `w`.
    pub fn new(w: W) -> Self {
        Self { w }
    }

    /// Writes the binary encoding of `msg` to the stream.
    pub fn encode(&mut self, msg: &Message) -> Result<()> {
        if msg.stream != IOStream::Stdout && msg.stream != IOStream::Stderr {
            return Err(Error::InvalidInput("invalid IO stream".into()));
        }

        encode::write_array_len(&mut self.w, FIELD_COUNT).map_err(write_err)?;
        encode::write_sint(&mut self.w, msg.stream.as_i64()).map_err(write_err)?;
        self.encode_time(&msg.time)?;
        encode::write_str(&mut self.w, &msg.text).map_err(write_err)?;
        Ok(())
    }

    /// Writes `time` in the smallest timestamp-extension form that can
    /// represent it: 32-bit seconds, 64-bit packed seconds+nanoseconds, or
    /// the full 96-bit form for times outside the 34-bit second range.
    fn encode_time(&mut self, time: &DateTime<Utc>) -> Result<()> {
        let secs = time.timestamp();
        let nanos = time.timestamp_subsec_nanos();

        if secs >= 0 && (secs as u64) >> 34 == 0 {
            let data = ((nanos as u64) << 34) | secs as u64;
            if data & !0xffff_ffff == 0 {
                encode::write_ext_meta(&mut self.w, 4, TIMESTAMP_EXT).map_err(write_err)?;
                self.w.write_all(&(data as u32).to_be_bytes())?;
            } else {
                encode::write_ext_meta(&mut self.w, 8, TIMESTAMP_EXT).map_err(write_err)?;
                self.w.write_all(&data.to_be_bytes())?;
            }
        } else {
            encode::write_ext_meta(&mut self.w, 12, TIMESTAMP_EXT).map_err(write_err)?;
            self.w.write_all(&nanos.to_be_bytes())?;
            self.w.write_all(&secs.to_be_bytes())?;
        }
        Ok(())
    }
}

// =============================================================================
// Decoder
// =============================================================================

/// Reads and decodes structured log messages from an input stream.
pub struct Decoder<R: Read> {
    r: R,
}

impl<R: Read> Decoder<R> {
    /// Returns a new decoder that reads from `r`.
    pub fn new(r: R) -> Self {
        Self { r }
    }

    /// Reads the next message from the stream. Decoded times are normalized
    /// to UTC.
    pub fn decode(&mut self) -> Result<Message> {
        let len = decode::read_array_len(&mut self.r).map_err(read_err)?;
        if len != FIELD_COUNT {
            return Err(Error::MalformedStream(
                "possible corruption or invalid encoding".into(),
            ));
        }

        let raw: i64 = decode::read_int(&mut self.r).map_err(num_read_err)?;
        let stream = match IOStream::from_i64(raw) {
            Some(s @ IOStream::Stdout) | Some(s @ IOStream::Stderr) => s,
            _ => return Err(Error::InvalidInput("invalid IO stream".into())),
        };

        let time = self.decode_time()?;

        let text_len = decode::read_str_len(&mut self.r).map_err(read_err)?;
        let mut buf = vec![0u8; text_len as usize];
        self.r.read_exact(&mut buf)?;
        let text = String::from_utf8(buf)
            .map_err(|e| Error::MalformedStream(format!("text is not UTF-8: {e}")))?;

        Ok(Message { stream, time, text })
    }

    fn decode_time(&mut self) -> Result<DateTime<Utc>> {
        let meta = decode::read_ext_meta(&mut self.r).map_err(read_err)?;
        if meta.typeid != TIMESTAMP_EXT {
            return Err(Error::MalformedStream(format!(
                "unexpected extension type: {}",
                meta.typeid
            )));
        }

        let (secs, nanos) = match meta.size {
            4 => {
                let mut buf = [0u8; 4];
                self.r.read_exact(&mut buf)?;
                (u32::from_be_bytes(buf) as i64, 0u32)
            }
            8 => {
                let mut buf = [0u8; 8];
                self.r.read_exact(&mut buf)?;
                let data = u64::from_be_bytes(buf);
                ((data & SECONDS_34_MASK) as i64, (data >> 34) as u32)
            }
            12 => {
                let mut nanos_buf = [0u8; 4];
                let mut secs_buf = [0u8; 8];
                self.r.read_exact(&mut nanos_buf)?;
                self.r.read_exact(&mut secs_buf)?;
                (i64::from_be_bytes(secs_buf), u32::from_be_bytes(nanos_buf))
            }
            n => {
                return Err(Error::MalformedStream(format!(
                    "unsupported timestamp length: {n}"
                )))
            }
        };

        Utc.timestamp_opt(secs, nanos)
            .single()
            .ok_or_else(|| Error::MalformedStream("timestamp out of range".into()))
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

fn write_err(err: ValueWriteError<std::io::Error>) -> Error {
    match err {
        ValueWriteError::InvalidMarkerWrite(e) | ValueWriteError::InvalidDataWrite(e) => {
            Error::Io(e)
        }
    }
}

fn read_err(err: ValueReadError<std::io::Error>) -> Error {
    match err {
        ValueReadError::TypeMismatch(marker) => {
            Error::MalformedStream(format!("unexpected type marker: {marker:?}"))
        }
        ValueReadError::InvalidMarkerRead(e) | ValueReadError::InvalidDataRead(e) => Error::Io(e),
    }
}

fn num_read_err(err: NumValueReadError<std::io::Error>) -> Error {
    match err {
        NumValueReadError::TypeMismatch(marker) => {
            Error::MalformedStream(format!("unexpected type marker: {marker:?}"))
        }
        NumValueReadError::OutOfRange => Error::MalformedStream("integer out of range".into()),
        NumValueReadError::InvalidMarkerRead(e) | NumValueReadError::InvalidDataRead(e) => {
            Error::Io(e)
        }
    }
}
