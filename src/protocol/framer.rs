//! Line Framer
//!
//! Turns a byte stream into discrete lines and back.
//!
//! ## How Decoding Works
//!
//! Incoming bytes are appended to a `BytesMut` buffer. [`LineDecoder::decode`]
//! then returns either:
//! - `Ok(Some(line))` - a complete line, terminator stripped and consumed
//! - `Ok(None)` - no terminator yet, read more
//! - `Err(FrameError::Oversize)` - the peer sent more than the line limit
//!   without a terminator; the buffer is discarded
//!
//! A caller never observes a line before its terminator has arrived.
//!
//! After an oversize error the stream position is somewhere in the middle of
//! a line and cannot be recovered. The connection has to be re-established.

use crate::connection::{IoError, StreamReader, StreamWriter};
use crate::protocol::types::TERMINATOR;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Default maximum line length, terminator excluded
pub const DEFAULT_MAX_LINE: usize = 4096;

/// Initial read buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Errors raised while framing lines.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Outbound text already contains a terminator
    #[error("line contains an embedded terminator at byte {position}")]
    EmbeddedTerminator { position: usize },

    /// No complete line arrived in time
    #[error("no complete line within {0:?}")]
    Timeout(Duration),

    /// The peer closed the stream; `buffered` bytes of an unterminated line
    /// were discarded
    #[error("stream closed ({buffered} bytes of partial line discarded)")]
    StreamClosed { buffered: usize },

    /// The peer sent a line longer than the limit
    #[error("line too large: {size} bytes (max: {max})")]
    Oversize { size: usize, max: usize },

    /// Reset or other transport failure
    #[error(transparent)]
    Io(#[from] IoError),
}

/// Incremental line splitter.
///
/// Remembers how far the buffer has already been scanned so a long line
/// arriving in many small reads is not rescanned from the start each time.
#[derive(Debug, Clone)]
pub struct LineDecoder {
    max_line: usize,
    scanned: usize,
}

impl LineDecoder {
    pub fn new(max_line: usize) -> Self {
        Self {
            max_line,
            scanned: 0,
        }
    }

    pub fn max_line(&self) -> usize {
        self.max_line
    }

    /// Attempts to split one line off the front of `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        let start = self.scanned.min(buf.len());

        match buf[start..].iter().position(|&b| b == TERMINATOR) {
            Some(offset) => {
                let len = start + offset;
                self.scanned = 0;

                if len > self.max_line {
                    buf.clear();
                    return Err(FrameError::Oversize {
                        size: len,
                        max: self.max_line,
                    });
                }

                let mut line = buf.split_to(len + 1);
                line.truncate(len);
                Ok(Some(line.freeze()))
            }
            None => {
                if buf.len() > self.max_line {
                    let size = buf.len();
                    buf.clear();
                    self.scanned = 0;
                    return Err(FrameError::Oversize {
                        size,
                        max: self.max_line,
                    });
                }
                self.scanned = buf.len();
                Ok(None)
            }
        }
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}

/// Splits a single line off `buf` with a fresh decoder.
///
/// Convenient for one-off use; [`LineReader`] keeps a decoder across reads.
pub fn decode_line(buf: &mut BytesMut, max_line: usize) -> Result<Option<Bytes>, FrameError> {
    LineDecoder::new(max_line).decode(buf)
}

/// Serializes `text` as one wire line.
///
/// Fails without producing anything when `text` contains a terminator.
pub fn encode_line(text: &str, dst: &mut BytesMut) -> Result<(), FrameError> {
    if let Some(position) = text.bytes().position(|b| b == TERMINATOR) {
        return Err(FrameError::EmbeddedTerminator { position });
    }
    dst.reserve(text.len() + 1);
    dst.extend_from_slice(text.as_bytes());
    dst.extend_from_slice(&[TERMINATOR]);
    Ok(())
}

/// Reads lines from the read half of a connection.
pub struct LineReader {
    stream: StreamReader,
    buffer: BytesMut,
    decoder: LineDecoder,
}

impl LineReader {
    pub fn new(stream: StreamReader, max_line: usize) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE.min(max_line + 1)),
            decoder: LineDecoder::new(max_line),
        }
    }

    /// Waits for the next complete line.
    ///
    /// With `timeout` set the whole wait is bounded by it. Cancelling the
    /// returned future loses no data: bytes already read stay buffered for
    /// the next call.
    pub async fn read_line(&mut self, timeout: Option<Duration>) -> Result<String, FrameError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            match self.decoder.decode(&mut self.buffer) {
                Ok(Some(line)) => {
                    trace!(len = line.len(), remaining = self.buffer.len(), "Decoded line");
                    return Ok(String::from_utf8_lossy(&line).into_owned());
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Discarding oversized line");
                    return Err(e);
                }
            }

            let remaining = match (deadline, timeout) {
                (Some(deadline), Some(limit)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(FrameError::Timeout(limit));
                    }
                    Some(deadline - now)
                }
                _ => None,
            };

            match self.stream.read_buf(&mut self.buffer, remaining).await {
                Ok(_) => {}
                Err(IoError::Closed) => {
                    let buffered = self.buffer.len();
                    self.buffer.clear();
                    return Err(FrameError::StreamClosed { buffered });
                }
                Err(IoError::Timeout(_)) => {
                    return Err(FrameError::Timeout(timeout.unwrap_or_default()));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Bytes received but not yet returned as a line.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Writes lines to the write half of a connection.
pub struct LineWriter {
    stream: StreamWriter,
    buffer: BytesMut,
    write_timeout: Duration,
}

impl LineWriter {
    pub fn new(stream: StreamWriter, write_timeout: Duration) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(256),
            write_timeout,
        }
    }

    /// Appends the terminator to `text` and writes it out.
    ///
    /// Text containing a terminator is rejected and nothing reaches the wire.
    pub async fn write_line(&mut self, text: &str) -> Result<(), FrameError> {
        self.buffer.clear();
        encode_line(text, &mut self.buffer)?;
        self.stream
            .write_all(&self.buffer, self.write_timeout)
            .await?;
        trace!(len = text.len(), "Wrote line");
        Ok(())
    }

    /// Shuts the underlying stream down. Idempotent.
    pub async fn close(&mut self) {
        self.stream.close().await;
    }
}
