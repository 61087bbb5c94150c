//! Socket Connection Manager
//!
//! The [`ConnectionManager`] knows how to open a stream to an [`Endpoint`]
//! and hands the two halves of that stream to the layer above:
//!
//! ```text
//!                    ConnectionManager::connect()
//!                               │
//!              ┌────────────────┴────────────────┐
//!              ▼                                 ▼
//!      ┌───────────────┐                 ┌───────────────┐
//!      │ StreamReader  │                 │ StreamWriter  │
//!      │ (reader task) │                 │ (writer task) │
//!      └───────────────┘                 └───────────────┘
//! ```
//!
//! Splitting the stream lets a blocked read never stall a write, which is
//! what makes pipelining worth anything.
//!
//! The manager does not retry. Every failure is reported as a typed error
//! and the command channel decides what to do about it, so the bookkeeping
//! of in-flight requests stays in one place.

use crate::connection::Endpoint;
use bytes::BytesMut;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

/// Read half of a connection, type-erased over TCP and Unix sockets.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a connection, type-erased over TCP and Unix sockets.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors raised while establishing a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Nothing is listening at the endpoint
    #[error("connection refused by {endpoint}")]
    Refused { endpoint: Endpoint },

    /// The connect did not complete within the configured timeout
    #[error("timed out connecting to {endpoint} after {after:?}")]
    Timeout { endpoint: Endpoint, after: Duration },

    /// The host or socket file does not exist
    #[error("endpoint not found: {endpoint}")]
    NotFound { endpoint: Endpoint },

    /// Any other failure while connecting
    #[error("failed to connect to {endpoint}: {source}")]
    Other {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
}

impl ConnectionError {
    fn from_io(endpoint: &Endpoint, err: io::Error) -> Self {
        let endpoint = endpoint.clone();
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectionError::Refused { endpoint },
            io::ErrorKind::NotFound => ConnectionError::NotFound { endpoint },
            _ => ConnectionError::Other {
                endpoint,
                source: err,
            },
        }
    }
}

/// Errors raised on an established connection.
#[derive(Debug, Error)]
pub enum IoError {
    /// The peer closed the stream (zero-byte read, or write after close)
    #[error("connection closed")]
    Closed,

    /// The peer reset or aborted the connection
    #[error("connection reset by peer")]
    Reset,

    /// The operation did not complete in time
    #[error("I/O timed out after {0:?}")]
    Timeout(Duration),

    /// Anything else the OS reported
    #[error("I/O error: {0}")]
    Other(#[source] io::Error),
}

impl From<io::Error> for IoError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => IoError::Reset,
            io::ErrorKind::UnexpectedEof => IoError::Closed,
            _ => IoError::Other(err),
        }
    }
}

/// Statistics for the socket layer.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Successful connects, including reconnects
    pub connects: AtomicU64,
    /// Failed connect attempts
    pub connect_failures: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Read half of an open connection.
pub struct StreamReader {
    inner: BoxedReader,
    stats: Arc<ConnectionStats>,
}

impl StreamReader {
    /// Wraps any async reader. Used by the manager, and by tests to inject
    /// in-memory streams.
    pub fn new(inner: BoxedReader, stats: Arc<ConnectionStats>) -> Self {
        Self { inner, stats }
    }

    /// Reads whatever is available into `buf`.
    ///
    /// A zero-byte read means the peer closed the stream and is reported as
    /// [`IoError::Closed`]. With `timeout` set, waiting longer than that fails
    /// with [`IoError::Timeout`]; no bytes are lost when that happens.
    pub async fn read_buf(
        &mut self,
        buf: &mut BytesMut,
        timeout: Option<Duration>,
    ) -> Result<usize, IoError> {
        // Ensure we have some capacity
        if buf.capacity() - buf.len() < 1024 {
            buf.reserve(4096);
        }

        let n = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.inner.read_buf(buf))
                .await
                .map_err(|_| IoError::Timeout(limit))??,
            None => self.inner.read_buf(buf).await?,
        };

        if n == 0 {
            return Err(IoError::Closed);
        }

        self.stats.bytes_read(n);
        trace!(bytes = n, "Read data");
        Ok(n)
    }
}

/// Write half of an open connection.
pub struct StreamWriter {
    inner: BoxedWriter,
    stats: Arc<ConnectionStats>,
    closed: bool,
}

impl StreamWriter {
    pub fn new(inner: BoxedWriter, stats: Arc<ConnectionStats>) -> Self {
        Self {
            inner,
            stats,
            closed: false,
        }
    }

    /// Writes every byte and flushes.
    ///
    /// Short writes are retried until the whole buffer is out. The entire
    /// operation is bounded by `timeout`.
    pub async fn write_all(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), IoError> {
        if self.closed {
            return Err(IoError::Closed);
        }

        let write = async {
            self.inner.write_all(bytes).await?;
            self.inner.flush().await
        };

        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| IoError::Timeout(timeout))??;

        self.stats.bytes_written(bytes.len());
        trace!(bytes = bytes.len(), "Wrote data");
        Ok(())
    }

    /// Shuts the write side down. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.inner.shutdown().await {
            debug!(error = %e, "Shutdown of write half failed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Opens connections to one endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    endpoint: Endpoint,
    connect_timeout: Duration,
    stats: Arc<ConnectionStats>,
}

impl ConnectionManager {
    pub fn new(endpoint: Endpoint, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
            stats: Arc::new(ConnectionStats::new()),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Opens a fresh connection and returns its read and write halves.
    pub async fn connect(&self) -> Result<(StreamReader, StreamWriter), ConnectionError> {
        let result = tokio::time::timeout(self.connect_timeout, self.open()).await;

        let (reader, writer) = match result {
            Ok(Ok(halves)) => halves,
            Ok(Err(e)) => {
                self.stats.connect_failed();
                debug!(endpoint = %self.endpoint, error = %e, "Connect failed");
                return Err(ConnectionError::from_io(&self.endpoint, e));
            }
            Err(_) => {
                self.stats.connect_failed();
                debug!(endpoint = %self.endpoint, "Connect timed out");
                return Err(ConnectionError::Timeout {
                    endpoint: self.endpoint.clone(),
                    after: self.connect_timeout,
                });
            }
        };

        self.stats.connected();
        info!(endpoint = %self.endpoint, "Connected to instrument");

        Ok((
            StreamReader::new(reader, Arc::clone(&self.stats)),
            StreamWriter::new(writer, Arc::clone(&self.stats)),
        ))
    }

    async fn open(&self) -> io::Result<(BoxedReader, BoxedWriter)> {
        match &self.endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                // Commands are tiny and latency-bound
                stream.set_nodelay(true)?;
                let (read, write) = stream.into_split();
                Ok((Box::new(read), Box::new(write)))
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                let (read, write) = stream.into_split();
                Ok((Box::new(read), Box::new(write)))
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "Unix-domain sockets are not available on this platform",
            )),
        }
    }
}
