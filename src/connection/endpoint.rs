//! Instrument Endpoints
//!
//! An [`Endpoint`] names where the instrument server listens. The server can
//! run either on a TCP port or on a Unix-domain socket file, and once a stream
//! is open the two are interchangeable.
//!
//! ## Accepted Text Forms
//!
//! ```text
//! tcp://localhost:5001     TCP, explicit scheme
//! localhost:5001           TCP, bare host:port
//! unix:///var/tmp/reg-socket
//! unix:/var/tmp/reg-socket
//! /var/tmp/reg-socket      Unix, absolute path
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// TCP port the instrument server listens on by default.
pub const DEFAULT_TCP_PORT: u16 = 5001;

/// Socket file the instrument server creates by default.
pub const DEFAULT_UNIX_PATH: &str = "/var/tmp/reg-socket";

/// Where to reach the instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A TCP `host:port` pair
    Tcp { host: String, port: u16 },

    /// A Unix-domain stream socket at a filesystem path
    Unix { path: PathBuf },
}

impl Endpoint {
    /// Creates a TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Creates a Unix-domain socket endpoint.
    pub fn unix(path: impl AsRef<Path>) -> Self {
        Endpoint::Unix {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Returns true for Unix-domain endpoints.
    pub fn is_unix(&self) -> bool {
        matches!(self, Endpoint::Unix { .. })
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::tcp("localhost", DEFAULT_TCP_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Endpoint::Unix { path } => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Errors produced when parsing an endpoint string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointParseError {
    #[error("empty endpoint")]
    Empty,

    #[error("missing port in TCP endpoint: {0}")]
    MissingPort(String),

    #[error("invalid port in TCP endpoint: {0}")]
    InvalidPort(String),

    #[error("missing host in TCP endpoint: {0}")]
    MissingHost(String),

    #[error("empty socket path in Unix endpoint")]
    EmptyPath,
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointParseError::Empty);
        }

        if let Some(rest) = s.strip_prefix("unix://").or_else(|| s.strip_prefix("unix:")) {
            if rest.is_empty() {
                return Err(EndpointParseError::EmptyPath);
            }
            return Ok(Endpoint::unix(rest));
        }

        if s.starts_with('/') || s.starts_with("./") {
            return Ok(Endpoint::unix(s));
        }

        let addr = s.strip_prefix("tcp://").unwrap_or(s);

        // rsplit so that bracketed IPv6 hosts keep their inner colons
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| EndpointParseError::MissingPort(s.to_string()))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(EndpointParseError::MissingHost(s.to_string()));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| EndpointParseError::InvalidPort(s.to_string()))?;

        Ok(Endpoint::tcp(host, port))
    }
}
