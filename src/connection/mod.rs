//! Connection Module
//!
//! This module owns the socket side of a command channel: naming the
//! instrument ([`Endpoint`]) and opening streams to it ([`ConnectionManager`]).
//!
//! ## Features
//!
//! - **Two transports**: TCP `host:port` and Unix-domain socket paths
//! - **Connect timeout**: unreachable instruments fail fast with a typed error
//! - **Split halves**: reads and writes proceed independently
//! - **Statistics**: connects and byte counters
//!
//! ## Example
//!
//! ```ignore
//! use linkwire::connection::{ConnectionManager, Endpoint};
//! use std::time::Duration;
//!
//! let manager = ConnectionManager::new(Endpoint::tcp("localhost", 5001), Duration::from_secs(2));
//! let (reader, writer) = manager.connect().await?;
//! ```

pub mod endpoint;
pub mod manager;

// Re-export commonly used types
pub use endpoint::{Endpoint, EndpointParseError, DEFAULT_TCP_PORT, DEFAULT_UNIX_PATH};
pub use manager::{
    BoxedReader, BoxedWriter, ConnectionError, ConnectionManager, ConnectionStats, IoError,
    StreamReader, StreamWriter,
};
