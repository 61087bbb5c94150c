//! # Linkwire - Async Command Channel for Line-Oriented Instruments
//!
//! Linkwire talks to an instrument control server over a plain text
//! protocol: the client writes a command terminated by `\n`, the server
//! answers with exactly one `\n`-terminated line, and replies come back in
//! the order the commands were sent. The server listens either on a TCP
//! port or on a Unix-domain socket.
//!
//! ## Features
//!
//! - **Both Transports**: TCP and Unix-domain sockets behind one API
//! - **Correlation**: every command gets exactly its own reply, even with
//!   many callers sharing a channel
//! - **Pipelining**: batches keep several commands in flight and return
//!   results in order
//! - **Timeouts Without Desync**: an abandoned call's late reply is
//!   discarded instead of being handed to the next caller
//! - **Reconnection**: exponential backoff with observable state changes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Linkwire                                   │
//! │                                                                         │
//! │   callers ──call()/call_batch()──┐                                      │
//! │                                  ▼                                      │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │                       CommandChannel                             │   │
//! │  │  ┌──────────────┐   ┌───────────────────┐   ┌──────────────┐     │   │
//! │  │  │ writer task  │──>│  in-flight FIFO   │<──│ reader task  │     │   │
//! │  │  └──────┬───────┘   └───────────────────┘   └──────▲───────┘     │   │
//! │  │         │        StateCell (watch + broadcast)     │             │   │
//! │  └─────────┼──────────────────────────────────────────┼─────────────┘   │
//! │            ▼                                          │                 │
//! │  ┌──────────────┐                             ┌──────────────┐          │
//! │  │ LineWriter   │                             │ LineReader   │          │
//! │  └──────┬───────┘                             └──────▲───────┘          │
//! │         ▼                                            │                  │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │         ConnectionManager (TcpStream / UnixStream)               │   │
//! │  └──────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use linkwire::{ChannelConfig, CommandChannel, Endpoint};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let endpoint: Endpoint = "unix:///var/tmp/reg-socket".parse()?;
//!     let channel = CommandChannel::connect(ChannelConfig::new(endpoint)).await?;
//!
//!     let reply = channel.call("getDebug", Duration::from_secs(1)).await?;
//!     println!("{}", reply);
//!
//!     let commands = ["a", "b", "c"].map(|c| c.parse().unwrap());
//!     let report = channel.call_batch(commands, 3).collect().await;
//!     for (command, result) in report.results {
//!         println!("{} -> {:?}", command, result);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`connection`]: endpoints, connecting, timed reads and writes
//! - [`protocol`]: commands, responses and newline framing
//! - [`channel`]: the command channel, batches, state and statistics
//!
//! ## Design Highlights
//!
//! ### Ordering Is the Only Correlation
//!
//! The wire protocol carries no request identifiers. A request joins the
//! in-flight queue before its bytes are written, and every received line
//! completes the oldest queued request. Pipelining therefore assumes the
//! server answers strictly in order; a batch with concurrency 1 makes no
//! such assumption.
//!
//! ### No Silent Retries
//!
//! A command that may have reached the instrument is never replayed. After
//! a connection loss the caller gets `ConnectionLost` and decides.

pub mod channel;
pub mod connection;
pub mod protocol;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types for convenience
pub use channel::{
    Batch, BatchReport, ChannelConfig, ChannelError, ChannelState, CommandChannel, ReadyPolicy,
    ReconnectPolicy, StateTransition, StatsSnapshot,
};
pub use connection::{ConnectionError, Endpoint, EndpointParseError};
pub use protocol::{Command, CommandError, FrameError, Response};

/// The TCP port instrument servers listen on by default
pub const DEFAULT_PORT: u16 = connection::DEFAULT_TCP_PORT;

/// The host used when none is given
pub const DEFAULT_HOST: &str = "localhost";

/// The socket file instrument servers create by default
pub const DEFAULT_SOCKET_PATH: &str = connection::DEFAULT_UNIX_PATH;

/// Version of Linkwire
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
