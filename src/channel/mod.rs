//! Channel Module
//!
//! Request/response correlation over one instrument connection.
//!
//! ## Components
//!
//! - **CommandChannel**: connect, call, batch and close
//! - **Batch**: bounded pipelining with in-order results
//! - **ChannelState**: lifecycle state machine with a transition feed
//! - **ChannelConfig**: timeouts, ready policy and reconnect backoff
//! - **ChannelStats**: counters for matched, stale and unsolicited replies

pub mod batch;
pub mod client;
pub mod config;
pub mod state;
pub mod stats;

pub use batch::{Batch, BatchReport};
pub use client::{ChannelError, CommandChannel};
pub use config::{
    ChannelConfig, ReadyPolicy, ReconnectPolicy, DEFAULT_CALL_TIMEOUT, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_MAX_CONCURRENCY, DEFAULT_WRITE_TIMEOUT,
};
pub use state::{ChannelState, StateTransition};
pub use stats::{ChannelStats, StatsSnapshot};
