//! Channel Configuration
//!
//! Everything an embedding program can tune about a [`CommandChannel`]
//! lives in [`ChannelConfig`]. Defaults suit an instrument on the local
//! network or on the same host.
//!
//! [`CommandChannel`]: crate::channel::CommandChannel

use crate::connection::Endpoint;
use crate::protocol::DEFAULT_MAX_LINE;
use std::time::Duration;

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default per-call response timeout
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on a single line write
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on outstanding pipelined requests
pub const DEFAULT_MAX_CONCURRENCY: usize = 64;

/// What a call does when the channel is not `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyPolicy {
    /// Wait for `Ready`, bounded by the call's timeout
    #[default]
    Wait,

    /// Fail immediately with `ChannelClosed`
    FailFast,
}

/// How the channel re-establishes a lost connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect automatically after a connection loss
    pub enabled: bool,

    /// Delay after the first failed attempt (default: 100ms)
    pub initial_backoff: Duration,

    /// Upper bound for the doubling delay (default: 5s)
    pub max_backoff: Duration,

    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects on its own.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// True once `attempt` attempts have been spent.
    pub fn exhausted(&self, attempt: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempt >= max)
    }
}

/// Configuration for a command channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Where the instrument listens
    pub endpoint: Endpoint,

    /// Bound on establishing a connection (default: 2s)
    pub connect_timeout: Duration,

    /// Response timeout used by `send` and by batch items (default: 5s)
    pub call_timeout: Duration,

    /// Bound on writing one line; exceeding it drops the connection (default: 5s)
    pub write_timeout: Duration,

    /// Behaviour of calls submitted while not `Ready`
    pub ready_policy: ReadyPolicy,

    /// Automatic reconnection
    pub reconnect: ReconnectPolicy,

    /// Upper bound on the concurrency a batch may request (default: 64)
    pub max_concurrency: usize,

    /// Longest accepted reply line, terminator excluded (default: 4096)
    pub max_line: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new(Endpoint::default())
    }
}

impl ChannelConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            ready_policy: ReadyPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_line: DEFAULT_MAX_LINE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_ready_policy(mut self, policy: ReadyPolicy) -> Self {
        self.ready_policy = policy;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_max_line(mut self, max: usize) -> Self {
        self.max_line = max;
        self
    }

    /// Clamps a requested batch concurrency into `1..=max_concurrency`.
    pub fn clamp_concurrency(&self, requested: usize) -> usize {
        requested.clamp(1, self.max_concurrency.max(1))
    }
}
