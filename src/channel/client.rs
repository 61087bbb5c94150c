//! Command Channel
//!
//! The public face of the crate. A [`CommandChannel`] owns one connection to
//! the instrument and correlates every command with exactly one reply.
//!
//! ## Architecture
//!
//! ```text
//!  call() / call_batch()
//!        │ submit (mpsc, in order)
//!        ▼
//! ┌──────────────┐  push_back   ┌────────────────────┐  pop_front  ┌──────────────┐
//! │ writer task  │─────────────>│ in-flight FIFO     │<────────────│ reader task  │
//! │ LineWriter   │              │ VecDeque<Pending>  │             │ LineReader   │
//! └──────┬───────┘              └────────────────────┘             └──────▲───────┘
//!        │ "cmd\n"                                                        │ "reply\n"
//!        ▼                                                                │
//!   ════════════════════════════ socket ═════════════════════════════════╛
//! ```
//!
//! The protocol has no request identifiers, so the only correlation is
//! order: the instrument answers commands in the order it received them,
//! exactly once each. The writer pushes a request onto the FIFO before its
//! line goes out, so a reply can never arrive ahead of its request.
//!
//! ## Cancellation
//!
//! Dropping a call future, or letting it time out, drops the completion
//! handle. The request stays in the FIFO; when its reply arrives the reader
//! pops it and throws the reply away. A command the writer has not written
//! yet is skipped entirely. Either way later calls never see a stale reply.
//!
//! ## Connection Loss
//!
//! Whichever task hits an I/O error tears the session down: both tasks are
//! stopped, every outstanding request fails with `ConnectionLost`, and the
//! channel goes `Disconnected`. With auto-reconnect enabled a background
//! task then walks `Connecting -> Ready` with exponential backoff. Commands
//! are never replayed; whether to retry one is the caller's decision.

use crate::channel::batch::Batch;
use crate::channel::config::{ChannelConfig, ReadyPolicy};
use crate::channel::state::{ChannelState, StateCell, StateTransition};
use crate::channel::stats::{ChannelStats, StatsSnapshot};
use crate::connection::{ConnectionError, ConnectionManager, Endpoint, StreamReader, StreamWriter};
use crate::protocol::{Command, CommandError, LineReader, LineWriter, Response};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Errors returned to callers of a command channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel was closed, or is not ready and the policy is fail-fast
    #[error("channel closed")]
    ChannelClosed,

    /// The command text cannot be sent
    #[error("invalid command: {0}")]
    CommandInvalid(#[from] CommandError),

    /// No reply within the deadline. `sent` is false when the deadline
    /// passed while still waiting for the channel to become ready.
    #[error("no response within {after:?}")]
    Timeout { after: Duration, sent: bool },

    /// The connection dropped while the request was outstanding
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl ChannelError {
    /// True when the instrument may have received and acted on the command.
    ///
    /// Retrying such a command can apply its side effect twice.
    pub fn may_have_executed(&self) -> bool {
        matches!(
            self,
            ChannelError::Timeout { sent: true, .. } | ChannelError::ConnectionLost(_)
        )
    }
}

type Reply = Result<Response, ChannelError>;

/// A command waiting for its reply.
pub(crate) struct PendingRequest {
    command: Command,
    submitted: Instant,
    reply: oneshot::Sender<Reply>,
    status: Arc<AtomicU8>,
}

// Write status of a request. Leaves UNSENT exactly once: the writer claims
// it as SENT, or a caller whose deadline passed first claims it as ABANDONED.
const UNSENT: u8 = 0;
const SENT: u8 = 1;
const ABANDONED: u8 = 2;

fn claim(status: &AtomicU8, to: u8) -> bool {
    status
        .compare_exchange(UNSENT, to, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// The caller's side of a submitted request.
#[derive(Debug)]
pub(crate) struct ReplyHandle {
    reply: oneshot::Receiver<Reply>,
    status: Arc<AtomicU8>,
}

type InFlight = Arc<Mutex<VecDeque<PendingRequest>>>;

/// The tasks and queue bound to one live connection.
struct Session {
    id: u64,
    jobs: mpsc::UnboundedSender<PendingRequest>,
    in_flight: InFlight,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    fn stop(&self) {
        self.reader.abort();
        self.writer.abort();
    }

    fn drain(&self) -> Vec<PendingRequest> {
        lock(&self.in_flight).drain(..).collect()
    }
}

struct Shared {
    config: ChannelConfig,
    manager: ConnectionManager,
    state: StateCell,
    stats: Arc<ChannelStats>,
    session: Mutex<Option<Session>>,
    next_session: AtomicU64,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn new(config: ChannelConfig) -> Self {
        let manager = ConnectionManager::new(config.endpoint.clone(), config.connect_timeout);
        Self {
            config,
            manager,
            state: StateCell::new(ChannelState::Disconnected),
            stats: Arc::new(ChannelStats::new()),
            session: Mutex::new(None),
            next_session: AtomicU64::new(1),
            reconnect_task: Mutex::new(None),
        }
    }

    /// Starts reader and writer tasks on a fresh connection and goes `Ready`.
    ///
    /// Runs entirely under the session lock, so a task that fails straight
    /// away blocks in `connection_lost` until the session is stored and the
    /// state is `Ready`, then tears it down as usual.
    fn install(self: &Arc<Self>, reader: StreamReader, writer: StreamWriter) {
        let mut slot = lock(&self.session);
        if self.state.get() == ChannelState::Closing {
            // Closed while we were connecting
            return;
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let in_flight: InFlight = Arc::new(Mutex::new(VecDeque::new()));
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            id,
            LineReader::new(reader, self.config.max_line),
            Arc::clone(&in_flight),
            Arc::clone(&self.stats),
            Arc::downgrade(self),
        ));
        let writer = tokio::spawn(write_loop(
            id,
            LineWriter::new(writer, self.config.write_timeout),
            jobs_rx,
            Arc::clone(&in_flight),
            Arc::clone(&self.stats),
            Arc::downgrade(self),
        ));

        let session = Session {
            id,
            jobs: jobs_tx,
            in_flight,
            reader,
            writer,
        };

        if let Some(old) = slot.replace(session) {
            old.stop();
            for pending in old.drain() {
                let _ = pending
                    .reply
                    .send(Err(ChannelError::ConnectionLost("connection replaced".into())));
            }
        }

        debug!(session = id, "Session started");
        self.state.set(ChannelState::Ready);
    }

    /// Tears down session `id` after an I/O failure on either half.
    fn connection_lost(self: &Arc<Self>, id: u64, reason: String) {
        let session = {
            let mut slot = lock(&self.session);
            match slot.as_ref() {
                Some(current) if current.id == id => slot.take(),
                _ => None,
            }
        };

        // Already torn down by the other half, by close(), or superseded
        let Some(session) = session else {
            return;
        };

        session.stop();
        let pending = session.drain();

        warn!(
            endpoint = %self.config.endpoint,
            session = id,
            pending = pending.len(),
            reason = %reason,
            "Connection lost"
        );
        self.stats.connection_lost();

        for request in pending {
            trace!(command = %request.command, "Failing outstanding request");
            let _ = request
                .reply
                .send(Err(ChannelError::ConnectionLost(reason.clone())));
        }

        if self.state.set(ChannelState::Disconnected) && self.config.reconnect.enabled {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let task = tokio::spawn(reconnect_loop(Arc::downgrade(self)));
        if let Some(previous) = lock(&self.reconnect_task).replace(task) {
            previous.abort();
        }
    }

    fn stop_reconnect(&self) {
        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
    }

    fn shutdown(&self) {
        if !self.state.set(ChannelState::Closing) {
            return;
        }
        self.stop_reconnect();

        let session = lock(&self.session).take();
        if let Some(session) = session {
            session.stop();
            let pending = session.drain();
            debug!(pending = pending.len(), "Closing channel");
            for request in pending {
                let _ = request.reply.send(Err(ChannelError::ChannelClosed));
            }
        }
        info!(endpoint = %self.config.endpoint, "Channel closed");
    }

    /// Waits until the channel is `Ready`, following the ready policy.
    async fn wait_ready(&self, deadline: Instant, timeout: Duration) -> Result<(), ChannelError> {
        let mut rx = self.state.watch();

        let current = *rx.borrow_and_update();
        match current {
            ChannelState::Ready => return Ok(()),
            ChannelState::Closing => return Err(ChannelError::ChannelClosed),
            _ => {}
        }

        if self.config.ready_policy == ReadyPolicy::FailFast {
            return Err(ChannelError::ChannelClosed);
        }

        let waited = tokio::time::timeout_at(
            deadline,
            rx.wait_for(|s| matches!(s, ChannelState::Ready | ChannelState::Closing)),
        )
        .await;

        match waited {
            Ok(Ok(state)) if *state == ChannelState::Ready => Ok(()),
            Ok(_) => Err(ChannelError::ChannelClosed),
            Err(_) => Err(ChannelError::Timeout {
                after: timeout,
                sent: false,
            }),
        }
    }

    /// Queues `command` for the writer and returns the completion handle.
    async fn submit(
        &self,
        command: Command,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<ReplyHandle, ChannelError> {
        let (tx, rx) = oneshot::channel();
        let status = Arc::new(AtomicU8::new(UNSENT));
        let mut request = PendingRequest {
            command,
            submitted: Instant::now(),
            reply: tx,
            status: Arc::clone(&status),
        };

        loop {
            self.wait_ready(deadline, timeout).await?;

            // Marked seen before looking at the slot, so a teardown that
            // empties the slot is guaranteed to wake `changed()` below
            let mut changes = self.state.watch();
            let seen = *changes.borrow_and_update();

            {
                let slot = lock(&self.session);
                if let Some(session) = slot.as_ref() {
                    request.submitted = Instant::now();
                    match session.jobs.send(request) {
                        Ok(()) => return Ok(ReplyHandle { reply: rx, status }),
                        // Writer already gone; wait for the teardown
                        Err(mpsc::error::SendError(returned)) => request = returned,
                    }
                }
            }

            if seen != ChannelState::Ready {
                continue;
            }

            // State still says Ready while a teardown is in progress
            if self.config.ready_policy == ReadyPolicy::FailFast {
                return Err(ChannelError::ChannelClosed);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(ChannelError::ChannelClosed),
                Err(_) => {
                    return Err(ChannelError::Timeout {
                        after: timeout,
                        sent: false,
                    })
                }
            }
        }
    }

    /// Error for a request whose completion handle vanished unanswered.
    fn dropped_request_error(&self) -> ChannelError {
        if self.state.get() == ChannelState::Closing {
            ChannelError::ChannelClosed
        } else {
            ChannelError::ConnectionLost("request dropped with its connection".into())
        }
    }
}

async fn read_loop(
    id: u64,
    mut reader: LineReader,
    in_flight: InFlight,
    stats: Arc<ChannelStats>,
    shared: Weak<Shared>,
) {
    let reason = loop {
        let line = match reader.read_line(None).await {
            Ok(line) => line,
            Err(e) => break e.to_string(),
        };

        let request = lock(&in_flight).pop_front();
        let Some(request) = request else {
            stats.unsolicited_line();
            warn!(session = id, line = %line, "Discarding unsolicited line");
            continue;
        };

        let latency = request.submitted.elapsed();
        trace!(command = %request.command, response = %line, ?latency, "Matched response");
        match request.reply.send(Ok(Response::new(line))) {
            Ok(()) => stats.response_matched(latency),
            Err(_) => {
                stats.stale_reply();
                debug!(command = %request.command, "Discarding reply for abandoned request");
            }
        }
    };

    if let Some(shared) = shared.upgrade() {
        shared.connection_lost(id, reason);
    }
}

async fn write_loop(
    id: u64,
    mut writer: LineWriter,
    mut jobs: mpsc::UnboundedReceiver<PendingRequest>,
    in_flight: InFlight,
    stats: Arc<ChannelStats>,
    shared: Weak<Shared>,
) {
    let reason = loop {
        let Some(request) = jobs.recv().await else {
            writer.close().await;
            return;
        };

        if request.reply.is_closed() || !claim(&request.status, SENT) {
            stats.cancelled_unsent();
            debug!(command = %request.command, "Skipping command abandoned before it was sent");
            continue;
        }

        let command = request.command.clone();
        lock(&in_flight).push_back(request);

        match writer.write_line(command.as_str()).await {
            Ok(()) => {
                stats.command_sent();
                trace!(session = id, command = %command, "Sent command");
            }
            Err(e) => break e.to_string(),
        }
    };

    if let Some(shared) = shared.upgrade() {
        shared.connection_lost(id, reason);
    }
}

async fn reconnect_loop(shared: Weak<Shared>) {
    let mut attempt: u32 = 0;

    loop {
        let Some(s) = shared.upgrade() else {
            return;
        };
        if s.state.get() == ChannelState::Closing {
            return;
        }

        attempt += 1;
        s.state.set(ChannelState::Connecting);

        match s.manager.connect().await {
            Ok((reader, writer)) => {
                s.stats.reconnected();
                info!(endpoint = %s.config.endpoint, attempt, "Reconnected");
                s.install(reader, writer);
                return;
            }
            Err(e) => {
                let policy = &s.config.reconnect;
                if policy.exhausted(attempt) {
                    warn!(
                        endpoint = %s.config.endpoint,
                        attempts = attempt,
                        error = %e,
                        "Giving up on reconnecting"
                    );
                    s.state.set(ChannelState::Disconnected);
                    return;
                }

                let delay = policy.backoff(attempt);
                debug!(attempt, ?delay, error = %e, "Reconnect failed, backing off");
                drop(s);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// A line-oriented command channel to one instrument.
///
/// The channel is internally synchronized; share it between tasks with an
/// `Arc`. Dropping it closes the connection.
///
/// # Example
///
/// ```ignore
/// use linkwire::{ChannelConfig, CommandChannel, Endpoint};
/// use std::time::Duration;
///
/// let config = ChannelConfig::new(Endpoint::unix("/var/tmp/reg-socket"));
/// let channel = CommandChannel::connect(config).await?;
///
/// let reply = channel.call("getDebug", Duration::from_secs(1)).await?;
/// println!("{}", reply);
/// ```
pub struct CommandChannel {
    shared: Arc<Shared>,
}

impl CommandChannel {
    /// Connects to the configured endpoint. Fails if the first connect fails.
    pub async fn connect(config: ChannelConfig) -> Result<Self, ConnectionError> {
        let shared = Arc::new(Shared::new(config));
        let (reader, writer) = shared.manager.connect().await?;
        shared.install(reader, writer);
        Ok(Self { shared })
    }

    /// Creates a channel that connects in the background.
    ///
    /// The channel starts `Disconnected` and immediately runs the reconnect
    /// loop, whatever `reconnect.enabled` says for later losses. Calls wait
    /// for `Ready` or fail according to the ready policy. Must be called
    /// from within a Tokio runtime.
    pub fn open(config: ChannelConfig) -> Self {
        let shared = Arc::new(Shared::new(config));
        shared.spawn_reconnect();
        Self { shared }
    }

    /// Sends one command and waits up to `timeout` for its reply.
    ///
    /// The timeout covers waiting for the channel to become ready as well as
    /// waiting for the reply.
    pub async fn call(&self, command: &str, timeout: Duration) -> Result<Response, ChannelError> {
        let command = Command::new(command)?;
        self.call_command(command, timeout).await
    }

    /// [`call`](Self::call) with the configured default timeout.
    pub async fn send(&self, command: &str) -> Result<Response, ChannelError> {
        self.call(command, self.shared.config.call_timeout).await
    }

    /// Like [`call`](Self::call) for an already validated command.
    pub async fn call_command(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Response, ChannelError> {
        let deadline = Instant::now() + timeout;
        let handle = self.shared.submit(command, deadline, timeout).await?;
        self.await_reply(handle, deadline, timeout).await
    }

    /// Pipelines `commands`, keeping at most `concurrency` outstanding.
    ///
    /// The returned [`Batch`] is lazy: commands go out as it is driven with
    /// [`Batch::next`] or [`Batch::collect`]. Results come back in submission
    /// order. `concurrency` is clamped to `1..=max_concurrency`; use 1 when
    /// the instrument's reply ordering cannot be trusted.
    pub fn call_batch<I>(&self, commands: I, concurrency: usize) -> Batch<'_>
    where
        I: IntoIterator<Item = Command>,
    {
        Batch::new(
            self,
            commands.into_iter().collect(),
            self.shared.config.clamp_concurrency(concurrency),
            self.shared.config.call_timeout,
        )
    }

    pub(crate) async fn submit(
        &self,
        command: Command,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<ReplyHandle, ChannelError> {
        self.shared.submit(command, deadline, timeout).await
    }

    pub(crate) async fn await_reply(
        &self,
        mut handle: ReplyHandle,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Response, ChannelError> {
        match tokio::time::timeout_at(deadline, &mut handle.reply).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(self.shared.dropped_request_error()),
            Err(_) => {
                // Claiming it first keeps the writer from sending it late
                let sent = !claim(&handle.status, ABANDONED);
                self.shared.stats.timeout();
                debug!(?timeout, sent, "Call timed out");
                Err(ChannelError::Timeout {
                    after: timeout,
                    sent,
                })
            }
        }
    }

    /// Runs a single connect attempt now, outside the automatic policy.
    ///
    /// Useful once automatic reconnection has given up. Returns the state
    /// the channel ends up in; a `Ready` or `Closing` channel is left alone.
    pub async fn reconnect(&self) -> Result<ChannelState, ConnectionError> {
        match self.state() {
            state @ (ChannelState::Ready | ChannelState::Closing) => return Ok(state),
            _ => {}
        }

        self.shared.stop_reconnect();
        self.shared.state.set(ChannelState::Connecting);

        match self.shared.manager.connect().await {
            Ok((reader, writer)) => {
                self.shared.stats.reconnected();
                self.shared.install(reader, writer);
                Ok(self.state())
            }
            Err(e) => {
                self.shared.state.set(ChannelState::Disconnected);
                Err(e)
            }
        }
    }

    /// Closes the channel. Outstanding calls fail with `ChannelClosed`.
    /// Calling it again is a no-op.
    pub fn close(&self) {
        self.shared.shutdown();
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state.get()
    }

    /// Receives every state transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.shared.state.subscribe()
    }

    /// Follows the current state.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.watch()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared
            .stats
            .snapshot(self.shared.manager.stats())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.config.endpoint
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::config::ReconnectPolicy;
    use crate::testing::{commands, FakeInstrument, PeerReply};
    use tokio::net::TcpListener;

    fn config_for(peer: &FakeInstrument) -> ChannelConfig {
        ChannelConfig::new(peer.endpoint().clone())
            .with_connect_timeout(Duration::from_secs(1))
            .with_call_timeout(Duration::from_secs(2))
            .with_reconnect(ReconnectPolicy {
                enabled: true,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
                max_attempts: Some(20),
            })
    }

    async fn next_transition(
        events: &mut broadcast::Receiver<StateTransition>,
    ) -> StateTransition {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no state transition within 2s")
            .expect("transition feed closed")
    }

    #[tokio::test]
    async fn test_call_echo_over_tcp() {
        let peer = FakeInstrument::tcp(FakeInstrument::echo_ok()).await;
        let channel = CommandChannel::connect(config_for(&peer)).await.unwrap();
        assert_eq!(channel.state(), ChannelState::Ready);

        let reply = channel.call("getDebug", Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, "OK:getDebug");

        let reply = channel.send("setDebug 1").await.unwrap();
        assert_eq!(reply, "OK:setDebug 1");

        assert_eq!(peer.received(), vec!["getDebug", "setDebug 1"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_scenario() {
        let peer = FakeInstrument::unix(FakeInstrument::echo_ok()).await;
        assert!(peer.endpoint().is_unix());
        let channel = CommandChannel::connect(config_for(&peer)).await.unwrap();

        let reply = channel.call("getDebug", Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, "OK:getDebug");

        let report = channel.call_batch(commands(&["a", "b", "c"]), 3).collect().await;
        let pairs: Vec<(String, String)> = report
            .results
            .into_iter()
            .map(|(cmd, res)| (cmd.into_string(), res.unwrap().into_string()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "OK:a".to_string()),
                ("b".to_string(), "OK:b".to_string()),
                ("c".to_string(), "OK:c".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_commands_each_get_a_reply() {
        let peer = FakeInstrument::tcp(FakeInstrument::echo_ok()).await;
        let channel = CommandChannel::connect(config_for(&peer)).await.unwrap();

        let report = channel
            .call_batch(commands(&["getDebug"; 20]), 8)
            .collect()
            .await;
        assert_eq!(report.results.len(), 20);
        assert!(report
            .results
            .iter()
            .all(|(_, r)| r.as_ref().unwrap() == "OK:getDebug"));
    }

    #[tokio::test]
    async fn test_invalid_command_writes_nothing() {
        let peer = FakeInstrument::tcp(FakeInstrument::echo_ok()).await;
        let channel = CommandChannel::connect(config_for(&peer)).await.unwrap();

        let err = channel
            .call("getDebug\nsetDebug 1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ChannelError::CommandInvalid(CommandError::EmbeddedTerminator(8))
        );
        assert!(!err.may_have_executed());

        let err = channel.call("", Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, ChannelError::CommandInvalid(CommandError::Empty));

        // The channel is untouched and the peer saw nothing but this
        assert_eq!(channel.send("getDebug").await.unwrap(), "OK:getDebug");
        assert_eq!(peer.received(), vec!["getDebug"]);
        assert_eq!(channel.stats().commands_sent, 1);
    }

    #[tokio::test]
    async fn test_timeout_against_silent_peer() {
        let peer = FakeInstrument::tcp(|_, _: &str| PeerReply::Silent).await;
        let channel = CommandChannel::connect(config_for(&peer)).await.unwrap();

        let started = Instant::now();
        let err = channel
            .call("getVoltage", Duration::from_millis(100))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, ChannelError::Timeout { sent: true, .. }), "got {err:?}");
        assert!(err.may_have_executed());
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed <= Duration::from_millis(150), "took {elapsed:?}");
        assert_eq!(channel.state(), ChannelState::Ready);
        assert_eq!(channel.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_late_reply_is_not_misattributed() {
        let peer = FakeInstrument::tcp(|_, cmd: &str| {
            if cmd == "slow" {
                PeerReply::After(Duration::from_millis(200), "OK:slow".to_string())
            } else {
                PeerReply::Line(format!("OK:{cmd}"))
            }
        })
        .await;
        let channel = CommandChannel::connect(config_for(&peer)).await.unwrap();

        let err = channel.call("slow", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { .. }));
        assert_eq!(channel.state(), ChannelState::Ready);

        // The late "OK:slow" belongs to the abandoned call and is dropped
        let reply = channel.call("getDebug", Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, "OK:getDebug");
        assert_eq!(channel.stats().stale_replies, 1);
    }

    #[tokio::test]
    async fn test_cancelled_call_does_not_desync() {
        let peer = FakeInstrument::tcp(|_, cmd: &str| {
            PeerReply::After(Duration::from_millis(50), format!("OK:{cmd}"))
        })
        .await;
        let channel = CommandChannel::connect(config_for(&peer)).await.unwrap();

        let abandoned = channel.call("first", Duration::from_secs(1));
        let _ = tokio::time::timeout(Duration::from_millis(10), abandoned).await;

        let reply = channel.call("second", Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, "OK:second");
    }

    #[tokio::test]
    async fn test_connection_lost_fails_pending_and_reconnects() {
        let peer = FakeInstrument::tcp(|conn, cmd: &str| {
            if conn == 0 && cmd == "cmdConnect" {
                PeerReply::Hangup
            } else {
                PeerReply::Line(format!("OK:{cmd}"))
            }
        })
        .await;
        let channel = CommandChannel::connect(config_for(&peer)).await.unwrap();
        let mut events = channel.subscribe();

        let err = channel
            .call("cmdConnect", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::ConnectionLost(_)), "got {err:?}");
        assert!(err.may_have_executed());

        assert_eq!(next_transition(&mut events).await.to, ChannelState::Disconnected);
        assert_eq!(next_transition(&mut events).await.to, ChannelState::Connecting);
        assert_eq!(next_transition(&mut events).await.to, ChannelState::Ready);

        let reply = channel.call("getDebug", Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, "OK:getDebug");

        let stats = channel.stats();
        assert_eq!(stats.connection_losses, 1);
        assert_eq!(stats.reconnects, 1);
        assert_eq!(peer.connections(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_after_idle_peer_close() {
        let peer = FakeInstrument::tcp(FakeInstrument::echo_ok()).await;
        let channel = CommandChannel::connect(config_for(&peer)).await.unwrap();
        let mut events = channel.subscribe();

        peer.drop_connections();

        let seen: Vec<ChannelState> = vec![
            next_transition(&mut events).await.to,
            next_transition(&mut events).await.to,
            next_transition(&mut events).await.to,
        ];
        assert_eq!(
            seen,
            vec![
                ChannelState::Disconnected,
                ChannelState::Connecting,
                ChannelState::Ready
            ]
        );

        let reply = channel.call("getDebug", Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, "OK:getDebug");
    }

    #[tokio::test]
    async fn test_oversize_reply_drops_connection_then_recovers() {
        let peer = FakeInstrument::tcp(|conn, cmd: &str| {
            if conn == 0 {
                PeerReply::Raw(vec![b'x'; 200])
            } else {
                PeerReply::Line(format!("OK:{cmd}"))
            }
        })
        .await;
        let channel = CommandChannel::connect(config_for(&peer).with_max_line(64))
            .await
            .unwrap();

        let err = channel.call("getDebug", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ChannelError::ConnectionLost(ref r) if r.contains("too large")));

        let mut state = channel.watch_state();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ChannelState::Ready),
        )
        .await
        .unwrap()
        .unwrap();

        let reply = channel.call("getDebug", Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, "OK:getDebug");
    }

    #[tokio::test]
    async fn test_no_reconnect_when_disabled() {
        let peer = FakeInstrument::tcp(FakeInstrument::echo_ok()).await;
        let config = config_for(&peer)
            .with_reconnect(ReconnectPolicy::disabled())
            .with_ready_policy(ReadyPolicy::FailFast);
        let channel = CommandChannel::connect(config).await.unwrap();
        let mut state = channel.watch_state();

        peer.drop_connections();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ChannelState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        let err = channel.send("getDebug").await.unwrap_err();
        assert_eq!(err, ChannelError::ChannelClosed);

        // Manual retry brings it back
        assert_eq!(channel.reconnect().await.unwrap(), ChannelState::Ready);
        assert_eq!(channel.send("getDebug").await.unwrap(), "OK:getDebug");
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let peer = FakeInstrument::tcp(FakeInstrument::echo_ok()).await;
        let config = config_for(&peer).with_reconnect(ReconnectPolicy {
            enabled: true,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
            max_attempts: Some(3),
        });
        let channel = CommandChannel::connect(config).await.unwrap();
        let mut events = channel.subscribe();

        peer.shutdown().await;

        assert_eq!(next_transition(&mut events).await.to, ChannelState::Disconnected);
        assert_eq!(next_transition(&mut events).await.to, ChannelState::Connecting);
        assert_eq!(next_transition(&mut events).await.to, ChannelState::Disconnected);

        let stats = channel.stats();
        assert_eq!(stats.connect_failures, 3);
        assert_eq!(stats.reconnects, 0);
    }

    #[tokio::test]
    async fn test_wait_policy_blocks_until_ready() {
        let peer = FakeInstrument::tcp(FakeInstrument::echo_ok()).await;
        let channel = CommandChannel::open(config_for(&peer));

        // Submitted before the background connect has finished
        let reply = channel.call("getDebug", Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply, "OK:getDebug");
        assert_eq!(channel.state(), ChannelState::Ready);
    }

    #[tokio::test]
    async fn test_wait_policy_times_out_unsent() {
        // Nothing listens on a port we just released
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ChannelConfig::new(Endpoint::tcp("127.0.0.1", port));
        let channel = CommandChannel::open(config);

        let err = channel
            .call("getDebug", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { sent: false, .. }), "got {err:?}");
        assert!(!err.may_have_executed());
        assert_eq!(channel.stats().commands_sent, 0);
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_calls() {
        let peer = FakeInstrument::tcp(|_, _: &str| PeerReply::Silent).await;
        let channel = Arc::new(CommandChannel::connect(config_for(&peer)).await.unwrap());

        let pending = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.call("getVoltage", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        channel.close();
        channel.close();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err, ChannelError::ChannelClosed);
        assert_eq!(channel.state(), ChannelState::Closing);
        assert_eq!(
            channel.send("getDebug").await.unwrap_err(),
            ChannelError::ChannelClosed
        );
    }

    #[tokio::test]
    async fn test_concurrent_callers_each_get_their_own_reply() {
        let peer = FakeInstrument::tcp(FakeInstrument::echo_ok()).await;
        let channel = Arc::new(CommandChannel::connect(config_for(&peer)).await.unwrap());

        let mut tasks = Vec::new();
        for i in 0..16 {
            let channel = Arc::clone(&channel);
            tasks.push(tokio::spawn(async move {
                let cmd = format!("setCurrent {i}");
                let reply = channel.call(&cmd, Duration::from_secs(2)).await.unwrap();
                (cmd, reply)
            }));
        }

        for task in tasks {
            let (cmd, reply) = task.await.unwrap();
            assert_eq!(reply.as_str(), format!("OK:{cmd}"));
        }
        assert!(channel.stats().mean_latency.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_peer_closing_on_accept_always_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let config = ChannelConfig::new(Endpoint::tcp("127.0.0.1", port))
            .with_reconnect(ReconnectPolicy::disabled());

        for _ in 0..200 {
            // The peer may already be gone by the time the socket is set up
            let Ok(channel) = CommandChannel::connect(config.clone()).await else {
                continue;
            };

            let mut state = channel.watch_state();
            tokio::time::timeout(
                Duration::from_secs(2),
                state.wait_for(|s| *s == ChannelState::Disconnected),
            )
            .await
            .expect("channel stayed ready after the peer closed")
            .unwrap();

            let err = channel.call("x", Duration::from_millis(50)).await.unwrap_err();
            assert_eq!(
                err,
                ChannelError::Timeout {
                    after: Duration::from_millis(50),
                    sent: false
                }
            );
        }

        acceptor.abort();
    }

    #[tokio::test]
    async fn test_submit_during_teardown_respects_deadline() {
        let timeout = Duration::from_millis(50);
        let config = ChannelConfig::new(Endpoint::tcp("127.0.0.1", 9));

        // Ready with no session is the window while a lost connection is torn down
        let shared = Shared::new(config.clone());
        shared.state.set(ChannelState::Ready);

        let started = Instant::now();
        let err = shared
            .submit(Command::new("getDebug").unwrap(), started + timeout, timeout)
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Timeout { after: timeout, sent: false });
        assert!(started.elapsed() < Duration::from_millis(500));

        let shared = Shared::new(config.with_ready_policy(ReadyPolicy::FailFast));
        shared.state.set(ChannelState::Ready);
        let err = shared
            .submit(Command::new("getDebug").unwrap(), Instant::now() + timeout, timeout)
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::ChannelClosed);
    }

    #[tokio::test]
    async fn test_timeout_behind_stalled_write_reports_unsent() {
        // A peer that accepts and never reads, so a large write stalls
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let holder = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let config = ChannelConfig::new(Endpoint::tcp("127.0.0.1", port))
            .with_write_timeout(Duration::from_secs(10))
            .with_reconnect(ReconnectPolicy::disabled());
        let channel = Arc::new(CommandChannel::connect(config).await.unwrap());

        let stalled = {
            let channel = Arc::clone(&channel);
            let huge = "x".repeat(64 * 1024 * 1024);
            tokio::spawn(async move { channel.call(&huge, Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = channel
            .call("getDebug", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ChannelError::Timeout {
                after: Duration::from_millis(100),
                sent: false
            }
        );
        assert!(!err.may_have_executed());
        assert_eq!(channel.stats().commands_sent, 0);

        stalled.abort();
        holder.abort();
    }

    #[test]
    fn test_may_have_executed() {
        assert!(!ChannelError::ChannelClosed.may_have_executed());
        assert!(!ChannelError::Timeout {
            after: Duration::from_millis(1),
            sent: false
        }
        .may_have_executed());
        assert!(ChannelError::ConnectionLost("reset".into()).may_have_executed());
    }
}
