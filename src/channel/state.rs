//! Channel State Machine
//!
//! ```text
//!   Disconnected ──connect ok──> Ready ──io error──> Disconnected
//!        │                         ▲
//!        │ auto_reconnect          │ success
//!        ▼                         │
//!    Connecting ───────────────────┘
//!        │  ▲
//!        │  └── failure, retries remain (after backoff)
//!        └───── retries exhausted ──> Disconnected
//!
//!   any state ──close()──> Closing (terminal)
//! ```
//!
//! The current state is published on a `watch` channel so callers can wait
//! for `Ready`; every change is also broadcast as a [`StateTransition`] so
//! observers see intermediate states they would miss by polling.

use std::fmt;
use tokio::sync::{broadcast, watch};
use tracing::info;

/// Capacity of the transition broadcast
const TRANSITION_BACKLOG: usize = 64;

/// Lifecycle state of a command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Ready => "ready",
            ChannelState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// One observed state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ChannelState,
    pub to: ChannelState,
}

/// Holds the current state and publishes changes.
#[derive(Debug)]
pub(crate) struct StateCell {
    current: watch::Sender<ChannelState>,
    transitions: broadcast::Sender<StateTransition>,
}

impl StateCell {
    pub(crate) fn new(initial: ChannelState) -> Self {
        let (current, _) = watch::channel(initial);
        let (transitions, _) = broadcast::channel(TRANSITION_BACKLOG);
        Self {
            current,
            transitions,
        }
    }

    pub(crate) fn get(&self) -> ChannelState {
        *self.current.borrow()
    }

    /// Moves to `to`. Returns false when already there, or when the channel
    /// is `Closing`, which nothing leaves.
    pub(crate) fn set(&self, to: ChannelState) -> bool {
        self.current.send_if_modified(|state| {
            let from = *state;
            if from == to || from == ChannelState::Closing {
                return false;
            }
            *state = to;
            // Published under the watch lock so observers see changes in order
            let _ = self.transitions.send(StateTransition { from, to });
            info!(%from, %to, "Channel state changed");
            true
        })
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ChannelState> {
        self.current.subscribe()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }
}
