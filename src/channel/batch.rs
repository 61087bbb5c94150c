//! Pipelined Batches
//!
//! A [`Batch`] keeps up to `concurrency` commands outstanding on one channel
//! and hands results back in submission order:
//!
//! ```text
//! queued:     [c5 c6 c7 ...]
//!                 │ top up while in_flight < concurrency
//!                 ▼
//! in_flight:  [c1 c2 c3 c4]  ──next()──> (c1, reply1)
//! ```
//!
//! Each item gets the channel's call timeout, counted from the moment it is
//! submitted. One failed item does not stop the batch.

use crate::channel::client::{ChannelError, CommandChannel, ReplyHandle};
use crate::protocol::{Command, Response};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

type Pending = Result<(ReplyHandle, Instant), ChannelError>;

struct Slot {
    command: Command,
    pending: Pending,
}

/// A lazily driven pipeline of commands.
///
/// Nothing is sent until [`next`](Batch::next) or [`collect`](Batch::collect)
/// is awaited. Dropping the batch abandons whatever has not completed;
/// replies to commands already sent are discarded by the channel.
pub struct Batch<'a> {
    channel: &'a CommandChannel,
    queued: VecDeque<Command>,
    in_flight: VecDeque<Slot>,
    concurrency: usize,
    timeout: Duration,
    started: Option<Instant>,
    completed: usize,
    failed: usize,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(
        channel: &'a CommandChannel,
        commands: VecDeque<Command>,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            channel,
            queued: commands,
            in_flight: VecDeque::with_capacity(concurrency),
            concurrency,
            timeout,
            started: None,
            completed: 0,
            failed: 0,
        }
    }

    /// Overrides the per-item timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Commands not yet completed, in flight or queued.
    pub fn remaining(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Time since the first command was submitted.
    pub fn elapsed(&self) -> Duration {
        self.started.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Completed commands per second so far.
    pub fn throughput(&self) -> f64 {
        rate(self.completed, self.elapsed())
    }

    /// The next result in submission order, or `None` when the batch is done.
    pub async fn next(&mut self) -> Option<(Command, Result<Response, ChannelError>)> {
        self.top_up().await;

        let slot = self.in_flight.pop_front()?;
        let result = match slot.pending {
            Ok((handle, deadline)) => {
                self.channel
                    .await_reply(handle, deadline, self.timeout)
                    .await
            }
            Err(e) => Err(e),
        };

        self.completed += 1;
        if result.is_err() {
            self.failed += 1;
        }
        Some((slot.command, result))
    }

    /// Drives the batch to completion.
    pub async fn collect(mut self) -> BatchReport {
        let mut results = Vec::with_capacity(self.remaining());
        while let Some(item) = self.next().await {
            results.push(item);
        }
        BatchReport {
            results,
            elapsed: self.elapsed(),
        }
    }

    async fn top_up(&mut self) {
        while self.in_flight.len() < self.concurrency {
            let Some(command) = self.queued.pop_front() else {
                break;
            };
            self.started.get_or_insert_with(Instant::now);

            let deadline = Instant::now() + self.timeout;
            let pending = self
                .channel
                .submit(command.clone(), deadline, self.timeout)
                .await
                .map(|handle| (handle, deadline));
            self.in_flight.push_back(Slot { command, pending });
        }
    }
}

/// Outcome of a completed batch.
#[derive(Debug)]
pub struct BatchReport {
    /// Every command with its result, in submission order
    pub results: Vec<(Command, Result<Response, ChannelError>)>,
    /// Wall time from first submission to last result
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn failures(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_err()).count()
    }

    /// Commands per second over the whole batch.
    pub fn throughput(&self) -> f64 {
        rate(self.results.len(), self.elapsed)
    }
}

fn rate(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        0.0
    } else {
        count as f64 / secs
    }
}
