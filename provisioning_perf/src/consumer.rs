//! The consumption loop
//!
//! A [`Consumer`] pulls messages from one subscription strictly one at a time: long-poll for the
//! next message, acknowledge it, repeat. Along the way it tells apart three outcomes that look
//! alike from the outside:
//!
//! - an empty long-poll, which is normal and feeds the [`IdleTracker`],
//! - a failed call, which is counted and, with `fail_fast`, ends the run,
//! - a sustained run of empty long-polls, which ends the run with [`IdleTimeoutExceeded`].
use std::{fmt, future::Future, time::Duration};

use observability_deps::tracing::{Instrument, Span, debug, error, info, info_span};
use provisioning_client::ProvisioningMessage;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    idle::{IdleTimeoutExceeded, IdleTracker},
    latency::{Insights, LatencyRecorder, Operation},
    queue::MessageQueue,
};

/// A failed fetch or acknowledge call
#[derive(Debug, thiserror::Error)]
pub enum PullError {
    #[error(transparent)]
    Client(#[from] provisioning_client::Error),

    #[error("operation cancelled")]
    Cancelled,
}

/// Parameters for a single pull run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullConfig {
    /// Number of messages to receive before the run is complete
    pub target: usize,
    /// Long-poll window for each fetch
    pub poll_interval: Duration,
    /// How long the queue may stay empty before the run gives up
    pub idle_timeout: Duration,
    /// Abort on the first failed fetch or acknowledge
    pub fail_fast: bool,
    /// Remove messages while fetching instead of acknowledging them afterwards
    pub pop: bool,
}

impl PullConfig {
    pub fn new(target: usize, poll_interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            target,
            poll_interval,
            idle_timeout,
            fail_fast: false,
            pop: false,
        }
    }

    pub fn with_fail_fast(self, fail_fast: bool) -> Self {
        Self { fail_fast, ..self }
    }

    pub fn with_pop(self, pop: bool) -> Self {
        Self { pop, ..self }
    }
}

/// Why a pull run ended
#[derive(Debug)]
pub enum StopReason {
    TargetReached,
    IdleTimeout(IdleTimeoutExceeded),
    FetchFailed(PullError),
    AcknowledgeFailed(PullError),
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TargetReached => write!(f, "target reached"),
            Self::IdleTimeout(e) => write!(f, "{e}"),
            Self::FetchFailed(e) => write!(f, "fetch message failed: {e}"),
            Self::AcknowledgeFailed(e) => write!(f, "ack message failed: {e}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Everything collected by one pull run
#[derive(Debug)]
pub struct PullStats {
    expected: usize,
    latencies: LatencyRecorder,
    stop_reason: StopReason,
}

impl PullStats {
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Messages received, including redeliveries
    pub fn fetched(&self) -> usize {
        self.latencies.count(Operation::Fetch)
    }

    pub fn acknowledged(&self) -> usize {
        self.latencies.count(Operation::Acknowledge)
    }

    pub fn fetch_errors(&self) -> usize {
        self.latencies.errors(Operation::Fetch)
    }

    pub fn ack_errors(&self) -> usize {
        self.latencies.errors(Operation::Acknowledge)
    }

    pub fn latencies(&self) -> &LatencyRecorder {
        &self.latencies
    }

    pub fn stop_reason(&self) -> &StopReason {
        &self.stop_reason
    }

    pub fn into_stop_reason(self) -> StopReason {
        self.stop_reason
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            expected: self.expected,
            fetched: self.fetched(),
            acknowledged: self.acknowledged(),
            fetch: self.latencies.summarize(Operation::Fetch),
            acknowledge: self.latencies.summarize(Operation::Acknowledge),
            fetch_errors: self.fetch_errors(),
            ack_errors: self.ack_errors(),
        }
    }
}

/// The run did not receive every expected message without errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error(
    "run incomplete: received {received}/{expected} messages, \
    errors: fetch={fetch_errors} ack={ack_errors}"
)]
pub struct RunIncomplete {
    pub received: usize,
    pub expected: usize,
    pub fetch_errors: usize,
    pub ack_errors: usize,
}

/// Numeric result of a pull run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub expected: usize,
    pub fetched: usize,
    pub acknowledged: usize,
    pub fetch: Insights,
    pub acknowledge: Insights,
    pub fetch_errors: usize,
    pub ack_errors: usize,
}

impl RunSummary {
    /// Pass only if every expected message arrived and no call failed
    pub fn evaluate(&self) -> Result<(), RunIncomplete> {
        if self.fetch_errors > 0 || self.ack_errors > 0 || self.fetched != self.expected {
            return Err(RunIncomplete {
                received: self.fetched,
                expected: self.expected,
                fetch_errors: self.fetch_errors,
                ack_errors: self.ack_errors,
            });
        }
        Ok(())
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Performance Results ===")?;
        writeln!(f, "Fetch: {}", self.fetch)?;
        writeln!(f, "Ack: {}", self.acknowledge)?;
        write!(
            f,
            "Errors: fetch={} ack={}",
            self.fetch_errors, self.ack_errors
        )
    }
}

/// Pulls messages from a [`MessageQueue`] and measures how long each call takes
///
/// Log output goes to the consumer's [`Span`], which defaults to one named after the
/// subscription and can be replaced with [`with_span`][Consumer::with_span].
#[derive(Debug)]
pub struct Consumer<Q> {
    queue: Q,
    cancel: CancellationToken,
    span: Span,
}

impl<Q: MessageQueue> Consumer<Q> {
    pub fn new(queue: Q) -> Self {
        let span = info_span!("consumer", subscription = queue.subscription());
        Self {
            queue,
            cancel: CancellationToken::new(),
            span,
        }
    }

    /// Stop promptly, including any in-flight call, when `cancel` fires
    pub fn with_cancellation(self, cancel: CancellationToken) -> Self {
        Self { cancel, ..self }
    }

    pub fn with_span(self, span: Span) -> Self {
        Self { span, ..self }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Pull until `config.target` messages were received or the run has to stop
    pub async fn pull(&self, config: &PullConfig) -> PullStats {
        self.pull_with(config, |_| ()).await
    }

    /// Like [`pull`][Consumer::pull], handing every received message to `on_message`
    pub async fn pull_with<F>(&self, config: &PullConfig, on_message: F) -> PullStats
    where
        F: FnMut(&ProvisioningMessage) + Send,
    {
        self.run(config, on_message)
            .instrument(self.span.clone())
            .await
    }

    async fn run<F>(&self, config: &PullConfig, mut on_message: F) -> PullStats
    where
        F: FnMut(&ProvisioningMessage) + Send,
    {
        info!(count = config.target, "pulling messages");
        let mut latencies = LatencyRecorder::with_capacity(config.target);
        let mut idle = IdleTracker::new(config.idle_timeout, config.poll_interval);

        let stop_reason = loop {
            let received = latencies.count(Operation::Fetch);
            if received >= config.target {
                break StopReason::TargetReached;
            }

            let start = Instant::now();
            let fetched = self
                .cancellable(self.queue.next(config.poll_interval, config.pop))
                .await;
            let fetch_duration = start.elapsed();

            let msg = match fetched {
                Ok(Some(msg)) => msg,
                Ok(None) => match idle.record_empty() {
                    Ok(()) => continue,
                    Err(e) => break StopReason::IdleTimeout(e),
                },
                Err(e) => {
                    latencies.record_error(Operation::Fetch);
                    error!(
                        received,
                        expected = config.target,
                        error = %e,
                        "failed to get message"
                    );
                    if matches!(e, PullError::Cancelled) {
                        break StopReason::Cancelled;
                    }
                    if config.fail_fast {
                        error!("failing fast on get error");
                        break StopReason::FetchFailed(e);
                    }
                    continue;
                }
            };

            idle.record_message(received);
            latencies.record(Operation::Fetch, fetch_duration);
            debug!(
                sequence_number = msg.sequence_number,
                num_delivered = msg.num_delivered,
                "received message"
            );
            on_message(&msg);

            if config.pop {
                continue;
            }

            let start = Instant::now();
            match self
                .cancellable(self.queue.acknowledge(msg.sequence_number))
                .await
            {
                Ok(()) => latencies.record(Operation::Acknowledge, start.elapsed()),
                Err(e) => {
                    latencies.record_error(Operation::Acknowledge);
                    error!(
                        acknowledged = latencies.count(Operation::Acknowledge),
                        sequence_number = msg.sequence_number,
                        error = %e,
                        "failed to ack message"
                    );
                    if matches!(e, PullError::Cancelled) {
                        break StopReason::Cancelled;
                    }
                    if config.fail_fast {
                        error!("failing fast on ack error");
                        break StopReason::AcknowledgeFailed(e);
                    }
                }
            }
        };

        info!(
            received = latencies.count(Operation::Fetch),
            fetch_errors = latencies.errors(Operation::Fetch),
            ack_errors = latencies.errors(Operation::Acknowledge),
            stop_reason = %stop_reason,
            "pull finished"
        );

        PullStats {
            expected: config.target,
            latencies,
            stop_reason,
        }
    }

    async fn cancellable<T, F>(&self, call: F) -> Result<T, PullError>
    where
        T: Send,
        F: Future<Output = Result<T, provisioning_client::Error>> + Send,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PullError::Cancelled),
            res = call => res.map_err(PullError::Client),
        }
    }
}
