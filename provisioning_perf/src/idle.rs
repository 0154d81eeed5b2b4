//! Detect sustained emptiness of a subscription queue
use std::time::Duration;

use observability_deps::tracing::{info, warn};
use tokio::time::Instant;

/// The idle budget was used up by consecutive empty long-polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error(
    "idle timeout reached after {consecutive_empty} consecutive empty polls \
    ({idle_duration:?} without a message)"
)]
pub struct IdleTimeoutExceeded {
    pub consecutive_empty: usize,
    pub idle_duration: Duration,
}

/// Counts consecutive empty polls and decides when the consumer has been idle for too long
///
/// The wall-clock idle budget is converted to a number of polls by rounding up, so the
/// tracker never gives up before `idle_timeout` worth of long-polls has actually been made.
#[derive(Debug, Clone, Copy)]
pub struct IdleTracker {
    max_consecutive_empty: usize,
    consecutive_empty: usize,
    idle_start: Option<Instant>,
}

impl IdleTracker {
    pub fn new(idle_timeout: Duration, poll_interval: Duration) -> Self {
        let polls = idle_timeout
            .as_nanos()
            .div_ceil(poll_interval.as_nanos().max(1));
        Self {
            max_consecutive_empty: usize::try_from(polls).unwrap_or(usize::MAX).max(1),
            consecutive_empty: 0,
            idle_start: None,
        }
    }

    /// Number of consecutive empty polls tolerated before [`IdleTimeoutExceeded`]
    pub fn max_consecutive_empty(&self) -> usize {
        self.max_consecutive_empty
    }

    /// Length of the current idle streak
    pub fn consecutive_empty(&self) -> usize {
        self.consecutive_empty
    }

    pub fn is_idle(&self) -> bool {
        self.consecutive_empty > 0
    }

    /// Record a long-poll that completed without a message
    pub fn record_empty(&mut self) -> Result<(), IdleTimeoutExceeded> {
        if self.consecutive_empty == 0 {
            self.idle_start = Some(Instant::now());
        }
        self.consecutive_empty += 1;

        if self.consecutive_empty >= self.max_consecutive_empty {
            let err = IdleTimeoutExceeded {
                consecutive_empty: self.consecutive_empty,
                idle_duration: self.idle_duration(),
            };
            warn!(
                consecutive_empty = err.consecutive_empty,
                idle_duration = ?err.idle_duration,
                "stopping after consecutive empty polls"
            );
            return Err(err);
        }
        Ok(())
    }

    /// Record a received message, ending any idle streak
    ///
    /// `index` is the position of the message within the run and is only used for logging.
    pub fn record_message(&mut self, index: usize) {
        if self.consecutive_empty == 0 {
            return;
        }
        info!(
            index,
            consecutive_empty = self.consecutive_empty,
            idle_duration = ?self.idle_duration(),
            "received message after idle period"
        );
        self.consecutive_empty = 0;
        self.idle_start = None;
    }

    fn idle_duration(&self) -> Duration {
        self.idle_start
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }
}
