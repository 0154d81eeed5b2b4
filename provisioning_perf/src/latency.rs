//! Latency sample collection and order statistics
use std::{fmt, time::Duration};

/// The timed operations of a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Long-poll for the next message
    Fetch,
    /// Report a message as processed
    Acknowledge,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch => write!(f, "fetch"),
            Self::Acknowledge => write!(f, "ack"),
        }
    }
}

#[derive(Debug, Default)]
struct Samples {
    durations: Vec<Duration>,
    errors: usize,
}

/// Append-only record of operation latencies and failures for one consumer run
#[derive(Debug, Default)]
pub struct LatencyRecorder {
    fetch: Samples,
    acknowledge: Samples,
}

impl LatencyRecorder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fetch: Samples {
                durations: Vec::with_capacity(capacity),
                errors: 0,
            },
            acknowledge: Samples {
                durations: Vec::with_capacity(capacity),
                errors: 0,
            },
        }
    }

    /// Record the latency of a successful operation
    pub fn record(&mut self, op: Operation, duration: Duration) {
        self.samples_mut(op).durations.push(duration);
    }

    /// Count a failed operation, which contributes no latency sample
    pub fn record_error(&mut self, op: Operation) {
        self.samples_mut(op).errors += 1;
    }

    pub fn samples(&self, op: Operation) -> &[Duration] {
        &self.samples_ref(op).durations
    }

    pub fn count(&self, op: Operation) -> usize {
        self.samples_ref(op).durations.len()
    }

    pub fn errors(&self, op: Operation) -> usize {
        self.samples_ref(op).errors
    }

    pub fn summarize(&self, op: Operation) -> Insights {
        Insights::from_samples(self.samples(op))
    }

    fn samples_ref(&self, op: Operation) -> &Samples {
        match op {
            Operation::Fetch => &self.fetch,
            Operation::Acknowledge => &self.acknowledge,
        }
    }

    fn samples_mut(&mut self, op: Operation) -> &mut Samples {
        match op {
            Operation::Fetch => &mut self.fetch,
            Operation::Acknowledge => &mut self.acknowledge,
        }
    }
}

/// Summary statistics over a set of latency samples
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Insights {
    pub count: usize,
    pub min: Duration,
    pub avg: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub max: Duration,
}

impl Insights {
    /// Compute the statistics; an empty sample set gives all zeros
    pub fn from_samples(samples: &[Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();

        let count = sorted.len();
        let sum: u128 = sorted.iter().map(Duration::as_nanos).sum();
        let avg = u64::try_from(sum / count as u128).unwrap_or(u64::MAX);

        Self {
            count,
            min: sorted[0],
            avg: Duration::from_nanos(avg),
            p50: percentile(&sorted, 50),
            p95: percentile(&sorted, 95),
            p99: percentile(&sorted, 99),
            max: sorted[count - 1],
        }
    }
}

/// The sample at index `floor(len * p / 100)`, clamped to the last index
fn percentile(sorted: &[Duration], p: usize) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = (sorted.len() * p / 100).min(sorted.len() - 1);
    sorted[idx]
}

fn round_micros(d: Duration) -> Duration {
    let micros = (d.as_nanos() + 500) / 1_000;
    Duration::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
}

impl fmt::Display for Insights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "count={} min={:?} avg={:?} p50={:?} p95={:?} p99={:?} max={:?}",
            self.count,
            round_micros(self.min),
            round_micros(self.avg),
            round_micros(self.p50),
            round_micros(self.p95),
            round_micros(self.p99),
            round_micros(self.max),
        )
    }
}
