use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use observability_deps::tracing::{error, info, info_span, warn};
use provisioning_client::{Client, RealmTopic};
use provisioning_perf::{
    consumer::{Consumer, PullConfig, PullStats},
    fixtures::{TestSubscription, publish_n},
    queue::MessageQueue,
};
use tokio_util::sync::CancellationToken;

use super::common::{Clients, FutureOffsetTime, ProvisioningConfig, create_clients};

#[derive(Debug, Parser)]
pub(crate) struct Config {
    /// Provisioning API connection and credentials
    #[clap(flatten)]
    provisioning_config: ProvisioningConfig,

    /// Logging config
    #[clap(flatten)]
    pub(crate) logging_config: trogging::cli::LoggingConfig,

    /// Number of messages every subscriber has to receive in the measured run
    #[clap(
        short = 'n',
        long = "messages",
        env = "PERF_MESSAGES",
        default_value = "100"
    )]
    messages: usize,

    /// Number of messages every subscriber pulls before measuring
    #[clap(
        long = "warmup-messages",
        env = "PERF_WARMUP_MESSAGES",
        default_value = "1"
    )]
    warmup_messages: usize,

    /// Number of subscriptions pulling in parallel
    #[clap(
        short = 's',
        long = "subscribers",
        env = "PERF_SUBSCRIBERS",
        default_value = "1"
    )]
    subscribers: usize,

    /// Abort a subscriber's run on its first failed fetch or acknowledge
    #[clap(long = "fail-fast", env = "PERF_FAIL_FAST", default_value_t = false)]
    fail_fast: bool,

    /// Remove messages while fetching them instead of acknowledging them
    #[clap(long = "pop", env = "PERF_POP", default_value_t = false)]
    pop: bool,

    /// Long-poll window of every fetch [default: 1s]
    #[clap(long = "poll-interval", env = "PERF_POLL_INTERVAL")]
    poll_interval: Option<humantime::Duration>,

    /// Long-poll window in milliseconds, used when `--poll-interval` is not given
    #[clap(long = "poll-interval-ms", env = "PERF_POLL_INTERVAL_MS", hide = true)]
    poll_interval_ms: Option<u64>,

    /// How long a subscription may stay empty before its run is given up [default: 10s]
    #[clap(long = "idle-timeout", env = "PERF_IDLE_TIMEOUT")]
    idle_timeout: Option<humantime::Duration>,

    /// Idle timeout in milliseconds, used when `--idle-timeout` is not given
    #[clap(long = "idle-timeout-ms", env = "PERF_IDLE_MS", hide = true)]
    idle_timeout_ms: Option<u64>,

    /// Pause between creating the subscriptions and publishing, so that the
    /// server starts routing messages to them
    #[clap(
        long = "settle-delay",
        env = "PERF_SETTLE_DELAY",
        default_value = "1s"
    )]
    settle_delay: humantime::Duration,

    /// Realms and topics to subscribe and publish to, in `realm:topic` form
    #[clap(
        long = "realm-topic",
        env = "PERF_REALM_TOPICS",
        default_value = "udm:tests/topic",
        value_delimiter = ','
    )]
    realm_topics: Vec<RealmTopic>,

    /// Stop all subscribers at this time, either an offset such as `10m` or an RFC3339 date-time
    #[clap(long = "deadline", env = "PERF_DEADLINE")]
    deadline: Option<FutureOffsetTime>,
}

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// A duration flag wins over its millisecond form, which wins over the default
fn duration_or_millis(
    duration: Option<humantime::Duration>,
    millis: Option<u64>,
    default: Duration,
) -> Duration {
    duration
        .map(Into::into)
        .or_else(|| millis.map(Duration::from_millis))
        .unwrap_or(default)
}

impl Config {
    fn poll_interval(&self) -> Duration {
        duration_or_millis(
            self.poll_interval,
            self.poll_interval_ms,
            DEFAULT_POLL_INTERVAL,
        )
    }

    fn idle_timeout(&self) -> Duration {
        duration_or_millis(self.idle_timeout, self.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT)
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.poll_interval().is_zero() {
            bail!("poll interval must be greater than zero");
        }
        if self.subscribers == 0 {
            bail!("at least one subscriber is required");
        }
        if self.realm_topics.is_empty() {
            bail!("at least one realm:topic is required");
        }
        Ok(())
    }

    fn pull_config(&self, target: usize) -> PullConfig {
        PullConfig::new(target, self.poll_interval(), self.idle_timeout())
            .with_fail_fast(self.fail_fast)
            .with_pop(self.pop)
    }
}

pub(crate) async fn command(
    config: Config,
    cancel: CancellationToken,
) -> Result<(), anyhow::Error> {
    config.validate()?;
    let Clients { admin, events } = create_clients(&config.provisioning_config)?;

    if let Some(deadline) = config.deadline {
        let cancel = cancel.clone();
        let remaining = deadline.remaining();
        info!(?remaining, "stopping subscribers at deadline");
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(remaining) => {
                    warn!("deadline reached, stopping subscribers");
                    cancel.cancel();
                }
            }
        });
    }

    let mut subscriptions = Vec::with_capacity(config.subscribers);
    let mut result: Result<(), anyhow::Error> = Ok(());
    for _ in 0..config.subscribers {
        match TestSubscription::create(&admin, config.realm_topics.clone()).await {
            Ok(subscription) => subscriptions.push(subscription),
            Err(e) => {
                result = Err(e).context("failed to create subscription");
                break;
            }
        }
    }

    if result.is_ok() {
        result = run_subscribers(&config, &events, &subscriptions, &cancel).await;
    }

    for subscription in subscriptions {
        // failures are logged, the result of the run is what counts
        let _ = subscription.delete(&admin).await;
    }
    result
}

async fn run_subscribers(
    config: &Config,
    events: &Client,
    subscriptions: &[TestSubscription],
    cancel: &CancellationToken,
) -> Result<(), anyhow::Error> {
    let settle_delay = Duration::from(config.settle_delay);
    info!(?settle_delay, "waiting for subscriptions to settle");
    tokio::select! {
        _ = cancel.cancelled() => bail!("cancelled before publishing"),
        _ = tokio::time::sleep(settle_delay) => {}
    }

    let total = config.messages + config.warmup_messages;
    publish_n(events, &config.realm_topics, total as u64)
        .await
        .context("failed to publish messages")?;
    info!(count = total, "published messages");

    let warmup = config.pull_config(config.warmup_messages);
    let measured = config.pull_config(config.messages);
    let mut tasks = Vec::with_capacity(subscriptions.len());
    for subscription in subscriptions {
        let consumer = Consumer::new(subscription.client().clone())
            .with_cancellation(cancel.clone())
            .with_span(info_span!("subscriber", subscription = subscription.name()));
        tasks.push(tokio::spawn(run_subscriber(consumer, warmup, measured)));
    }

    let mut incomplete = 0;
    for (subscription, task) in subscriptions.iter().zip(tasks) {
        let stats = task.await.context("subscriber task failed")?;
        let summary = stats.summary();
        println!("subscription: {}", subscription.name());
        println!("{summary}");
        if let Err(e) = summary.evaluate() {
            error!(
                subscription = subscription.name(),
                stop_reason = %stats.stop_reason(),
                error = %e,
                "run incomplete"
            );
            incomplete += 1;
        }
    }

    if incomplete > 0 {
        bail!(
            "{incomplete} of {} subscribers did not complete their run",
            subscriptions.len()
        );
    }
    info!("all subscribers finished");
    Ok(())
}

async fn run_subscriber(
    consumer: Consumer<Client>,
    warmup: PullConfig,
    measured: PullConfig,
) -> PullStats {
    if warmup.target > 0 {
        let stats = consumer.pull(&warmup).await;
        if let Err(e) = stats.summary().evaluate() {
            warn!(
                subscription = consumer.queue().subscription(),
                stop_reason = %stats.stop_reason(),
                error = %e,
                "warm-up incomplete"
            );
        }
    }
    consumer.pull(&measured).await
}
