//! Throwaway subscriptions and dummy traffic for harness runs and live-server tests
use std::time::Duration;

use observability_deps::tracing::{info, warn};
use provisioning_client::{
    Body, Client, Message, NewSubscription, ProvisioningMessage, RealmTopic, Result,
};
use rand::RngCore;
use serde_json::json;

use crate::consumer::{Consumer, PullConfig, PullError, StopReason};

pub const DUMMY_REALM: &str = "udm";
pub const DUMMY_TOPIC: &str = "tests/topic";

/// Publisher name stamped on every generated message
pub const PUBLISHER_NAME: &str = "provisioning_perf";

/// Prefix of the names of subscriptions created by [`TestSubscription::create`]
pub const SUBSCRIPTION_PREFIX: &str = "perf-";

const GET_MESSAGES_POLL_INTERVAL: Duration = Duration::from_millis(100);
const GET_MESSAGES_MAX_EMPTY_POLLS: u32 = 10;

pub fn dummy_realm_topic() -> RealmTopic {
    RealmTopic::new(DUMMY_REALM, DUMMY_TOPIC)
}

/// `bytes` random bytes, hex encoded
pub fn rand_hex(bytes: usize) -> String {
    let mut buf = vec![0; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// A message for the dummy realm and topic that carries `count` in its body
pub fn dummy_message(count: u64) -> Message {
    dummy_message_for(&dummy_realm_topic(), count)
}

pub fn dummy_message_for(realm_topic: &RealmTopic, count: u64) -> Message {
    let new = json!({
        "count": count,
        "objectType": "foo/bar",
    });
    Message {
        publisher_name: PUBLISHER_NAME.to_owned(),
        ts: chrono::Utc::now(),
        realm: realm_topic.realm.clone(),
        topic: realm_topic.topic.clone(),
        body: Body {
            old: Default::default(),
            new: new.as_object().cloned().unwrap_or_default(),
        },
    }
}

/// Publish `n` dummy messages with counts `0..n`, one after the other
///
/// Messages are spread over `realm_topics` round-robin; an empty slice uses the dummy realm and
/// topic.
pub async fn publish_n(client: &Client, realm_topics: &[RealmTopic], n: u64) -> Result<()> {
    let fallback = [dummy_realm_topic()];
    let realm_topics = if realm_topics.is_empty() {
        &fallback[..]
    } else {
        realm_topics
    };
    for (count, realm_topic) in (0..n).zip(realm_topics.iter().cycle()) {
        client
            .publish_message(&dummy_message_for(realm_topic, count))
            .await?;
    }
    Ok(())
}

/// Pull and acknowledge up to `count` messages
///
/// Long-polls for 100ms at a time and gives up after 10 consecutive empty polls, so fewer
/// messages than requested may be returned. The first failed call is returned as an error.
pub async fn get_messages(
    client: &Client,
    count: usize,
) -> Result<Vec<ProvisioningMessage>, PullError> {
    let config = PullConfig::new(
        count,
        GET_MESSAGES_POLL_INTERVAL,
        GET_MESSAGES_POLL_INTERVAL * GET_MESSAGES_MAX_EMPTY_POLLS,
    )
    .with_fail_fast(true);

    let mut messages = Vec::with_capacity(count);
    let stats = Consumer::new(client.clone())
        .pull_with(&config, |msg| messages.push(msg.clone()))
        .await;

    match stats.into_stop_reason() {
        StopReason::FetchFailed(e) | StopReason::AcknowledgeFailed(e) => Err(e),
        StopReason::Cancelled => Err(PullError::Cancelled),
        StopReason::TargetReached | StopReason::IdleTimeout(_) => Ok(messages),
    }
}

/// A subscription with a random name and password, accessed through its own forked client
#[derive(Debug)]
pub struct TestSubscription {
    name: String,
    client: Client,
}

impl TestSubscription {
    /// Register a new subscription to `realm_topics` using the `admin` client
    pub async fn create(admin: &Client, realm_topics: Vec<RealmTopic>) -> Result<Self> {
        let name = format!("{SUBSCRIPTION_PREFIX}{}", rand_hex(8));
        let password = rand_hex(16);
        admin
            .create_subscription(&NewSubscription {
                name: name.clone(),
                realms_topics: realm_topics,
                request_prefill: false,
                password: password.clone(),
            })
            .await?;
        info!(subscription = %name, "created subscription");

        let client = admin.fork(name.clone(), password);
        Ok(Self { name, client })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A client authenticated as the subscriber
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn delete(self, admin: &Client) -> Result<()> {
        match admin.delete_subscription(&self.name).await {
            Ok(()) => {
                info!(subscription = %self.name, "deleted subscription");
                Ok(())
            }
            Err(e) => {
                warn!(subscription = %self.name, error = %e, "failed to delete subscription");
                Err(e)
            }
        }
    }
}
