//! Request and response types for the Provisioning API

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Processing status reported back for a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// The message was processed successfully
    Ok,
}

/// Status of the prefill queue for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefillStatus {
    Pending,
    Running,
    Failed,
    Done,
}

/// A realm paired with a topic, e.g., realm `udm` and topic `users/user`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RealmTopic {
    pub realm: String,
    pub topic: String,
}

impl RealmTopic {
    pub fn new(realm: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            topic: topic.into(),
        }
    }
}

impl fmt::Display for RealmTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.realm, self.topic)
    }
}

/// Error parsing a [`RealmTopic`] from its `realm:topic` form
#[derive(Debug, thiserror::Error)]
#[error("invalid realm/topic '{0}', expected the form 'realm:topic'")]
pub struct ParseRealmTopicError(String);

impl FromStr for RealmTopic {
    type Err = ParseRealmTopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((realm, topic)) if !realm.is_empty() && !topic.is_empty() => {
                Ok(Self::new(realm, topic))
            }
            _ => Err(ParseRealmTopicError(s.to_owned())),
        }
    }
}

/// Sent to the `POST /v1/subscriptions` API to register a subscription
#[derive(Clone, Serialize)]
pub struct NewSubscription {
    pub name: String,
    pub realms_topics: Vec<RealmTopic>,
    pub request_prefill: bool,
    pub password: String,
}

impl fmt::Debug for NewSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewSubscription")
            .field("name", &self.name)
            .field("realms_topics", &self.realms_topics)
            .field("request_prefill", &self.request_prefill)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// A registered subscription as returned by `GET /v1/subscriptions/{name}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Subscription {
    pub name: String,
    pub realms_topics: Vec<RealmTopic>,
    pub request_prefill: bool,
    pub prefill_queue_status: PrefillStatus,
}

/// The `old` and `new` snapshots of the changed entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Body {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub old: Map<String, Value>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub new: Map<String, Value>,
}

/// Publishers send `null` for a missing snapshot
fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Map<String, Value>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// An event posted by a publisher to `POST /v1/messages`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub publisher_name: String,
    pub ts: DateTime<Utc>,
    pub realm: String,
    pub topic: String,
    pub body: Body,
}

/// A message as delivered to a subscriber
///
/// The `sequence_number` is assigned by the server and is the key used to
/// acknowledge the message. `num_delivered` is incremented by the server each
/// time the message is handed out again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningMessage {
    pub publisher_name: String,
    pub ts: DateTime<Utc>,
    pub realm: String,
    pub topic: String,
    pub body: Body,
    pub sequence_number: u64,
    pub num_delivered: u32,
}

/// Body of the `PATCH /v1/subscriptions/{name}/messages/{seq}/status` API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStatusReport {
    pub status: MessageStatus,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn realm_topic_from_str() {
        let rt: RealmTopic = "udm:users/user".parse().unwrap();
        assert_eq!(rt, RealmTopic::new("udm", "users/user"));
        assert_eq!(rt.to_string(), "udm:users/user");

        assert!("udm".parse::<RealmTopic>().is_err());
        assert!(":users/user".parse::<RealmTopic>().is_err());
        assert!("udm:".parse::<RealmTopic>().is_err());
    }

    #[test]
    fn new_subscription_debug_hides_password() {
        let sub = NewSubscription {
            name: "sub".into(),
            realms_topics: vec![RealmTopic::new("udm", "tests/topic")],
            request_prefill: false,
            password: "hunter2".into(),
        };
        let printed = format!("{sub:?}");
        assert!(!printed.contains("hunter2"), "{printed}");
        assert!(printed.contains("[REDACTED]"), "{printed}");
    }

    #[test]
    fn deserialize_subscription() {
        let sub: Subscription = serde_json::from_value(json!({
            "name": "sub",
            "realms_topics": [{"realm": "udm", "topic": "groups/group"}],
            "request_prefill": true,
            "prefill_queue_status": "running",
        }))
        .unwrap();
        assert_eq!(sub.prefill_queue_status, PrefillStatus::Running);
        assert_eq!(sub.realms_topics[0].topic, "groups/group");
    }

    #[test]
    fn body_with_null_snapshot() {
        let body: Body = serde_json::from_value(json!({
            "old": null,
            "new": {"count": 3},
        }))
        .unwrap();
        assert!(body.old.is_empty());
        assert_eq!(body.new["count"], 3);

        let body: Body = serde_json::from_value(json!({"new": {}})).unwrap();
        assert_eq!(body, Body::default());
    }

    #[test]
    fn serialize_status_report() {
        let report = MessageStatusReport {
            status: MessageStatus::Ok,
        };
        assert_eq!(serde_json::to_value(report).unwrap(), json!({"status": "ok"}));
    }
}
