//! HTTP client for the Provisioning API
//!
//! Covers the subscriber side of the API (long-poll for the next message,
//! report its processing status), the administrative subscription endpoints,
//! and publishing of events.
pub mod types;

use std::time::Duration;

use reqwest::{IntoUrl, Method, RequestBuilder, Response, StatusCode, header::ACCEPT};
use secrecy::{ExposeSecret, Secret};
use serde::de::DeserializeOwned;
use url::Url;

pub use crate::types::{
    Body, Message, MessageStatus, MessageStatusReport, NewSubscription, ParseRealmTopicError,
    PrefillStatus, ProvisioningMessage, RealmTopic, Subscription,
};

/// Error response bodies are truncated to this many bytes
pub const MAX_ERROR_BODY_BYTES: usize = 8 << 10;

const MAX_IDLE_CONNECTIONS_PER_HOST: usize = 100;
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(90);

/// Primary error type for the [`Client`]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("base URL error: {0}")]
    BaseUrl(#[source] reqwest::Error),

    #[error("base URL '{0}' cannot have API paths appended to it")]
    CannotBeABase(Url),

    #[error("failed to build the HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("failed to read the API response bytes: {0}")]
    Bytes(#[source] reqwest::Error),

    #[error("failed to parse JSON response: {0}")]
    Json(#[source] serde_json::Error),

    #[error("http {method} {path}: server responded with error [{code}]: {message}")]
    ApiError {
        method: Method,
        path: String,
        code: StatusCode,
        message: String,
    },

    #[error("failed to send {method} {path} request: {source}")]
    RequestSend {
        method: Method,
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

impl Error {
    fn request_send(method: Method, path: impl Into<String>, source: reqwest::Error) -> Self {
        Self::RequestSend {
            method,
            path: path.into(),
            source,
        }
    }

    /// No response was obtained from the server
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::RequestSend { .. })
    }

    /// The HTTP status code, if the server responded with an error
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::ApiError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The Provisioning API Client
///
/// Every request carries the client's own basic-auth credentials. Clients created with
/// [`fork`][Client::fork] share the connection pool of the client they were forked from, but
/// never its credentials.
#[derive(Debug, Clone)]
pub struct Client {
    /// The base URL of the Provisioning API, e.g., `http://localhost:7777`
    base_url: Url,
    /// The subscriber, publisher or admin identity used for basic auth
    username: String,
    password: Secret<String>,
    /// A [`reqwest::Client`] holding the pooled connections
    http_client: reqwest::Client,
}

impl Client {
    /// Create a new [`Client`] with its own connection pool
    ///
    /// # Example
    /// ```
    /// # use provisioning_client::Client;
    /// # fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    /// let admin = Client::new("http://localhost:7777", "admin", "provisioning")?;
    /// let events = admin.fork("udm", "udmpass");
    /// assert_eq!(events.username(), "udm");
    /// # Ok(())
    /// # }
    /// ```
    pub fn new<U: IntoUrl>(
        base_url: U,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS_PER_HOST)
            .pool_idle_timeout(IDLE_CONNECTION_TIMEOUT)
            .build()
            .map_err(Error::HttpClient)?;
        Self::with_http_client(base_url, username, password, http_client)
    }

    /// Create a new [`Client`] on top of an existing [`reqwest::Client`]
    pub fn with_http_client<U: IntoUrl>(
        base_url: U,
        username: impl Into<String>,
        password: impl Into<String>,
        http_client: reqwest::Client,
    ) -> Result<Self> {
        let base_url = base_url.into_url().map_err(Error::BaseUrl)?;
        if base_url.cannot_be_a_base() {
            return Err(Error::CannotBeABase(base_url));
        }
        Ok(Self {
            base_url,
            username: username.into(),
            password: Secret::new(password.into()),
            http_client,
        })
    }

    /// Create a client with different credentials that shares this client's connection pool
    pub fn fork(&self, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            base_url: self.base_url.clone(),
            username: username.into(),
            password: Secret::new(password.into()),
            http_client: self.http_client.clone(),
        }
    }

    /// The identity this client authenticates as
    ///
    /// For a subscriber client this is also the subscription name.
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Make a request to the `POST /v1/subscriptions` API
    pub async fn create_subscription(&self, subscription: &NewSubscription) -> Result<()> {
        let url = self.api_url(&["v1", "subscriptions"])?;
        let path = url.path().to_owned();
        let req = self.http_client.post(url).json(subscription);
        self.send_no_content(Method::POST, path, req).await
    }

    /// Make a request to the `GET /v1/subscriptions/{name}` API
    pub async fn get_subscription(&self, name: impl AsRef<str> + Send) -> Result<Subscription> {
        let url = self.api_url(&["v1", "subscriptions", name.as_ref()])?;
        let path = url.path().to_owned();
        let req = self.http_client.get(url);
        let resp = self.send(Method::GET, path, req).await?;
        let bytes = resp.bytes().await.map_err(Error::Bytes)?;
        serde_json::from_slice(&bytes).map_err(Error::Json)
    }

    /// Make a request to the `DELETE /v1/subscriptions/{name}` API
    pub async fn delete_subscription(&self, name: impl AsRef<str> + Send) -> Result<()> {
        let url = self.api_url(&["v1", "subscriptions", name.as_ref()])?;
        let path = url.path().to_owned();
        let req = self.http_client.delete(url);
        self.send_no_content(Method::DELETE, path, req).await
    }

    /// Make a request to the `POST /v1/messages` API to publish an event
    pub async fn publish_message(&self, message: &Message) -> Result<()> {
        let url = self.api_url(&["v1", "messages"])?;
        let path = url.path().to_owned();
        let req = self.http_client.post(url).json(message);
        self.send_no_content(Method::POST, path, req).await
    }

    /// Compose a request to the `GET /v1/subscriptions/{name}/messages/next` API
    ///
    /// The subscription is the one named by this client's [`username`][Client::username].
    ///
    /// # Example
    /// ```no_run
    /// # use std::time::Duration;
    /// # use provisioning_client::Client;
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    /// let client = Client::new("http://localhost:7777", "my-subscription", "secret")?;
    /// if let Some(message) = client
    ///     .next_message()
    ///     .timeout(Duration::from_secs(5))
    ///     .send()
    ///     .await?
    /// {
    ///     client.acknowledge(message.sequence_number).await?;
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn next_message(&self) -> NextMessageRequestBuilder<'_> {
        NextMessageRequestBuilder {
            client: self,
            timeout: None,
            pop: false,
        }
    }

    /// Make a request to the `PATCH /v1/subscriptions/{name}/messages/{seq}/status` API
    pub async fn message_status(
        &self,
        subscription: impl AsRef<str> + Send,
        sequence_number: u64,
        status: MessageStatus,
    ) -> Result<()> {
        let seq = sequence_number.to_string();
        let url = self.api_url(&[
            "v1",
            "subscriptions",
            subscription.as_ref(),
            "messages",
            seq.as_str(),
            "status",
        ])?;
        let path = url.path().to_owned();
        let req = self
            .http_client
            .patch(url)
            .json(&MessageStatusReport { status });
        self.send_no_content(Method::PATCH, path, req).await
    }

    /// Report a message of this client's subscription as successfully processed
    pub async fn acknowledge(&self, sequence_number: u64) -> Result<()> {
        self.message_status(&self.username, sequence_number, MessageStatus::Ok)
            .await
    }

    fn api_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::CannotBeABase(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, method: Method, path: String, req: RequestBuilder) -> Result<Response> {
        let resp = req
            .header(ACCEPT, "application/json")
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .send()
            .await
            .map_err(|src| Error::request_send(method.clone(), path.as_str(), src))?;
        let code = resp.status();
        if code.as_u16() >= 400 {
            return Err(Error::ApiError {
                method,
                path,
                code,
                message: read_truncated(resp).await,
            });
        }
        Ok(resp)
    }

    /// Send a request whose successful response carries no meaningful body
    async fn send_no_content(
        &self,
        method: Method,
        path: String,
        req: RequestBuilder,
    ) -> Result<()> {
        // drain the body so the connection can go back to the pool
        self.send(method, path, req)
            .await?
            .bytes()
            .await
            .map_err(Error::Bytes)?;
        Ok(())
    }
}

/// Read at most [`MAX_ERROR_BODY_BYTES`] of an error response body
async fn read_truncated(mut resp: Response) -> String {
    let mut buf = Vec::new();
    while buf.len() < MAX_ERROR_BODY_BYTES {
        match resp.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }
    buf.truncate(MAX_ERROR_BODY_BYTES);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Decode a body that may legitimately be empty or `null`
fn decode_optional<T: DeserializeOwned>(bytes: &[u8]) -> Result<Option<T>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(bytes).map_err(Error::Json)
}

/// Builder type for composing a long-poll request for the next message
///
/// Produced by [`Client::next_message`]
#[derive(Debug)]
#[must_use = "if unused, the request will not be sent"]
pub struct NextMessageRequestBuilder<'c> {
    client: &'c Client,
    timeout: Option<Duration>,
    pop: bool,
}

impl NextMessageRequestBuilder<'_> {
    /// How long the server may hold the request open waiting for a message
    ///
    /// Sent in fractional seconds. If not set, the server's default applies.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Remove the message from the queue as part of fetching it
    ///
    /// Popped messages must not be acknowledged.
    pub fn pop(mut self, pop: bool) -> Self {
        self.pop = pop;
        self
    }

    /// Send the request
    ///
    /// Returns `None` if no message became available within the long-poll window.
    pub async fn send(self) -> Result<Option<ProvisioningMessage>> {
        let url = self.client.api_url(&[
            "v1",
            "subscriptions",
            self.client.username.as_str(),
            "messages",
            "next",
        ])?;
        let mut query = Vec::with_capacity(2);
        if let Some(timeout) = self.timeout {
            query.push(("timeout", timeout.as_secs_f64().to_string()));
        }
        query.push(("pop", self.pop.to_string()));

        let path = url.path().to_owned();
        let req = self.client.http_client.get(url).query(&query);
        let resp = self.client.send(Method::GET, path, req).await?;
        let bytes = resp.bytes().await.map_err(Error::Bytes)?;
        decode_optional(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use mockito::{Matcher, Server};
    use pretty_assertions::assert_eq;
    use reqwest::{Method, StatusCode};
    use serde_json::json;

    use crate::{
        Client, Error, MAX_ERROR_BODY_BYTES, MessageStatus, NewSubscription, PrefillStatus,
        RealmTopic,
    };

    fn basic(username: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
    }

    fn message_json(seq: u64) -> serde_json::Value {
        json!({
            "publisher_name": "consumer_client_test",
            "ts": "2024-05-01T12:00:00Z",
            "realm": "udm",
            "topic": "tests/topic",
            "body": {"old": {}, "new": {"count": seq, "objectType": "foo/bar"}},
            "sequence_number": seq,
            "num_delivered": 1,
        })
    }

    #[tokio::test]
    async fn next_message() {
        let mut mock_server = Server::new_async().await;
        let mock = mock_server
            .mock("GET", "/v1/subscriptions/sub-1/messages/next")
            .match_header("Authorization", basic("sub-1", "s3cret").as_str())
            .match_header("Accept", "application/json")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("timeout".into(), "0.5".into()),
                Matcher::UrlEncoded("pop".into(), "false".into()),
            ]))
            .with_status(200)
            .with_body(message_json(7).to_string())
            .create_async()
            .await;

        let client = Client::new(mock_server.url(), "sub-1", "s3cret").expect("create client");
        let msg = client
            .next_message()
            .timeout(Duration::from_millis(500))
            .send()
            .await
            .expect("send next request")
            .expect("a message");

        assert_eq!(msg.sequence_number, 7);
        assert_eq!(msg.num_delivered, 1);
        assert_eq!(msg.body.new["count"], json!(7));
        assert_eq!(msg.topic, "tests/topic");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn next_message_pop() {
        let mut mock_server = Server::new_async().await;
        let mock = mock_server
            .mock("GET", "/v1/subscriptions/sub-1/messages/next")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("timeout".into(), "2".into()),
                Matcher::UrlEncoded("pop".into(), "true".into()),
            ]))
            .with_status(200)
            .with_body(message_json(1).to_string())
            .create_async()
            .await;

        let client = Client::new(mock_server.url(), "sub-1", "pw").expect("create client");
        let msg = client
            .next_message()
            .timeout(Duration::from_secs(2))
            .pop(true)
            .send()
            .await
            .expect("send next request");

        assert!(msg.is_some());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn next_message_empty_or_null_is_none() {
        let mut mock_server = Server::new_async().await;
        let empty = mock_server
            .mock("GET", "/v1/subscriptions/empty/messages/next")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("")
            .create_async()
            .await;
        let null = mock_server
            .mock("GET", "/v1/subscriptions/null/messages/next")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("null\n")
            .create_async()
            .await;

        let base = Client::new(mock_server.url(), "admin", "pw").expect("create client");
        for name in ["empty", "null"] {
            let msg = base
                .fork(name, "pw")
                .next_message()
                .timeout(Duration::from_millis(100))
                .send()
                .await
                .expect("send next request");
            assert!(msg.is_none(), "{name}: {msg:?}");
        }

        empty.assert_async().await;
        null.assert_async().await;
    }

    #[tokio::test]
    async fn next_message_with_zero_sequence_number_is_a_message() {
        let mut mock_server = Server::new_async().await;
        let mut body = message_json(0);
        body["publisher_name"] = json!("");
        body["num_delivered"] = json!(0);
        let mock = mock_server
            .mock("GET", "/v1/subscriptions/sub/messages/next")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let client = Client::new(mock_server.url(), "sub", "pw").expect("create client");
        let msg = client.next_message().send().await.expect("send next request");

        assert_eq!(msg.map(|m| m.sequence_number), Some(0));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn next_message_api_error() {
        let mut mock_server = Server::new_async().await;
        let mock = mock_server
            .mock("GET", "/v1/subscriptions/sub/messages/next")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"detail":"subscription not found"}"#)
            .create_async()
            .await;

        let client = Client::new(mock_server.url(), "sub", "pw").expect("create client");
        let err = client.next_message().send().await.unwrap_err();

        match &err {
            Error::ApiError {
                method,
                path,
                code,
                message,
            } => {
                assert_eq!(method, &Method::GET);
                assert_eq!(path, "/v1/subscriptions/sub/messages/next");
                assert_eq!(*code, StatusCode::NOT_FOUND);
                assert!(message.contains("subscription not found"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert!(!err.is_transport());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn api_error_body_is_truncated() {
        let mut mock_server = Server::new_async().await;
        let mock = mock_server
            .mock("PATCH", "/v1/subscriptions/sub/messages/3/status")
            .with_status(500)
            .with_body("x".repeat(MAX_ERROR_BODY_BYTES * 2))
            .create_async()
            .await;

        let client = Client::new(mock_server.url(), "sub", "pw").expect("create client");
        let err = client.acknowledge(3).await.unwrap_err();

        let Error::ApiError { code, message, .. } = err else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(message.len(), MAX_ERROR_BODY_BYTES);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn transport_error() {
        // nothing listens on port 1
        let client = Client::new("http://127.0.0.1:1", "sub", "pw").expect("create client");
        let err = client.next_message().send().await.unwrap_err();
        assert!(err.is_transport(), "{err:?}");
        assert!(matches!(err, Error::RequestSend { method: Method::GET, .. }));
    }

    #[tokio::test]
    async fn errors_after_a_response_are_not_transport_errors() {
        let send_err = reqwest::Client::new()
            .get("http://127.0.0.1:1")
            .send()
            .await
            .unwrap_err();
        assert!(!Error::Bytes(send_err).is_transport());

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!Error::Json(json_err).is_transport());
    }

    #[tokio::test]
    async fn acknowledge() {
        let mut mock_server = Server::new_async().await;
        let mock = mock_server
            .mock("PATCH", "/v1/subscriptions/sub-1/messages/42/status")
            .match_header("Authorization", basic("sub-1", "pw").as_str())
            .match_header("Content-Type", "application/json")
            .match_body(Matcher::Json(json!({"status": "ok"})))
            .with_status(200)
            .expect(2)
            .create_async()
            .await;

        let client = Client::new(mock_server.url(), "sub-1", "pw").expect("create client");
        client.acknowledge(42).await.expect("acknowledge");
        // acknowledging twice is not a client error
        client
            .message_status("sub-1", 42, MessageStatus::Ok)
            .await
            .expect("acknowledge again");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn forks_keep_their_own_credentials() {
        let mut mock_server = Server::new_async().await;
        let mut mocks = Vec::new();
        for (name, password) in [("sub-a", "pass-a"), ("sub-b", "pass-b")] {
            mocks.push(
                mock_server
                    .mock(
                        "GET",
                        format!("/v1/subscriptions/{name}/messages/next").as_str(),
                    )
                    .match_header("Authorization", basic(name, password).as_str())
                    .match_query(Matcher::Any)
                    .with_status(200)
                    .with_body(message_json(1).to_string())
                    .create_async()
                    .await,
            );
        }
        mocks.push(
            mock_server
                .mock("DELETE", "/v1/subscriptions/sub-a")
                .match_header("Authorization", basic("admin", "provisioning").as_str())
                .with_status(200)
                .create_async()
                .await,
        );

        let admin =
            Client::new(mock_server.url(), "admin", "provisioning").expect("create client");
        let a = admin.fork("sub-a", "pass-a");
        let b = admin.fork("sub-b", "pass-b");

        let (ra, rb) = tokio::join!(a.next_message().send(), b.next_message().send());
        assert!(ra.expect("fetch as sub-a").is_some());
        assert!(rb.expect("fetch as sub-b").is_some());
        admin
            .delete_subscription("sub-a")
            .await
            .expect("delete as admin");

        for mock in mocks {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn subscription_lifecycle() {
        let mut mock_server = Server::new_async().await;
        let create = mock_server
            .mock("POST", "/v1/subscriptions")
            .match_header("Authorization", basic("admin", "pw").as_str())
            .match_body(Matcher::Json(json!({
                "name": "sub",
                "realms_topics": [{"realm": "udm", "topic": "tests/topic"}],
                "request_prefill": false,
                "password": "sub-pw",
            })))
            .with_status(201)
            .create_async()
            .await;
        let get = mock_server
            .mock("GET", "/v1/subscriptions/sub")
            .with_status(200)
            .with_body(
                json!({
                    "name": "sub",
                    "realms_topics": [{"realm": "udm", "topic": "tests/topic"}],
                    "request_prefill": false,
                    "prefill_queue_status": "done",
                })
                .to_string(),
            )
            .create_async()
            .await;
        let delete = mock_server
            .mock("DELETE", "/v1/subscriptions/sub")
            .with_status(200)
            .create_async()
            .await;

        let client = Client::new(mock_server.url(), "admin", "pw").expect("create client");
        client
            .create_subscription(&NewSubscription {
                name: "sub".into(),
                realms_topics: vec![RealmTopic::new("udm", "tests/topic")],
                request_prefill: false,
                password: "sub-pw".into(),
            })
            .await
            .expect("create subscription");
        let sub = client.get_subscription("sub").await.expect("get subscription");
        assert_eq!(sub.name, "sub");
        assert_eq!(sub.prefill_queue_status, PrefillStatus::Done);
        client
            .delete_subscription("sub")
            .await
            .expect("delete subscription");

        create.assert_async().await;
        get.assert_async().await;
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn publish_message() {
        let mut mock_server = Server::new_async().await;
        let mock = mock_server
            .mock("POST", "/v1/messages")
            .match_header("Authorization", basic("udm", "udmpass").as_str())
            .match_body(Matcher::PartialJson(json!({
                "publisher_name": "consumer_client_test",
                "realm": "udm",
                "topic": "tests/topic",
                "body": {"old": {}, "new": {"count": 3}},
            })))
            .with_status(202)
            .create_async()
            .await;

        let client = Client::new(mock_server.url(), "udm", "udmpass").expect("create client");
        let message = crate::Message {
            publisher_name: "consumer_client_test".into(),
            ts: chrono::Utc::now(),
            realm: "udm".into(),
            topic: "tests/topic".into(),
            body: crate::Body {
                old: Default::default(),
                new: json!({"count": 3}).as_object().cloned().unwrap(),
            },
        };
        client
            .publish_message(&message)
            .await
            .expect("publish message");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn base_url_with_path_prefix() {
        let mut mock_server = Server::new_async().await;
        let mock = mock_server
            .mock("DELETE", "/provisioning/v1/subscriptions/sub")
            .with_status(200)
            .create_async()
            .await;

        let client = Client::new(format!("{}/provisioning/", mock_server.url()), "admin", "pw")
            .expect("create client");
        client
            .delete_subscription("sub")
            .await
            .expect("delete subscription");

        mock.assert_async().await;
    }
}
