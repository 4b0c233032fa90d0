//! Batch dispatch of outbound callback requests.
//!
//! A batch is fanned out with at most `concurrency_limit` requests in flight
//! and is only returned once every request has settled. Transport failures are
//! folded into synthesized [`Outcome::TransportError`] values, so the result
//! map always holds exactly one entry per dispatched job code.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use relayq_core::{Code, HttpVerb, ResponseHeaders};

use super::compose::RequestSpec;

/// Status used when a transport failure carries no status of its own.
pub const SYNTHESIZED_STATUS: u16 = 500;

const CONNECTION_PROBLEM: &str = "Queue server exception: Connection problem: ";

/// A response actually received from the callback, whatever its status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status_code: u16,
    pub status_message: String,
    pub headers: ResponseHeaders,
    pub body: String,
}

/// Why no usable response came back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {message}")]
    Request { status: Option<u16>, message: String },
    #[error("malformed response: {0}")]
    Body(String),
    #[error("http client setup failed: {0}")]
    Setup(String),
}

impl TransportError {
    /// Status reported alongside the failure, if the transport had one.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Request { status, .. } => *status,
            _ => None,
        }
    }
}

/// Normalized result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Response(HttpResponse),
    TransportError {
        status_code: u16,
        status_message: String,
    },
}

impl Outcome {
    /// Synthesize a failure outcome from a transport error.
    pub fn from_transport_error(err: &TransportError) -> Self {
        let status_message = match err {
            TransportError::Body(_) => err.to_string(),
            _ => format!("{CONNECTION_PROBLEM}{err}"),
        };
        Outcome::TransportError {
            status_code: err.status().unwrap_or(SYNTHESIZED_STATUS),
            status_message,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Outcome::Response(response) => response.status_code,
            Outcome::TransportError { status_code, .. } => *status_code,
        }
    }

    pub fn is_transport_error(&self) -> bool {
        matches!(self, Outcome::TransportError { .. })
    }
}

/// Something that can deliver one request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestSpec) -> Result<HttpResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: &RequestSpec) -> Result<HttpResponse, TransportError> {
        (**self).send(request).await
    }
}

/// HTTP client settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: concat!("relayq/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl TransportConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Production transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn method(verb: HttpVerb) -> reqwest::Method {
    match verb {
        HttpVerb::Get => reqwest::Method::GET,
        HttpVerb::Post => reqwest::Method::POST,
        HttpVerb::Put => reqwest::Method::PUT,
        HttpVerb::Delete => reqwest::Method::DELETE,
    }
}

/// Display of an error followed by its source chain.
fn describe(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = StdError::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(describe(&err))
    } else if err.is_connect() {
        TransportError::Connect(describe(&err))
    } else if err.is_body() || err.is_decode() {
        TransportError::Body(describe(&err))
    } else {
        TransportError::Request {
            status: err.status().map(|s| s.as_u16()),
            message: describe(&err),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &RequestSpec) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.request(method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        let mut headers = ResponseHeaders::new();
        for (name, value) in response.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        let body = response.text().await.map_err(map_reqwest_error)?;

        Ok(HttpResponse {
            status_code: status.as_u16(),
            status_message: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}

/// Fans a batch out over a [`Transport`] with bounded concurrency.
#[derive(Debug)]
pub struct BatchDispatcher<T> {
    transport: Arc<T>,
    concurrency_limit: usize,
    deadline: Duration,
}

impl<T: Transport> BatchDispatcher<T> {
    pub fn new(transport: Arc<T>, concurrency_limit: usize) -> Self {
        Self {
            transport,
            concurrency_limit: concurrency_limit.max(1),
            deadline: Duration::from_secs(30),
        }
    }

    /// Upper bound on a single request, on top of the transport's own timeout.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Deliver every request and wait for all of them to settle.
    pub async fn dispatch(&self, requests: Vec<(Code, RequestSpec)>) -> BTreeMap<Code, Outcome> {
        let transport = &self.transport;
        let deadline = self.deadline;

        stream::iter(requests)
            .map(|(code, spec)| async move {
                debug!(job_code = %code, method = %spec.method, url = %spec.url, "dispatching callback");
                let result = match tokio::time::timeout(deadline, transport.send(&spec)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(format!(
                        "no response within {}ms",
                        deadline.as_millis()
                    ))),
                };
                let outcome = match result {
                    Ok(response) => Outcome::Response(response),
                    Err(err) => {
                        warn!(job_code = %code, url = %spec.url, error = %err, "callback transport failure");
                        Outcome::from_transport_error(&err)
                    }
                };
                (code, outcome)
            })
            .buffer_unordered(self.concurrency_limit)
            .collect()
            .await
    }
}
