use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use squall_instruments::Tags;

/// A request for the transport to deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub body: Option<String>,
    /// Groups requests in the metrics. Defaults to the target when not set.
    pub name: Option<String>,
    /// Extra tags recorded on every sample for this request
    pub tags: Tags,
}

impl Request {
    pub fn new(method: &str, target: &str) -> Self {
        Self {
            method: method.to_string(),
            target: target.to_string(),
            body: None,
            name: None,
            tags: Tags::new(),
        }
    }

    pub fn get(target: &str) -> Self {
        Self::new("GET", target)
    }

    pub fn post(target: &str, body: impl Into<String>) -> Self {
        Self::new("POST", target).with_body(body)
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.target)
    }
}

/// What came back for a request.
///
/// A request that never got a response has status 0 and `error` set.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub duration: Duration,
    pub body: String,
    pub error: Option<String>,
}

impl Response {
    pub fn new(status: u16, duration: Duration) -> Self {
        Self {
            status,
            duration,
            body: String::new(),
            error: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: 0,
            duration,
            body: String::new(),
            error: Some(error.into()),
        }
    }

    /// A response counts as failed when there was no response at all or the status is outside
    /// `200..400`.
    pub fn is_failed(&self) -> bool {
        self.error.is_some() || !(200..400).contains(&self.status)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("No transport configured")]
    NotConfigured,
    #[error("{0}")]
    Other(String),
}

/// The client that actually issues requests against the system under test.
///
/// The runner never does any I/O itself. It hands each [Request] to the transport and records
/// metrics from the returned [Response]. An `Err` is recorded as a request with no response.
#[async_trait]
pub trait Transport: Debug + Send + Sync {
    async fn request(&self, request: &Request) -> Result<Response, TransportError>;
}

/// Used when a test definition doesn't provide a transport. Every request fails.
#[derive(Debug, Default)]
pub struct UnconfiguredTransport;

#[async_trait]
impl Transport for UnconfiguredTransport {
    async fn request(&self, _request: &Request) -> Result<Response, TransportError> {
        Err(TransportError::NotConfigured)
    }
}
