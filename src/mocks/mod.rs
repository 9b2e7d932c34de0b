//! Mock transport for testing the executor without a network.

use crate::errors::TransportError;
use crate::quota::{HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER};
use crate::transport::Transport;
use crate::types::{HttpResponse, Method, RequestDescriptor};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// A mock response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Bytes,
    /// Headers.
    pub headers: HashMap<String, String>,
    /// Delay before responding.
    pub delay: Option<Duration>,
}

impl MockResponse {
    /// Creates a response with the given status and raw body.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: HashMap::new(),
            delay: None,
        }
    }

    /// Creates a successful response with the given JSON body.
    pub fn ok<T: Serialize>(body: &T) -> Self {
        Self::new(200, serde_json::to_vec(body).unwrap_or_default())
            .with_header("content-type", "application/json")
    }

    /// Creates a GitHub-style error response.
    pub fn error(status: u16, message: &str) -> Self {
        let body = serde_json::json!({
            "message": message,
            "documentation_url": "https://docs.github.com/rest"
        });
        Self::new(status, body.to_string())
    }

    /// Creates an empty 304 Not Modified response.
    pub fn not_modified() -> Self {
        Self::new(304, Bytes::new())
    }

    /// Creates a 404 Not Found response.
    pub fn not_found() -> Self {
        Self::error(404, "Not Found")
    }

    /// Creates a 401 Unauthorized response.
    pub fn unauthorized() -> Self {
        Self::error(401, "Bad credentials")
    }

    /// Creates a 429 response carrying `retry-after`.
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::error(429, "Too Many Requests")
            .with_header(HEADER_RETRY_AFTER, &retry_after_secs.to_string())
    }

    /// Creates a 403 secondary rate limit response.
    pub fn secondary_rate_limited(retry_after_secs: u64) -> Self {
        Self::error(403, "You have exceeded a secondary rate limit")
            .with_header(HEADER_RETRY_AFTER, &retry_after_secs.to_string())
    }

    /// Creates a 5xx response.
    pub fn server_error(status: u16) -> Self {
        Self::error(status, "Server Error")
    }

    /// Adds a delay to the response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Adds a header to the response.
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    /// Adds rate limit headers.
    pub fn with_rate_limit(self, limit: u32, remaining: u32, reset_timestamp: i64) -> Self {
        self.with_header(HEADER_LIMIT, &limit.to_string())
            .with_header(HEADER_REMAINING, &remaining.to_string())
            .with_header(HEADER_RESET, &reset_timestamp.to_string())
    }
}

/// What the mock does for one call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Return a response.
    Respond(MockResponse),
    /// Fail without a response.
    Fail(TransportError),
}

impl From<MockResponse> for MockOutcome {
    fn from(response: MockResponse) -> Self {
        Self::Respond(response)
    }
}

impl From<TransportError> for MockOutcome {
    fn from(error: TransportError) -> Self {
        Self::Fail(error)
    }
}

/// A recorded mock request.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: Method,
    /// Request URL.
    pub url: String,
    /// Query parameters.
    pub params: Vec<(String, String)>,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Time the call was made.
    pub at: tokio::time::Instant,
}

/// Transport that replays scripted outcomes in order.
///
/// Once the queue is empty the default outcome is used, or a 500 if none
/// was set.
#[derive(Debug, Default)]
pub struct MockTransport {
    outcomes: Mutex<VecDeque<MockOutcome>>,
    default_outcome: Option<MockOutcome>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mock that replays `outcomes` in order.
    pub fn with_outcomes<I, O>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: Into<MockOutcome>,
    {
        let mock = Self::new();
        for outcome in outcomes {
            mock.enqueue(outcome);
        }
        mock
    }

    /// Adds an outcome to the queue.
    pub fn enqueue(&self, outcome: impl Into<MockOutcome>) {
        self.outcomes.lock().push_back(outcome.into());
    }

    /// Sets the outcome used once the queue is empty.
    pub fn set_default(mut self, outcome: impl Into<MockOutcome>) -> Self {
        self.default_outcome = Some(outcome.into());
        self
    }

    /// Gets all recorded requests.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Returns the number of transport calls made.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Clears recorded requests.
    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    fn next_outcome(&self) -> MockOutcome {
        self.outcomes
            .lock()
            .pop_front()
            .or_else(|| self.default_outcome.clone())
            .unwrap_or_else(|| MockResponse::error(500, "No mock response configured").into())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(RecordedRequest {
            method: request.method,
            url: request.url.clone(),
            params: request.params.clone(),
            headers: request.headers.clone(),
            at: tokio::time::Instant::now(),
        });

        match self.next_outcome() {
            MockOutcome::Respond(response) => {
                if let Some(delay) = response.delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(HttpResponse::new(response.status, response.headers, response.body))
            }
            MockOutcome::Fail(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_in_order_then_default() {
        let mock = MockTransport::with_outcomes([
            MockResponse::rate_limited(2),
            MockResponse::ok(&serde_json::json!({"id": 1})),
        ])
        .set_default(MockResponse::not_found());

        let request = RequestDescriptor::get("https://api.github.com/repos/octo/hello");

        assert_eq!(mock.send(&request).await.unwrap().status, 429);
        assert_eq!(mock.send(&request).await.unwrap().status, 200);
        assert_eq!(mock.send(&request).await.unwrap().status, 404);
        assert_eq!(mock.request_count(), 3);
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let mock = MockTransport::new();
        mock.enqueue(TransportError::Connect("refused".into()));

        let request = RequestDescriptor::get("https://api.github.com/");
        assert!(matches!(
            mock.send(&request).await,
            Err(TransportError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn test_unscripted_call_returns_500() {
        let mock = MockTransport::new();
        let request = RequestDescriptor::get("https://api.github.com/");
        assert_eq!(mock.send(&request).await.unwrap().status, 500);
    }

    #[test]
    fn test_rate_limit_headers() {
        let response = MockResponse::ok(&()).with_rate_limit(5000, 42, 1_700_000_000);
        assert_eq!(response.headers[HEADER_REMAINING], "42");
        assert_eq!(response.headers[HEADER_RESET], "1700000000");
    }
}
