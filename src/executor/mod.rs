//! Request executor.
//!
//! Every outgoing call goes through [`RequestExecutor::execute`], which
//! consults the response cache, the endpoint's circuit breaker and the quota
//! tracker before handing the request to the transport, then classifies and
//! retries failures according to the retry policy table.

mod error_log;

pub use error_log::{ErrorLog, ErrorSummary, TOP_ENDPOINTS};

use crate::cache::ResponseCache;
use crate::config::{HarvesterConfig, TransportConfig};
use crate::errors::{ConfigError, ErrorContext, ErrorKind, ExecutorError, ExecutorResult};
use crate::observability::{AttemptTimer, Metrics, MetricsSnapshot, TracingHooks};
use crate::quota::{QuotaSnapshot, QuotaTracker, RateLimitHeaders};
use crate::resilience::{
    CircuitBreakerRegistry, CircuitState, ErrorClassifier, FailureSignal, RetryPolicyTable,
};
use crate::transport::{ReqwestTransport, Transport};
use crate::types::{HttpResponse, RequestDescriptor};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

/// Longest response body kept as an error message.
const MAX_ERROR_MESSAGE_LEN: usize = 512;

/// Per-call options for [`RequestExecutor::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Cache key; responses are only cached when set.
    pub cache_key: Option<String>,
    /// TTL override for the cached response.
    pub ttl: Option<Duration>,
    /// Token that aborts waits and transport calls.
    pub cancel: Option<CancellationToken>,
    /// Point in time after which the request is abandoned.
    pub deadline: Option<Instant>,
}

impl ExecuteOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache key.
    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Sets the cache TTL override.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the cancellation token.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Sets an absolute deadline.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets a deadline relative to now; a timeout too large to represent
    /// leaves the request without a deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }
}

/// Point-in-time view of the executor.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestStats {
    /// Quota counters.
    pub quota: QuotaSnapshot,
    /// Entries in the response cache.
    pub cache_size: usize,
    /// Endpoints whose circuit is open or half-open.
    pub circuit_open_endpoints: Vec<String>,
    /// Request counters.
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Cancelled,
    Deadline,
}

/// Executes requests with caching, quota pacing, circuit breaking and
/// retries.
///
/// One executor is meant to be shared (through `Arc`) by every task talking
/// to the same API host.
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    cache: Arc<ResponseCache>,
    quota: QuotaTracker,
    circuits: CircuitBreakerRegistry,
    classifier: ErrorClassifier,
    retry: RetryPolicyTable,
    errors: ErrorLog,
    metrics: Arc<Metrics>,
    request_timeout: Duration,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("quota", &self.quota)
            .field("circuits", &self.circuits)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl RequestExecutor {
    /// Creates an executor over `transport`.
    pub fn new(config: HarvesterConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            transport,
            cache: Arc::new(ResponseCache::new(config.cache_ttl)),
            quota: QuotaTracker::new(config.hourly_budget, config.initial_primary_limit),
            circuits: CircuitBreakerRegistry::new(config.circuit_breaker),
            classifier: ErrorClassifier::new(),
            retry: config.retry,
            errors: ErrorLog::new(config.error_log_capacity),
            metrics: Arc::new(Metrics::new()),
            request_timeout: config.request_timeout,
        })
    }

    /// Creates an executor with the default reqwest transport.
    pub fn with_reqwest(
        config: HarvesterConfig,
        transport: TransportConfig,
    ) -> Result<Self, ConfigError> {
        let transport = ReqwestTransport::new(transport)?;
        Self::new(config, Arc::new(transport))
    }

    /// Shares an existing cache instead of the executor's own.
    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Replaces the error classifier.
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Gets the response cache.
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Gets the quota tracker.
    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    /// Gets the circuit breakers.
    pub fn circuits(&self) -> &CircuitBreakerRegistry {
        &self.circuits
    }

    /// Gets the metrics collector.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Executes a request.
    ///
    /// Returns the first 2xx response, or a 304 answering a conditional
    /// request (never cached). Other responses and transport
    /// failures are classified, logged and retried while the policy for
    /// their kind allows; the last failure is returned as
    /// [`ExecutorError::Exhausted`].
    #[instrument(
        skip_all,
        fields(
            request_id = %Uuid::new_v4(),
            method = %request.method,
            endpoint = %request.endpoint(),
        )
    )]
    pub async fn execute(
        &self,
        request: &RequestDescriptor,
        options: ExecuteOptions,
    ) -> ExecutorResult<HttpResponse> {
        self.metrics.record_request();
        let endpoint = request.endpoint().into_owned();

        if let Some(key) = &options.cache_key {
            if let Some(hit) = self.cache.get(key) {
                self.metrics.record_cache_hit();
                self.metrics.record_success();
                TracingHooks::on_cache_hit(&endpoint, key);
                return Ok(hit);
            }
            self.metrics.record_cache_miss();
        }

        let method = request.method.as_str();
        let mut attempt: u32 = 0;

        loop {
            if self.circuits.check(&endpoint).is_err() {
                return Err(self.circuit_rejected(endpoint));
            }

            // The trial slot is only taken once quota is in hand.
            self.acquire_quota(&endpoint, &options, attempt).await?;
            let permit = match self.circuits.try_acquire(&endpoint) {
                Ok(permit) => permit,
                Err(_) => return Err(self.circuit_rejected(endpoint)),
            };

            TracingHooks::on_attempt_start(method, &endpoint, attempt);
            if attempt == 0 {
                TracingHooks::on_request_headers(&request.headers);
            }
            let timer = AttemptTimer::start(Arc::clone(&self.metrics));
            let sent = self
                .suspend(
                    tokio::time::timeout(self.request_timeout, self.transport.send(request)),
                    &options,
                )
                .await
                .map_err(|i| self.interrupted(i, &endpoint, attempt + 1))?;
            let elapsed = timer.finish();

            let context = match sent {
                Ok(Ok(response)) => {
                    self.quota.update_from_response(&response.headers);
                    TracingHooks::on_attempt_complete(method, &endpoint, response.status, elapsed);

                    if response.is_success() || response.is_not_modified() {
                        self.circuits.on_success(&endpoint);
                        drop(permit);
                        match &options.cache_key {
                            Some(key) if response.is_success() => {
                                let ttl = options.ttl.unwrap_or_else(|| self.cache.default_ttl());
                                self.cache.put(key.as_str(), response.clone(), ttl);
                            }
                            _ => {}
                        }
                        self.metrics.record_success();
                        return Ok(response);
                    }

                    self.response_context(&endpoint, &response)
                }
                Ok(Err(error)) => {
                    let kind = self.classifier.classify_signal(&FailureSignal::transport(&error));
                    ErrorContext::new(kind, &endpoint, error.to_string())
                }
                Err(_) => ErrorContext::new(
                    ErrorKind::Timeout,
                    &endpoint,
                    format!("request timed out after {:?}", self.request_timeout),
                ),
            }
            .with_attempt(attempt);

            self.errors.record(context.clone());
            self.circuits.on_failure(&endpoint);
            drop(permit);

            let circuit_opened = self.circuits.state(&endpoint) == CircuitState::Open;
            if circuit_opened || !self.retry.should_retry(context.kind, attempt) {
                self.metrics.record_failure();
                TracingHooks::on_exhausted(
                    &endpoint,
                    &context.kind.to_string(),
                    context.attempts(),
                    &context.message,
                );
                return Err(ExecutorError::Exhausted(context));
            }

            let delay = self
                .retry
                .compute_delay(context.kind, attempt, context.retry_after);
            self.metrics.record_retry();
            TracingHooks::on_retry(&endpoint, &context.kind.to_string(), attempt + 1, delay);

            self.suspend(tokio::time::sleep(delay), &options)
                .await
                .map_err(|i| self.interrupted(i, &endpoint, attempt + 1))?;

            attempt += 1;
        }
    }

    /// Executes a request, caching the response under its own cache key.
    pub async fn execute_cached(&self, request: &RequestDescriptor) -> ExecutorResult<HttpResponse> {
        let options = ExecuteOptions::new().cache_key(request.cache_key());
        self.execute(request, options).await
    }

    /// Gets a point-in-time view of quota, cache, circuits and counters.
    pub fn get_stats(&self) -> HarvestStats {
        HarvestStats {
            quota: self.quota.snapshot(),
            cache_size: self.cache.len(),
            circuit_open_endpoints: self.circuits.open_endpoints(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Exports [`get_stats`](Self::get_stats) as pretty-printed JSON.
    pub fn stats_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.get_stats())
    }

    /// Summarizes failures recorded within the last `window`.
    pub fn error_summary(&self, window: Duration) -> ErrorSummary {
        self.errors.summary(window)
    }

    /// Forces the circuit of `endpoint` closed.
    pub fn reset_circuit(&self, endpoint: &str) {
        self.circuits.reset(endpoint);
    }

    async fn acquire_quota(
        &self,
        endpoint: &str,
        options: &ExecuteOptions,
        attempts: u32,
    ) -> ExecutorResult<()> {
        while let Err(wait) = self.quota.try_reserve() {
            self.metrics.record_quota_wait();
            TracingHooks::on_quota_wait(endpoint, wait);
            self.suspend(tokio::time::sleep(wait), options)
                .await
                .map_err(|i| self.interrupted(i, endpoint, attempts))?;
        }
        Ok(())
    }

    async fn suspend<F: Future>(
        &self,
        future: F,
        options: &ExecuteOptions,
    ) -> Result<F::Output, Interrupt> {
        let cancelled = async {
            match &options.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match options.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(Interrupt::Cancelled),
            _ = deadline => Err(Interrupt::Deadline),
            output = future => Ok(output),
        }
    }

    fn circuit_rejected(&self, endpoint: String) -> ExecutorError {
        self.metrics.record_circuit_rejection();
        self.metrics.record_failure();
        TracingHooks::on_circuit_rejected(&endpoint);
        ExecutorError::CircuitOpen { endpoint }
    }

    fn interrupted(&self, interrupt: Interrupt, endpoint: &str, attempts: u32) -> ExecutorError {
        self.metrics.record_cancelled();
        self.metrics.record_failure();
        let endpoint = endpoint.to_string();
        match interrupt {
            Interrupt::Cancelled => {
                TracingHooks::on_cancelled(&endpoint, attempts, false);
                ExecutorError::Cancelled { endpoint, attempts }
            }
            Interrupt::Deadline => {
                TracingHooks::on_cancelled(&endpoint, attempts, true);
                ExecutorError::DeadlineExceeded { endpoint, attempts }
            }
        }
    }

    fn response_context(&self, endpoint: &str, response: &HttpResponse) -> ErrorContext {
        let message = error_message(response);
        let kind = self
            .classifier
            .classify_signal(&FailureSignal::response(response.status, &message));
        let retry_after = RateLimitHeaders::parse(&response.headers).retry_after;

        ErrorContext::new(kind, endpoint, message)
            .with_status(response.status)
            .with_retry_after(retry_after)
    }
}

/// The `message` field of a GitHub error body, else the body text.
fn error_message(response: &HttpResponse) -> String {
    let message = serde_json::from_slice::<serde_json::Value>(&response.body)
        .ok()
        .and_then(|body| body.get("message")?.as_str().map(str::to_string))
        .unwrap_or_else(|| response.text().into_owned());

    match message.char_indices().nth(MAX_ERROR_MESSAGE_LEN) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockResponse, MockTransport};

    fn executor(mock: Arc<MockTransport>) -> RequestExecutor {
        RequestExecutor::new(HarvesterConfig::default(), mock).unwrap()
    }

    #[test]
    fn test_error_message_prefers_json_message() {
        let response = HttpResponse::new(
            404,
            Vec::<(String, String)>::new(),
            r#"{"message":"Not Found","documentation_url":"https://docs.github.com"}"#,
        );
        assert_eq!(error_message(&response), "Not Found");

        let plain = HttpResponse::new(502, Vec::<(String, String)>::new(), "Bad Gateway");
        assert_eq!(error_message(&plain), "Bad Gateway");
    }

    #[test]
    fn test_error_message_truncated() {
        let long = "x".repeat(MAX_ERROR_MESSAGE_LEN * 2);
        let response = HttpResponse::new(500, Vec::<(String, String)>::new(), long);
        assert_eq!(error_message(&response).len(), MAX_ERROR_MESSAGE_LEN);
    }

    #[tokio::test]
    async fn test_success_updates_quota() {
        let reset = chrono::Utc::now().timestamp() + 3600;
        let mock = Arc::new(MockTransport::with_outcomes([
            MockResponse::ok(&serde_json::json!({"id": 1})).with_rate_limit(5000, 4321, reset),
        ]));
        let executor = executor(Arc::clone(&mock));

        let request = RequestDescriptor::get("https://api.github.com/repos/octo/hello");
        let response = executor.execute(&request, ExecuteOptions::new()).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(executor.quota().state().primary_remaining, 4321);
        assert_eq!(executor.get_stats().metrics.transport_attempts, 1);
    }

    #[tokio::test]
    async fn test_stats_json() {
        let mock = Arc::new(MockTransport::new());
        let executor = executor(mock);

        let json: serde_json::Value =
            serde_json::from_str(&executor.stats_json().unwrap()).unwrap();
        assert_eq!(json["cache_size"], 0);
        assert_eq!(json["quota"]["hourly_budget"], 4500);
        assert!(json["circuit_open_endpoints"].as_array().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_timeout_is_classified() {
        let mock = Arc::new(MockTransport::with_outcomes([
            MockResponse::ok(&()).with_delay(Duration::from_secs(120)),
        ]));
        let config = HarvesterConfig::builder()
            .request_timeout(Duration::from_secs(5))
            .no_retry()
            .build()
            .unwrap();
        let executor = RequestExecutor::new(config, mock).unwrap();

        let request = RequestDescriptor::get("https://api.github.com/slow");
        let err = executor.execute(&request, ExecuteOptions::new()).await.unwrap_err();

        assert_eq!(err.kind(), Some(ErrorKind::Timeout));
        assert_eq!(err.attempts(), 1);
    }
}
