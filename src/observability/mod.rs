//! Observability module providing metrics and tracing hooks.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Metrics collector for harvesting operations.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Calls to execute.
    requests_total: AtomicU64,
    /// Transport calls made.
    transport_attempts: AtomicU64,
    /// Requests that returned a response.
    requests_success: AtomicU64,
    /// Requests that returned an error.
    requests_failed: AtomicU64,
    /// Retries scheduled.
    requests_retried: AtomicU64,
    /// Requests served from cache.
    cache_hits: AtomicU64,
    /// Cache lookups that missed.
    cache_misses: AtomicU64,
    /// Times a request waited on quota.
    quota_waits: AtomicU64,
    /// Requests rejected by an open circuit.
    circuit_rejections: AtomicU64,
    /// Requests cancelled or past their deadline.
    requests_cancelled: AtomicU64,
    /// Total transport latency in microseconds.
    latency_total_us: AtomicU64,
    /// Transport call count for latency calculation.
    latency_count: AtomicU64,
}

impl Metrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a call to execute.
    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful request.
    pub fn record_success(&self) {
        self.requests_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed request.
    pub fn record_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a scheduled retry.
    pub fn record_retry(&self) {
        self.requests_retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a cache hit.
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a cache miss.
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a quota wait.
    pub fn record_quota_wait(&self) {
        self.quota_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a circuit rejection.
    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a cancelled request.
    pub fn record_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one transport call and its latency.
    pub fn record_attempt(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.transport_attempts.fetch_add(1, Ordering::Relaxed);
        self.latency_total_us.fetch_add(us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Gets the total request count.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Gets the transport call count.
    pub fn transport_attempts(&self) -> u64 {
        self.transport_attempts.load(Ordering::Relaxed)
    }

    /// Gets the cache hit count.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Gets the retry count.
    pub fn retried_requests(&self) -> u64 {
        self.requests_retried.load(Ordering::Relaxed)
    }

    /// Gets the average transport latency in microseconds.
    pub fn average_latency_us(&self) -> u64 {
        let total = self.latency_total_us.load(Ordering::Relaxed);
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            0
        } else {
            total / count
        }
    }

    /// Gets a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.total_requests(),
            transport_attempts: self.transport_attempts(),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_retried: self.retried_requests(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            quota_waits: self.quota_waits.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            average_latency_us: self.average_latency_us(),
        }
    }

    /// Resets all metrics.
    pub fn reset(&self) {
        for counter in [
            &self.requests_total,
            &self.transport_attempts,
            &self.requests_success,
            &self.requests_failed,
            &self.requests_retried,
            &self.cache_hits,
            &self.cache_misses,
            &self.quota_waits,
            &self.circuit_rejections,
            &self.requests_cancelled,
            &self.latency_total_us,
            &self.latency_count,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Calls to execute.
    pub requests_total: u64,
    /// Transport calls made.
    pub transport_attempts: u64,
    /// Successful requests.
    pub requests_success: u64,
    /// Failed requests.
    pub requests_failed: u64,
    /// Retries scheduled.
    pub requests_retried: u64,
    /// Cache hits.
    pub cache_hits: u64,
    /// Cache misses.
    pub cache_misses: u64,
    /// Quota waits.
    pub quota_waits: u64,
    /// Circuit rejections.
    pub circuit_rejections: u64,
    /// Cancelled requests.
    pub requests_cancelled: u64,
    /// Average transport latency in microseconds.
    pub average_latency_us: u64,
}

/// Timer for one transport call.
pub struct AttemptTimer {
    start: Instant,
    metrics: Arc<Metrics>,
}

impl AttemptTimer {
    /// Starts timing a transport call.
    pub fn start(metrics: Arc<Metrics>) -> Self {
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    /// Records the call and returns its duration.
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        self.metrics.record_attempt(elapsed);
        elapsed
    }
}

/// Tracing hooks for the request executor.
pub struct TracingHooks;

impl TracingHooks {
    /// Logs the start of a transport attempt.
    pub fn on_attempt_start(method: &str, endpoint: &str, attempt: u32) {
        debug!(
            method = %method,
            endpoint = %endpoint,
            attempt = attempt,
            "GitHub API request started"
        );
    }

    /// Logs a completed transport attempt.
    pub fn on_attempt_complete(method: &str, endpoint: &str, status: u16, duration: Duration) {
        debug!(
            method = %method,
            endpoint = %endpoint,
            status = status,
            duration_ms = duration.as_millis() as u64,
            "GitHub API request completed"
        );
    }

    /// Logs a cache hit.
    pub fn on_cache_hit(endpoint: &str, key: &str) {
        debug!(endpoint = %endpoint, key = %key, "Served from cache");
    }

    /// Logs a retry.
    pub fn on_retry(endpoint: &str, kind: &str, attempt: u32, delay: Duration) {
        warn!(
            endpoint = %endpoint,
            kind = %kind,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "Retrying GitHub API request"
        );
    }

    /// Logs a quota wait.
    pub fn on_quota_wait(endpoint: &str, wait: Duration) {
        warn!(
            endpoint = %endpoint,
            wait_ms = wait.as_millis() as u64,
            "Waiting for rate limit quota"
        );
    }

    /// Logs a circuit rejection.
    pub fn on_circuit_rejected(endpoint: &str) {
        warn!(endpoint = %endpoint, "Circuit open, request rejected");
    }

    /// Logs a request that gave up.
    pub fn on_exhausted(endpoint: &str, kind: &str, attempts: u32, message: &str) {
        error!(
            endpoint = %endpoint,
            kind = %kind,
            attempts = attempts,
            error = %message,
            "GitHub API request failed"
        );
    }

    /// Logs a cancelled request.
    pub fn on_cancelled(endpoint: &str, attempts: u32, deadline: bool) {
        info!(
            endpoint = %endpoint,
            attempts = attempts,
            deadline = deadline,
            "GitHub API request cancelled"
        );
    }

    /// Logs outgoing request headers with sensitive values redacted.
    pub fn on_request_headers<'a>(headers: impl IntoIterator<Item = (&'a String, &'a String)>) {
        for (name, value) in headers {
            debug!(header = %name, value = %redact_header(name, value), "Request header");
        }
    }
}

/// Sensitive headers that should be redacted in logs.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "x-github-token",
    "x-access-token",
    "cookie",
    "set-cookie",
];

/// Redacts sensitive values in headers.
pub fn redact_header(name: &str, value: &str) -> String {
    if SENSITIVE_HEADERS.contains(&name.to_lowercase().as_str()) {
        "[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let metrics = Metrics::new();

        metrics.record_request();
        metrics.record_success();
        metrics.record_attempt(Duration::from_millis(100));

        assert_eq!(metrics.total_requests(), 1);
        assert_eq!(metrics.transport_attempts(), 1);
        assert!(metrics.average_latency_us() >= 100_000);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.record_request();
        metrics.record_request();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.requests_failed, 1);

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_redact_header() {
        assert_eq!(redact_header("Authorization", "Bearer token"), "[REDACTED]");
        assert_eq!(redact_header("Content-Type", "application/json"), "application/json");
    }
}
