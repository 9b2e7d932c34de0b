//! Configuration types for the executor and its default transport.

use crate::cache::DEFAULT_CACHE_TTL;
use crate::errors::{ConfigError, ErrorKind};
use crate::quota::{DEFAULT_HOURLY_BUDGET, DEFAULT_PRIMARY_LIMIT};
use crate::resilience::{CircuitBreakerConfig, RetryPolicy, RetryPolicyTable};
use secrecy::SecretString;
use std::time::Duration;

/// Default GitHub API version (date-based).
pub const DEFAULT_API_VERSION: &str = "2022-11-28";

/// Default timeout of one transport call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default User-Agent header.
pub const DEFAULT_USER_AGENT: &str = "integrations-github-harvest/0.1.0";

/// Default number of failures kept for error summaries.
pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 1024;

/// Executor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HarvesterConfig {
    /// Local ceiling on calls per rolling hour.
    pub hourly_budget: u32,
    /// Primary limit assumed until the server reports one.
    pub initial_primary_limit: u32,
    /// Default TTL of cached responses.
    pub cache_ttl: Duration,
    /// Timeout of one transport call.
    pub request_timeout: Duration,
    /// Retry policies per error kind.
    pub retry: RetryPolicyTable,
    /// Circuit breaker configuration.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Failures kept for [`error_summary`](crate::RequestExecutor::error_summary).
    pub error_log_capacity: usize,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            hourly_budget: DEFAULT_HOURLY_BUDGET,
            initial_primary_limit: DEFAULT_PRIMARY_LIMIT,
            cache_ttl: DEFAULT_CACHE_TTL,
            request_timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicyTable::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            error_log_capacity: DEFAULT_ERROR_LOG_CAPACITY,
        }
    }
}

impl HarvesterConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> HarvesterConfigBuilder {
        HarvesterConfigBuilder::new()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hourly_budget == 0 {
            return Err(ConfigError::Invalid(
                "hourly_budget must be greater than zero".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "request_timeout must be greater than zero".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit failure_threshold must be greater than zero".into(),
            ));
        }
        if self.error_log_capacity == 0 {
            return Err(ConfigError::Invalid(
                "error_log_capacity must be greater than zero".into(),
            ));
        }
        self.retry.validate()
    }
}

/// Builder for HarvesterConfig.
#[derive(Debug, Default)]
pub struct HarvesterConfigBuilder {
    config: HarvesterConfig,
}

impl HarvesterConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the hourly call budget.
    pub fn hourly_budget(mut self, budget: u32) -> Self {
        self.config.hourly_budget = budget;
        self
    }

    /// Sets the primary limit assumed before the first response.
    pub fn initial_primary_limit(mut self, limit: u32) -> Self {
        self.config.initial_primary_limit = limit;
        self
    }

    /// Sets the default cache TTL.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    /// Sets the transport call timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Replaces the whole retry table.
    pub fn retry(mut self, table: RetryPolicyTable) -> Self {
        self.config.retry = table;
        self
    }

    /// Overrides the retry policy of one error kind.
    pub fn retry_policy(mut self, kind: ErrorKind, policy: RetryPolicy) -> Self {
        self.config.retry.set(kind, policy);
        self
    }

    /// Disables retries for every kind.
    pub fn no_retry(mut self) -> Self {
        for kind in ErrorKind::ALL {
            self.config.retry.set(kind, RetryPolicy::never());
        }
        self
    }

    /// Sets the circuit breaker configuration.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    /// Sets the failures that open a circuit.
    pub fn circuit_failure_threshold(mut self, threshold: u32) -> Self {
        self.config.circuit_breaker.failure_threshold = threshold;
        self
    }

    /// Sets how long an open circuit rejects calls.
    pub fn circuit_timeout(mut self, timeout: Duration) -> Self {
        self.config.circuit_breaker.open_timeout = timeout;
        self
    }

    /// Sets the trailing window in which failures are counted.
    pub fn circuit_failure_window(mut self, window: Duration) -> Self {
        self.config.circuit_breaker.failure_window = window;
        self
    }

    /// Sets how many failures are kept for error summaries.
    pub fn error_log_capacity(mut self, capacity: usize) -> Self {
        self.config.error_log_capacity = capacity;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Result<HarvesterConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum idle connections per host.
    pub max_idle_per_host: usize,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 20,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Configuration of the default reqwest transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// API version header.
    pub api_version: String,
    /// User-Agent header.
    pub user_agent: String,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Token passed through as a bearer credential.
    pub token: Option<SecretString>,
    /// Connection pool configuration.
    pub pool: PoolConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            token: None,
            pool: PoolConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Sets the bearer token.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(SecretString::new(token.into()));
        self
    }

    /// Sets the User-Agent header.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    /// Sets the API version header.
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_agent.is_empty() {
            return Err(ConfigError::Invalid(
                "User-Agent is required by GitHub API".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HarvesterConfig::default();
        assert_eq!(config.hourly_budget, DEFAULT_HOURLY_BUDGET);
        assert_eq!(config.cache_ttl, DEFAULT_CACHE_TTL);
        assert_eq!(config.request_timeout, DEFAULT_TIMEOUT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = HarvesterConfig::builder()
            .hourly_budget(1000)
            .cache_ttl(Duration::from_secs(60))
            .circuit_failure_threshold(8)
            .circuit_timeout(Duration::from_secs(120))
            .retry_policy(
                ErrorKind::ServerError,
                RetryPolicy::new(7, Duration::from_secs(1), Duration::from_secs(2)),
            )
            .build()
            .unwrap();

        assert_eq!(config.hourly_budget, 1000);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.circuit_breaker.failure_threshold, 8);
        assert_eq!(config.circuit_breaker.open_timeout, Duration::from_secs(120));
        assert_eq!(config.retry.get(ErrorKind::ServerError).max_retries, 7);
    }

    #[test]
    fn test_invalid_values() {
        assert!(HarvesterConfig::builder().hourly_budget(0).build().is_err());
        assert!(HarvesterConfig::builder()
            .circuit_failure_threshold(0)
            .build()
            .is_err());
        assert!(HarvesterConfig::builder()
            .request_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_no_retry() {
        let config = HarvesterConfig::builder().no_retry().build().unwrap();
        for kind in ErrorKind::ALL {
            assert!(!config.retry.should_retry(kind, 0));
        }
    }

    #[test]
    fn test_transport_config() {
        let config = TransportConfig::default().token("ghp_x").user_agent("");
        assert!(config.token.is_some());
        assert!(config.validate().is_err());
    }
}
