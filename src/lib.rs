//! # GitHub Harvesting Core
//!
//! A resilient request layer for the GitHub REST API with:
//! - Quota tracking from `x-ratelimit-*` and `retry-after` headers
//! - Response caching keyed by a normalized request signature
//! - Error classification with per-kind retry policies
//! - Per-endpoint circuit breakers
//! - Cancellation and deadlines on every wait
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_github_harvest::{
//!     HarvesterConfig, RequestDescriptor, RequestExecutor, TransportConfig,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HarvesterConfig::builder()
//!         .hourly_budget(4000)
//!         .cache_ttl(Duration::from_secs(600))
//!         .build()?;
//!     let executor = RequestExecutor::with_reqwest(
//!         config,
//!         TransportConfig::default().token("ghp_xxxxxxxxxxxx"),
//!     )?;
//!
//!     let request = RequestDescriptor::get("https://api.github.com/repos/octocat/hello-world/issues")
//!         .param("state", "open");
//!     let response = executor.execute_cached(&request).await?;
//!     println!("{} {}", response.status, response.text());
//!
//!     println!("{}", executor.stats_json()?);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Shared state
pub mod cache;
pub mod quota;

// Resilience patterns
pub mod resilience;

// Transport and execution
pub mod executor;
pub mod transport;

// Observability
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use cache::{cache_key, ResponseCache};
pub use config::{HarvesterConfig, HarvesterConfigBuilder, TransportConfig};
pub use errors::{ConfigError, ErrorContext, ErrorKind, ExecutorError, ExecutorResult, TransportError};
pub use executor::{ErrorSummary, ExecuteOptions, HarvestStats, RequestExecutor};
pub use quota::{QuotaSnapshot, QuotaTracker};
pub use resilience::{
    classify, CircuitBreakerConfig, CircuitState, ErrorClassifier, RetryPolicy, RetryPolicyTable,
};
pub use transport::{ReqwestTransport, Transport};
pub use types::{HttpResponse, Method, RequestDescriptor};
pub use tokio_util::sync::CancellationToken;
