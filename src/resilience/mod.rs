//! Resilience patterns for the harvesting core.
//!
//! Provides error classification, per-kind retry policies and per-endpoint
//! circuit breakers.

pub mod circuit_breaker;
pub mod classifier;
pub mod retry;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitPermit, CircuitState};
pub use classifier::{classify, ClassificationRule, ErrorClassifier, FailureSignal, FailureSource};
pub use retry::{RetryPolicy, RetryPolicyTable, MAX_JITTER_FRACTION, MIN_RETRY_AFTER};
