//! Per-kind retry policies with exponential backoff.

use crate::errors::{ConfigError, ErrorKind};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Upper bound of the jitter added to a backoff, as a fraction of it.
pub const MAX_JITTER_FRACTION: f64 = 0.1;

/// Floor applied to server-supplied retry hints.
pub const MIN_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Retry behaviour for one error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling on computed delays.
    pub max_delay: Duration,
    /// Whether to add up to 10% random jitter.
    pub jitter: bool,
    /// Whether a server `retry-after` hint replaces the computed delay.
    pub honor_retry_after: bool,
}

impl RetryPolicy {
    /// Creates a policy with jitter on and retry hints honored.
    pub const fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: true,
            honor_retry_after: true,
        }
    }

    /// A policy that never retries.
    pub const fn never() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
            honor_retry_after: false,
        }
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Enable or disable honoring `retry-after`
    pub fn with_retry_after(mut self, honor: bool) -> Self {
        self.honor_retry_after = honor;
        self
    }

    /// Exponential backoff for `attempt` without jitter:
    /// `min(base_delay * 2^attempt, max_delay)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Retry policies indexed by [`ErrorKind`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicyTable {
    policies: HashMap<ErrorKind, RetryPolicy>,
}

impl RetryPolicyTable {
    /// Gets the policy for `kind`.
    pub fn get(&self, kind: ErrorKind) -> RetryPolicy {
        self.policies
            .get(&kind)
            .copied()
            .unwrap_or_else(RetryPolicy::never)
    }

    /// Replaces the policy for `kind`.
    ///
    /// Kinds that are never retried keep `max_retries = 0` whatever the
    /// override says.
    pub fn set(&mut self, kind: ErrorKind, mut policy: RetryPolicy) -> &mut Self {
        if !kind.is_retryable() && policy.max_retries > 0 {
            tracing::warn!(
                kind = %kind,
                requested = policy.max_retries,
                "Ignoring retry override for non-retryable error kind"
            );
            policy.max_retries = 0;
        }
        self.policies.insert(kind, policy);
        self
    }

    /// Builder-style [`set`](Self::set).
    pub fn with_override(mut self, kind: ErrorKind, policy: RetryPolicy) -> Self {
        self.set(kind, policy);
        self
    }

    /// Returns true if a failure of `kind` at zero-based `attempt` may be
    /// retried.
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool {
        kind.is_retryable() && attempt < self.get(kind).max_retries
    }

    /// Delay before retrying a failure of `kind` at zero-based `attempt`.
    ///
    /// An honored `retry_after` hint wins (floored at one second). Otherwise
    /// the exponential backoff plus optional jitter, never above
    /// `max_delay`.
    pub fn compute_delay(
        &self,
        kind: ErrorKind,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> Duration {
        let policy = self.get(kind);

        if policy.honor_retry_after {
            if let Some(hint) = retry_after {
                return hint.max(MIN_RETRY_AFTER);
            }
        }

        let backoff = policy.backoff(attempt);
        if !policy.jitter || backoff.is_zero() {
            return backoff;
        }

        let fraction = rand::thread_rng().gen_range(0.0..=MAX_JITTER_FRACTION);
        (backoff + backoff.mul_f64(fraction)).min(policy.max_delay)
    }

    /// Checks every policy for a usable delay range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (kind, policy) in &self.policies {
            if policy.base_delay > policy.max_delay {
                return Err(ConfigError::Invalid(format!(
                    "retry policy for {}: base_delay exceeds max_delay",
                    kind
                )));
            }
        }
        Ok(())
    }
}

impl Default for RetryPolicyTable {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            ErrorKind::RateLimited,
            RetryPolicy::new(5, Duration::from_secs(5), Duration::from_secs(300)),
        );
        policies.insert(
            ErrorKind::ServerError,
            RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(30)),
        );
        policies.insert(
            ErrorKind::NetworkError,
            RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(30))
                .with_retry_after(false),
        );
        policies.insert(
            ErrorKind::Timeout,
            RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(60))
                .with_retry_after(false),
        );
        // A daily or secondary cap, not a per-request limit: back off for hours.
        policies.insert(
            ErrorKind::QuotaExceeded,
            RetryPolicy::new(2, Duration::from_secs(60 * 60), Duration::from_secs(4 * 60 * 60))
                .with_jitter(false),
        );
        policies.insert(
            ErrorKind::Unknown,
            RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(10))
                .with_retry_after(false),
        );
        for kind in [
            ErrorKind::Authentication,
            ErrorKind::Authorization,
            ErrorKind::NotFound,
            ErrorKind::Validation,
        ] {
            policies.insert(kind, RetryPolicy::never());
        }
        Self { policies }
    }
}
