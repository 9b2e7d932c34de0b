//! Error types for the harvesting core.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for executor operations.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Closed set of failure classes a remote call can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Per-request or burst rate limit hit.
    RateLimited,
    /// Credentials missing or rejected (401).
    Authentication,
    /// Credentials valid but access denied (403).
    Authorization,
    /// Resource does not exist (404, 410).
    NotFound,
    /// Request rejected as malformed (400, 422).
    Validation,
    /// Server-side failure (5xx).
    ServerError,
    /// Connection-level failure before a response arrived.
    NetworkError,
    /// Transport call exceeded its timeout.
    Timeout,
    /// Daily or secondary cap exhausted.
    QuotaExceeded,
    /// Anything the classifier could not place.
    Unknown,
}

impl ErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::RateLimited,
        ErrorKind::Authentication,
        ErrorKind::Authorization,
        ErrorKind::NotFound,
        ErrorKind::Validation,
        ErrorKind::ServerError,
        ErrorKind::NetworkError,
        ErrorKind::Timeout,
        ErrorKind::QuotaExceeded,
        ErrorKind::Unknown,
    ];

    /// Returns true if a failure of this kind may succeed when repeated.
    ///
    /// Authentication, authorization, not-found and validation failures are
    /// deterministic: repeating the call cannot change the outcome.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::Authentication
                | ErrorKind::Authorization
                | ErrorKind::NotFound
                | ErrorKind::Validation
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Authentication => write!(f, "authentication"),
            Self::Authorization => write!(f, "authorization"),
            Self::NotFound => write!(f, "not_found"),
            Self::Validation => write!(f, "validation"),
            Self::ServerError => write!(f, "server_error"),
            Self::NetworkError => write!(f, "network_error"),
            Self::Timeout => write!(f, "timeout"),
            Self::QuotaExceeded => write!(f, "quota_exceeded"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Details of one failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorContext {
    /// Classified failure kind.
    pub kind: ErrorKind,
    /// Underlying message (response body or transport error text).
    pub message: String,
    /// HTTP status code, when a response was received.
    pub status_code: Option<u16>,
    /// Server-supplied retry hint.
    pub retry_after: Option<Duration>,
    /// Logical endpoint the request targeted.
    pub endpoint: String,
    /// Zero-based attempt index that produced this failure.
    pub attempt: u32,
}

impl ErrorContext {
    /// Creates a context for the given kind and endpoint.
    pub fn new(kind: ErrorKind, endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            retry_after: None,
            endpoint: endpoint.into(),
            attempt: 0,
        }
    }

    /// Sets the HTTP status code.
    pub fn with_status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    /// Sets the retry-after hint.
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Sets the attempt index.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Number of transport attempts made up to and including this failure.
    pub fn attempts(&self) -> u32 {
        self.attempt + 1
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(code) = self.status_code {
            write!(f, " (HTTP {})", code)?;
        }
        Ok(())
    }
}

/// Error returned by [`RequestExecutor::execute`](crate::RequestExecutor::execute).
///
/// Every variant reports an endpoint, an attempt count and a message. Only
/// [`Exhausted`](Self::Exhausted) has a classified [`ErrorKind`]; the other
/// variants end the request without a response to classify.
#[derive(Error, Debug, Clone)]
pub enum ExecutorError {
    /// The endpoint's circuit is open; no transport call was made.
    #[error("circuit open for endpoint {endpoint}")]
    CircuitOpen {
        /// Endpoint key whose circuit rejected the call.
        endpoint: String,
    },

    /// The request failed and no retries remain (or its kind is never retried).
    #[error("request to {} failed after {} attempt(s): {}", .0.endpoint, .0.attempts(), .0)]
    Exhausted(ErrorContext),

    /// The caller's cancellation token fired during a wait or transport call.
    #[error("request to {endpoint} cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// Endpoint key.
        endpoint: String,
        /// Transport attempts started before cancellation.
        attempts: u32,
    },

    /// The caller's deadline passed during a wait or transport call.
    #[error("request to {endpoint} exceeded its deadline after {attempts} attempt(s)")]
    DeadlineExceeded {
        /// Endpoint key.
        endpoint: String,
        /// Transport attempts started before the deadline.
        attempts: u32,
    },
}

impl ExecutorError {
    /// Gets the endpoint the failed request targeted.
    pub fn endpoint(&self) -> &str {
        match self {
            Self::CircuitOpen { endpoint }
            | Self::Cancelled { endpoint, .. }
            | Self::DeadlineExceeded { endpoint, .. } => endpoint,
            Self::Exhausted(ctx) => &ctx.endpoint,
        }
    }

    /// Gets the classified kind of the last failure.
    ///
    /// `None` for circuit rejections, cancellations and missed deadlines.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Exhausted(ctx) => Some(ctx.kind),
            _ => None,
        }
    }

    /// Gets the number of transport attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::CircuitOpen { .. } => 0,
            Self::Exhausted(ctx) => ctx.attempts(),
            Self::Cancelled { attempts, .. } | Self::DeadlineExceeded { attempts, .. } => *attempts,
        }
    }

    /// Gets the underlying message.
    pub fn message(&self) -> &str {
        match self {
            Self::CircuitOpen { .. } => "circuit open",
            Self::Exhausted(ctx) => &ctx.message,
            Self::Cancelled { .. } => "cancelled by caller",
            Self::DeadlineExceeded { .. } => "deadline exceeded",
        }
    }

    /// Gets the last failure context, if any.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Exhausted(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// Returns true if the circuit breaker rejected the call.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Returns true if the caller aborted the request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::DeadlineExceeded { .. })
    }
}

/// Failure raised by a [`Transport`](crate::transport::Transport) before a
/// response was received.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The call did not complete within its timeout.
    #[error("request timed out: {0}")]
    Timeout(String),
    /// A connection could not be established or was dropped.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The request could not be built (bad URL, unencodable params).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Any other transport failure.
    #[error("transport error: {0}")]
    Other(String),
}

/// Configuration error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds a value the executor cannot run with.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// The default transport could not be constructed.
    #[error("failed to create HTTP client: {0}")]
    Transport(String),
}
