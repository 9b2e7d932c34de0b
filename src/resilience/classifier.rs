//! Best-effort mapping from failed calls to [`ErrorKind`].
//!
//! Failures arrive as a status code, a transport error, or just a message.
//! The classifier walks an ordered list of rules and returns the kind of the
//! first rule that matches. Status-code rules come first; message wording is
//! only consulted for kinds a status code cannot distinguish. Anything left
//! over is [`ErrorKind::Unknown`] rather than a guess.

use crate::errors::{ErrorKind, TransportError};

/// Where a failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSource {
    /// The server answered with a non-success status.
    Response,
    /// The transport timed out.
    Timeout,
    /// The transport could not connect.
    Connect,
    /// The request could not be built.
    InvalidRequest,
    /// Any other transport failure.
    Transport,
}

/// Input to the classifier.
#[derive(Debug, Clone, Copy)]
pub struct FailureSignal<'a> {
    /// HTTP status, if a response arrived.
    pub status: Option<u16>,
    /// Error message or response body.
    pub message: &'a str,
    /// Where the failure came from.
    pub source: FailureSource,
}

impl<'a> FailureSignal<'a> {
    /// Signal for a non-success response.
    pub fn response(status: u16, message: &'a str) -> Self {
        Self {
            status: Some(status),
            message,
            source: FailureSource::Response,
        }
    }

    /// Signal for a bare message with an optional status.
    pub fn message(status: Option<u16>, message: &'a str) -> Self {
        Self {
            status,
            message,
            source: if status.is_some() {
                FailureSource::Response
            } else {
                FailureSource::Transport
            },
        }
    }

    /// Signal for a transport failure.
    pub fn transport(error: &'a TransportError) -> Self {
        let (source, message) = match error {
            TransportError::Timeout(m) => (FailureSource::Timeout, m.as_str()),
            TransportError::Connect(m) => (FailureSource::Connect, m.as_str()),
            TransportError::InvalidRequest(m) => (FailureSource::InvalidRequest, m.as_str()),
            TransportError::Other(m) => (FailureSource::Transport, m.as_str()),
        };
        Self {
            status: None,
            message,
            source,
        }
    }
}

/// Rule predicate. Receives the signal and its lower-cased message.
pub type Predicate = fn(&FailureSignal<'_>, &str) -> bool;

/// One `(predicate, kind)` classification rule.
#[derive(Clone, Copy)]
pub struct ClassificationRule {
    /// Rule name, used in logs.
    pub name: &'static str,
    /// Match condition.
    pub predicate: Predicate,
    /// Kind assigned on match.
    pub kind: ErrorKind,
}

impl std::fmt::Debug for ClassificationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassificationRule")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

fn mentions_quota(m: &str) -> bool {
    m.contains("quota") || m.contains("daily limit")
}

fn mentions_rate_limit(m: &str) -> bool {
    m.contains("rate limit")
        || m.contains("ratelimit")
        || m.contains("abuse")
        || m.contains("too many requests")
}

fn mentions_timeout(m: &str) -> bool {
    m.contains("timed out") || m.contains("timeout") || m.contains("deadline")
}

fn mentions_network(m: &str) -> bool {
    [
        "connection",
        "network",
        "dns",
        "broken pipe",
        "reset by peer",
        "unreachable",
        "unexpected eof",
    ]
    .iter()
    .any(|needle| m.contains(needle))
}

/// The default rule list, in evaluation order.
pub fn default_rules() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule {
            name: "unauthorized",
            predicate: |s, _| s.status == Some(401),
            kind: ErrorKind::Authentication,
        },
        ClassificationRule {
            name: "forbidden_quota",
            predicate: |s, m| s.status == Some(403) && mentions_quota(m),
            kind: ErrorKind::QuotaExceeded,
        },
        ClassificationRule {
            name: "forbidden_rate_limit",
            predicate: |s, m| s.status == Some(403) && mentions_rate_limit(m),
            kind: ErrorKind::RateLimited,
        },
        ClassificationRule {
            name: "forbidden",
            predicate: |s, _| s.status == Some(403),
            kind: ErrorKind::Authorization,
        },
        ClassificationRule {
            name: "not_found",
            predicate: |s, _| matches!(s.status, Some(404) | Some(410)),
            kind: ErrorKind::NotFound,
        },
        ClassificationRule {
            name: "too_many_requests",
            predicate: |s, _| s.status == Some(429),
            kind: ErrorKind::RateLimited,
        },
        ClassificationRule {
            name: "invalid_request",
            predicate: |s, _| {
                matches!(s.status, Some(400) | Some(422))
                    || s.source == FailureSource::InvalidRequest
            },
            kind: ErrorKind::Validation,
        },
        ClassificationRule {
            name: "server_error",
            predicate: |s, _| matches!(s.status, Some(500..=599)),
            kind: ErrorKind::ServerError,
        },
        ClassificationRule {
            name: "transport_timeout",
            predicate: |s, _| s.source == FailureSource::Timeout,
            kind: ErrorKind::Timeout,
        },
        ClassificationRule {
            name: "transport_connect",
            predicate: |s, _| s.source == FailureSource::Connect,
            kind: ErrorKind::NetworkError,
        },
        ClassificationRule {
            name: "timeout_wording",
            predicate: |_, m| mentions_timeout(m),
            kind: ErrorKind::Timeout,
        },
        ClassificationRule {
            name: "network_wording",
            predicate: |_, m| mentions_network(m),
            kind: ErrorKind::NetworkError,
        },
        ClassificationRule {
            name: "quota_wording",
            predicate: |_, m| mentions_quota(m),
            kind: ErrorKind::QuotaExceeded,
        },
        ClassificationRule {
            name: "rate_limit_wording",
            predicate: |_, m| mentions_rate_limit(m),
            kind: ErrorKind::RateLimited,
        },
    ]
}

/// Ordered rule classifier.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
}

impl ErrorClassifier {
    /// Creates a classifier with the default rules.
    pub fn new() -> Self {
        Self::with_rules(default_rules())
    }

    /// Creates a classifier with a custom rule list.
    pub fn with_rules(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    /// Inserts a rule ahead of all existing rules.
    pub fn prepend_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    /// Gets the rules in evaluation order.
    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Classifies a failure signal.
    pub fn classify_signal(&self, signal: &FailureSignal<'_>) -> ErrorKind {
        let lowered = signal.message.to_lowercase();
        self.rules
            .iter()
            .find(|rule| (rule.predicate)(signal, &lowered))
            .map(|rule| {
                tracing::trace!(rule = rule.name, kind = %rule.kind, "Failure classified");
                rule.kind
            })
            .unwrap_or(ErrorKind::Unknown)
    }

    /// Classifies a status code and message.
    pub fn classify(&self, status: Option<u16>, message: &str) -> ErrorKind {
        self.classify_signal(&FailureSignal::message(status, message))
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Classifies a status code and message with the default rules.
pub fn classify(status: Option<u16>, message: &str) -> ErrorKind {
    ErrorClassifier::new().classify(status, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Some(401), "Bad credentials", ErrorKind::Authentication; "unauthorized")]
    #[test_case(Some(403), "Resource not accessible by integration", ErrorKind::Authorization; "forbidden")]
    #[test_case(Some(403), "API rate limit exceeded for user ID 1", ErrorKind::RateLimited; "primary rate limit")]
    #[test_case(Some(403), "You have exceeded a secondary rate limit", ErrorKind::RateLimited; "secondary rate limit")]
    #[test_case(Some(403), "Daily quota exceeded", ErrorKind::QuotaExceeded; "quota")]
    #[test_case(Some(404), "Not Found", ErrorKind::NotFound; "not found")]
    #[test_case(Some(410), "Gone", ErrorKind::NotFound; "gone")]
    #[test_case(Some(429), "", ErrorKind::RateLimited; "too many requests")]
    #[test_case(Some(422), "Validation Failed", ErrorKind::Validation; "unprocessable")]
    #[test_case(Some(400), "Problems parsing JSON", ErrorKind::Validation; "bad request")]
    #[test_case(Some(502), "Bad Gateway", ErrorKind::ServerError; "bad gateway")]
    #[test_case(Some(504), "Gateway Timeout", ErrorKind::ServerError; "status beats wording")]
    #[test_case(None, "operation timed out", ErrorKind::Timeout; "timeout wording")]
    #[test_case(None, "Connection reset by peer", ErrorKind::NetworkError; "network wording")]
    #[test_case(None, "secondary rate limit triggered", ErrorKind::RateLimited; "rate wording")]
    #[test_case(Some(418), "I'm a teapot", ErrorKind::Unknown; "unmatched status")]
    #[test_case(None, "something odd", ErrorKind::Unknown; "unmatched message")]
    fn test_classify(status: Option<u16>, message: &str, expected: ErrorKind) {
        assert_eq!(classify(status, message), expected);
    }

    #[test]
    fn test_transport_errors() {
        let classifier = ErrorClassifier::new();

        let timeout = TransportError::Timeout("elapsed".into());
        assert_eq!(
            classifier.classify_signal(&FailureSignal::transport(&timeout)),
            ErrorKind::Timeout
        );

        let connect = TransportError::Connect("refused".into());
        assert_eq!(
            classifier.classify_signal(&FailureSignal::transport(&connect)),
            ErrorKind::NetworkError
        );

        let invalid = TransportError::InvalidRequest("relative URL without a base".into());
        assert_eq!(
            classifier.classify_signal(&FailureSignal::transport(&invalid)),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_prepended_rule_wins() {
        let classifier = ErrorClassifier::new().prepend_rule(ClassificationRule {
            name: "teapot",
            predicate: |s, _| s.status == Some(418),
            kind: ErrorKind::ServerError,
        });

        assert_eq!(classifier.classify(Some(418), ""), ErrorKind::ServerError);
        assert_eq!(classifier.rules()[0].name, "teapot");
    }
}
