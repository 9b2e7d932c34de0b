//! Bounded log of recent failures.

use crate::errors::{ErrorContext, ErrorKind};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Number of endpoints listed in [`ErrorSummary::by_endpoint_top5`].
pub const TOP_ENDPOINTS: usize = 5;

/// Aggregate of failures recorded within a window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorSummary {
    /// Failures in the window.
    pub total: usize,
    /// Failures per kind.
    pub by_kind: BTreeMap<ErrorKind, usize>,
    /// The endpoints with the most failures, most first.
    pub by_endpoint_top5: Vec<(String, usize)>,
}

#[derive(Debug)]
struct LoggedError {
    at: Instant,
    context: ErrorContext,
}

/// Ring buffer of failure contexts; the oldest entry is dropped when full.
#[derive(Debug)]
pub struct ErrorLog {
    entries: Mutex<VecDeque<LoggedError>>,
    capacity: usize,
}

impl ErrorLog {
    /// Creates a log holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Gets the capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Gets the number of entries held.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Appends a failure.
    pub fn record(&self, context: ErrorContext) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(LoggedError {
            at: Instant::now(),
            context,
        });
    }

    /// Summarizes failures recorded within the last `window`.
    pub fn summary(&self, window: Duration) -> ErrorSummary {
        let now = Instant::now();
        let entries = self.entries.lock();

        let mut summary = ErrorSummary::default();
        let mut by_endpoint: HashMap<&str, usize> = HashMap::new();

        for entry in entries
            .iter()
            .rev()
            .take_while(|e| now.saturating_duration_since(e.at) <= window)
        {
            summary.total += 1;
            *summary.by_kind.entry(entry.context.kind).or_default() += 1;
            *by_endpoint.entry(entry.context.endpoint.as_str()).or_default() += 1;
        }

        let mut ranked: Vec<(String, usize)> = by_endpoint
            .into_iter()
            .map(|(endpoint, count)| (endpoint.to_string(), count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(TOP_ENDPOINTS);
        summary.by_endpoint_top5 = ranked;

        summary
    }

    /// Drops all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
