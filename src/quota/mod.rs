//! Quota tracking for GitHub's primary and secondary rate limits.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Remaining calls in the current primary window.
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Size of the primary window.
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// Unix timestamp at which the primary window resets.
pub const HEADER_RESET: &str = "x-ratelimit-reset";
/// Burst-limit hint, in seconds or as an HTTP date.
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Length of the rolling local budget window.
pub const QUOTA_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Primary limit assumed until the server reports one.
pub const DEFAULT_PRIMARY_LIMIT: u32 = 5000;

/// Default local ceiling on calls per rolling hour.
pub const DEFAULT_HOURLY_BUDGET: u32 = 4500;

/// Longest burst block honored from a single `retry-after` hint.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Mutable quota counters.
#[derive(Debug, Clone)]
pub struct QuotaState {
    /// Calls left in the primary window.
    pub primary_remaining: u32,
    /// Size of the primary window.
    pub primary_limit: u32,
    /// When the primary window resets, once the server has said so.
    pub primary_reset_at: Option<DateTime<Utc>>,
    /// End of a burst block requested via `retry-after`.
    pub secondary_blocked_until: Option<Instant>,
    /// Calls issued in the local rolling window.
    pub calls_this_window: u32,
    /// Start of the local rolling window.
    pub window_started_at: Instant,
}

impl QuotaState {
    fn new(initial_limit: u32) -> Self {
        Self {
            primary_remaining: initial_limit,
            primary_limit: initial_limit,
            primary_reset_at: None,
            secondary_blocked_until: None,
            calls_this_window: 0,
            window_started_at: Instant::now(),
        }
    }
}

/// Read-only view of the quota for stats reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaSnapshot {
    /// Calls left in the primary window.
    pub primary_remaining: u32,
    /// Size of the primary window.
    pub primary_limit: u32,
    /// When the primary window resets.
    pub primary_reset_at: Option<DateTime<Utc>>,
    /// Remaining burst block.
    pub secondary_blocked_for: Option<Duration>,
    /// Calls issued in the local rolling window.
    pub calls_this_window: u32,
    /// Local ceiling on calls per rolling hour.
    pub hourly_budget: u32,
    /// Wait before the next call would be allowed.
    pub wait: Duration,
}

/// Rate-limit fields parsed from one response.
///
/// Each field is parsed independently; a malformed header yields `None` for
/// that field only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// `x-ratelimit-remaining`.
    pub remaining: Option<u32>,
    /// `x-ratelimit-limit`.
    pub limit: Option<u32>,
    /// `x-ratelimit-reset`.
    pub reset_at: Option<DateTime<Utc>>,
    /// `retry-after`.
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// Parses rate-limit headers from a lower-cased header map.
    pub fn parse(headers: &HashMap<String, String>) -> Self {
        let number = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.trim().parse::<u32>().ok())
        };

        let reset_at = headers
            .get(HEADER_RESET)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(|ts| DateTime::from_timestamp(ts, 0));

        let retry_after = headers
            .get(HEADER_RETRY_AFTER)
            .and_then(|v| parse_retry_after(v, Utc::now()));

        Self {
            remaining: number(HEADER_REMAINING),
            limit: number(HEADER_LIMIT),
            reset_at,
            retry_after,
        }
    }

    /// Returns true if no rate-limit field was present.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Parses a `retry-after` value given as delta seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    let hint = match value.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => {
            let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
            (at - now).to_std().unwrap_or(Duration::ZERO)
        }
    };
    Some(hint.min(MAX_RETRY_AFTER))
}

/// Tracks server quota and a local hourly budget.
///
/// Shared by all callers of one executor; every method takes `&self` and
/// serializes on an internal mutex.
#[derive(Debug)]
pub struct QuotaTracker {
    state: Mutex<QuotaState>,
    hourly_budget: u32,
}

impl QuotaTracker {
    /// Creates a tracker with the given hourly budget and assumed limit.
    pub fn new(hourly_budget: u32, initial_limit: u32) -> Self {
        Self {
            state: Mutex::new(QuotaState::new(initial_limit)),
            hourly_budget,
        }
    }

    /// Gets the local ceiling on calls per rolling hour.
    pub fn hourly_budget(&self) -> u32 {
        self.hourly_budget
    }

    /// Gets a copy of the current counters.
    pub fn state(&self) -> QuotaState {
        self.state.lock().clone()
    }

    /// Applies rate-limit headers from a response.
    ///
    /// `primary_remaining` only goes up when the reported reset is later
    /// than the stored one; within a window the lower value wins. Missing or
    /// malformed fields leave the stored values untouched.
    pub fn update_from_response(&self, headers: &HashMap<String, String>) {
        let parsed = RateLimitHeaders::parse(headers);
        if parsed.is_empty() {
            return;
        }

        let mut state = self.state.lock();

        if let Some(limit) = parsed.limit {
            state.primary_limit = limit;
        }

        let new_window = match (parsed.reset_at, state.primary_reset_at) {
            (Some(reported), Some(stored)) => reported > stored,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if new_window {
            state.primary_reset_at = parsed.reset_at;
        }

        if let Some(remaining) = parsed.remaining {
            state.primary_remaining = if new_window {
                remaining
            } else {
                state.primary_remaining.min(remaining)
            };
        }

        if let Some(retry_after) = parsed.retry_after {
            if let Some(until) = Instant::now().checked_add(retry_after) {
                state.secondary_blocked_until = Some(match state.secondary_blocked_until {
                    Some(existing) => existing.max(until),
                    None => until,
                });
            }
        }

        tracing::debug!(
            limit = state.primary_limit,
            remaining = state.primary_remaining,
            reset_at = ?state.primary_reset_at,
            retry_after_secs = parsed.retry_after.map(|d| d.as_secs()),
            "Rate limit updated"
        );

        if state.primary_remaining == 0 {
            tracing::warn!(
                limit = state.primary_limit,
                reset_at = ?state.primary_reset_at,
                "Primary rate limit exhausted"
            );
        }
    }

    /// Wait before the next call is permitted.
    ///
    /// The longest of: the primary reset when no calls remain, an active
    /// burst block, and the end of the rolling window when the hourly budget
    /// is spent.
    pub fn time_until_allowed(&self) -> Duration {
        let state = self.state.lock();
        self.wait_locked(&state, Instant::now(), Utc::now())
    }

    /// Records an outgoing call before its response is known.
    pub fn record_call(&self) {
        let mut state = self.state.lock();
        Self::record_locked(&mut state, Instant::now());
    }

    /// Records a call if one is allowed right now, else returns the wait.
    ///
    /// Checking and recording happen under one lock, so concurrent callers
    /// cannot both spend the last unit.
    pub fn try_reserve(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let wait = self.wait_locked(&state, now, Utc::now());
        if wait.is_zero() {
            Self::record_locked(&mut state, now);
            Ok(())
        } else {
            Err(wait)
        }
    }

    /// Gets a serializable view of the quota.
    pub fn snapshot(&self) -> QuotaSnapshot {
        let state = self.state.lock();
        let now = Instant::now();
        QuotaSnapshot {
            primary_remaining: state.primary_remaining,
            primary_limit: state.primary_limit,
            primary_reset_at: state.primary_reset_at,
            secondary_blocked_for: state
                .secondary_blocked_until
                .map(|until| until.saturating_duration_since(now))
                .filter(|d| !d.is_zero()),
            calls_this_window: state.calls_this_window,
            hourly_budget: self.hourly_budget,
            wait: self.wait_locked(&state, now, Utc::now()),
        }
    }

    fn wait_locked(&self, state: &QuotaState, now: Instant, wall: DateTime<Utc>) -> Duration {
        let mut wait = Duration::ZERO;

        if state.primary_remaining == 0 {
            if let Some(reset_at) = state.primary_reset_at {
                wait = wait.max((reset_at - wall).to_std().unwrap_or(Duration::ZERO));
            }
        }

        if let Some(until) = state.secondary_blocked_until {
            wait = wait.max(until.saturating_duration_since(now));
        }

        if state.calls_this_window >= self.hourly_budget {
            let elapsed = now.saturating_duration_since(state.window_started_at);
            wait = wait.max(QUOTA_WINDOW.saturating_sub(elapsed));
        }

        wait
    }

    fn record_locked(state: &mut QuotaState, now: Instant) {
        if now.saturating_duration_since(state.window_started_at) >= QUOTA_WINDOW {
            state.calls_this_window = 0;
            state.window_started_at = now;
        }
        state.primary_remaining = state.primary_remaining.saturating_sub(1);
        state.calls_this_window = state.calls_this_window.saturating_add(1);
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HOURLY_BUDGET, DEFAULT_PRIMARY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, String)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn quota_headers(remaining: u32, reset: DateTime<Utc>) -> HashMap<String, String> {
        headers(&[
            (HEADER_LIMIT, "5000".to_string()),
            (HEADER_REMAINING, remaining.to_string()),
            (HEADER_RESET, reset.timestamp().to_string()),
        ])
    }

    #[test]
    fn test_update_from_response() {
        let tracker = QuotaTracker::default();
        let reset = Utc::now() + chrono::Duration::hours(1);

        tracker.update_from_response(&quota_headers(4000, reset));

        let state = tracker.state();
        assert_eq!(state.primary_limit, 5000);
        assert_eq!(state.primary_remaining, 4000);
        assert_eq!(state.primary_reset_at.map(|r| r.timestamp()), Some(reset.timestamp()));
    }

    #[test]
    fn test_remaining_never_increases_within_window() {
        let tracker = QuotaTracker::default();
        let reset = Utc::now() + chrono::Duration::hours(1);

        tracker.update_from_response(&quota_headers(100, reset));
        tracker.update_from_response(&quota_headers(150, reset));
        assert_eq!(tracker.state().primary_remaining, 100);

        // An older reset cannot restore quota either.
        tracker.update_from_response(&quota_headers(
            4999,
            reset - chrono::Duration::minutes(10),
        ));
        let state = tracker.state();
        assert_eq!(state.primary_remaining, 100);
        assert_eq!(state.primary_reset_at.map(|r| r.timestamp()), Some(reset.timestamp()));
    }

    #[test]
    fn test_later_reset_starts_new_window() {
        let tracker = QuotaTracker::default();
        let reset = Utc::now() + chrono::Duration::minutes(5);

        tracker.update_from_response(&quota_headers(0, reset));
        tracker.update_from_response(&quota_headers(
            4999,
            reset + chrono::Duration::hours(1),
        ));

        assert_eq!(tracker.state().primary_remaining, 4999);
    }

    #[test]
    fn test_malformed_headers_are_ignored() {
        let tracker = QuotaTracker::default();
        let reset = Utc::now() + chrono::Duration::hours(1);
        tracker.update_from_response(&quota_headers(42, reset));

        tracker.update_from_response(&headers(&[
            (HEADER_REMAINING, "lots".to_string()),
            (HEADER_LIMIT, "-1".to_string()),
            (HEADER_RESET, "soon".to_string()),
        ]));

        let state = tracker.state();
        assert_eq!(state.primary_remaining, 42);
        assert_eq!(state.primary_limit, 5000);
        assert_eq!(state.primary_reset_at.map(|r| r.timestamp()), Some(reset.timestamp()));
    }

    #[test]
    fn test_wait_for_primary_reset() {
        let tracker = QuotaTracker::default();
        assert_eq!(tracker.time_until_allowed(), Duration::ZERO);

        let reset = Utc::now() + chrono::Duration::seconds(60);
        tracker.update_from_response(&quota_headers(0, reset));

        let wait = tracker.time_until_allowed();
        assert!(wait > Duration::from_secs(55));
        assert!(wait <= Duration::from_secs(60));
        assert!(tracker.try_reserve().is_err());
    }

    #[test]
    fn test_past_reset_does_not_block() {
        let tracker = QuotaTracker::default();
        let reset = Utc::now() - chrono::Duration::seconds(5);
        tracker.update_from_response(&quota_headers(0, reset));

        assert_eq!(tracker.time_until_allowed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_blocks_burst() {
        let tracker = QuotaTracker::default();
        tracker.update_from_response(&headers(&[(HEADER_RETRY_AFTER, "30".to_string())]));

        assert_eq!(tracker.time_until_allowed(), Duration::from_secs(30));
        // Remaining is untouched by a burst hint.
        assert_eq!(tracker.state().primary_remaining, DEFAULT_PRIMARY_LIMIT);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(tracker.time_until_allowed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_retry_after_is_capped() {
        let tracker = QuotaTracker::default();
        tracker.update_from_response(&headers(&[(HEADER_RETRY_AFTER, u64::MAX.to_string())]));

        assert_eq!(tracker.time_until_allowed(), MAX_RETRY_AFTER);

        tokio::time::advance(MAX_RETRY_AFTER).await;
        assert_eq!(tracker.time_until_allowed(), Duration::ZERO);
        assert!(tracker.try_reserve().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hourly_budget_blocks_until_window_rolls() {
        let tracker = QuotaTracker::new(2, DEFAULT_PRIMARY_LIMIT);

        assert!(tracker.try_reserve().is_ok());
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(tracker.try_reserve().is_ok());

        let wait = tracker.try_reserve().unwrap_err();
        assert_eq!(wait, QUOTA_WINDOW - Duration::from_secs(600));

        tokio::time::advance(wait).await;
        assert!(tracker.try_reserve().is_ok());
        let state = tracker.state();
        assert_eq!(state.calls_this_window, 1);
        assert_eq!(state.primary_remaining, DEFAULT_PRIMARY_LIMIT - 3);
    }

    #[test]
    fn test_record_call_is_optimistic() {
        let tracker = QuotaTracker::new(10, 1);
        tracker.record_call();
        tracker.record_call();

        let state = tracker.state();
        assert_eq!(state.primary_remaining, 0);
        assert_eq!(state.calls_this_window, 2);
    }

    #[test]
    fn test_parse_retry_after() {
        let now = Utc::now();
        assert_eq!(parse_retry_after("2", now), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after("soon", now), None);

        let later = (now + chrono::Duration::seconds(120)).to_rfc2822();
        let parsed = parse_retry_after(&later, now).unwrap();
        assert!(parsed >= Duration::from_secs(119));
        assert!(parsed <= Duration::from_secs(120));

        assert_eq!(parse_retry_after("18446744073709551615", now), Some(MAX_RETRY_AFTER));
        let far = (now + chrono::Duration::days(400)).to_rfc2822();
        assert_eq!(parse_retry_after(&far, now), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_snapshot_reports_budget() {
        let tracker = QuotaTracker::new(100, 5000);
        tracker.record_call();

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.hourly_budget, 100);
        assert_eq!(snapshot.calls_this_window, 1);
        assert_eq!(snapshot.primary_remaining, 4999);
        assert_eq!(snapshot.wait, Duration::ZERO);
        assert_eq!(snapshot.secondary_blocked_for, None);
    }
}
