//! Per-endpoint circuit breakers.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Open timeout elapsed and a single trial call is in flight
    HalfOpen,
}

/// Configuration for circuit breakers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures inside `failure_window` that open the circuit
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing a trial
    pub open_timeout: Duration,
    /// Trailing window in which failures are counted
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            failure_window: Duration::from_secs(5 * 60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set failure threshold
    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    /// Set open timeout
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set failure window
    pub fn failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }
}

#[derive(Debug, Clone)]
struct EndpointCircuit {
    state: CircuitState,
    failure_count: u32,
    window_started_at: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for EndpointCircuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            window_started_at: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

type CircuitMap = Arc<Mutex<HashMap<String, EndpointCircuit>>>;

/// Permission to call an endpoint, returned by
/// [`CircuitBreakerRegistry::try_acquire`].
///
/// A trial permit dropped before its outcome was recorded hands the trial
/// slot back, so a cancelled trial does not wedge the circuit half-open.
#[derive(Debug)]
pub struct CircuitPermit {
    circuits: CircuitMap,
    endpoint: String,
    trial: bool,
}

impl CircuitPermit {
    /// Returns true if this call is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.trial {
            return;
        }
        let mut circuits = self.circuits.lock();
        if let Some(circuit) = circuits.get_mut(&self.endpoint) {
            if circuit.state == CircuitState::HalfOpen && circuit.trial_in_flight {
                debug!(endpoint = %self.endpoint, "Trial abandoned, circuit back to OPEN");
                circuit.state = CircuitState::Open;
                circuit.trial_in_flight = false;
            }
        }
    }
}

/// Circuit breakers keyed by endpoint.
///
/// Entries are created on the first failure and dropped once the endpoint
/// succeeds again, so the map only holds endpoints with recent failures.
///
/// After the open timeout exactly one caller receives the trial slot; others
/// keep failing fast until the trial settles.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: CircuitMap,
}

impl CircuitBreakerRegistry {
    /// Create a registry with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Reports whether a call to `endpoint` would be admitted now, without
    /// taking the trial slot.
    pub fn check(&self, endpoint: &str) -> Result<(), Duration> {
        match self.circuits.lock().get(endpoint) {
            Some(circuit) => match self.rejection(circuit) {
                Some(wait) => Err(wait),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    /// Asks to call `endpoint`.
    ///
    /// Returns the remaining open time when the call must fail fast (zero
    /// while another caller holds the trial).
    pub fn try_acquire(&self, endpoint: &str) -> Result<CircuitPermit, Duration> {
        let mut circuits = self.circuits.lock();
        let permit = |trial| CircuitPermit {
            circuits: Arc::clone(&self.circuits),
            endpoint: endpoint.to_string(),
            trial,
        };

        let Some(circuit) = circuits.get_mut(endpoint) else {
            return Ok(permit(false));
        };
        if let Some(wait) = self.rejection(circuit) {
            return Err(wait);
        }

        match circuit.state {
            CircuitState::Closed => Ok(permit(false)),
            CircuitState::Open => {
                info!(endpoint = %endpoint, "Circuit breaker transitioning to HALF_OPEN");
                circuit.state = CircuitState::HalfOpen;
                circuit.trial_in_flight = true;
                Ok(permit(true))
            }
            CircuitState::HalfOpen => {
                circuit.trial_in_flight = true;
                Ok(permit(true))
            }
        }
    }

    fn rejection(&self, circuit: &EndpointCircuit) -> Option<Duration> {
        match circuit.state {
            CircuitState::Closed => None,
            CircuitState::Open => {
                let elapsed = circuit
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                (elapsed < self.config.open_timeout).then(|| self.config.open_timeout - elapsed)
            }
            CircuitState::HalfOpen => circuit.trial_in_flight.then_some(Duration::ZERO),
        }
    }

    /// Records a successful call: the endpoint is closed and forgotten.
    pub fn on_success(&self, endpoint: &str) {
        let mut circuits = self.circuits.lock();
        if let Some(circuit) = circuits.remove(endpoint) {
            if circuit.state != CircuitState::Closed {
                info!(endpoint = %endpoint, "Circuit breaker transitioning to CLOSED");
            }
        }
    }

    /// Records a failed call.
    pub fn on_failure(&self, endpoint: &str) {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(endpoint.to_string()).or_default();

        match circuit.state {
            CircuitState::Closed => {
                let window_expired = circuit
                    .window_started_at
                    .map(|start| now.saturating_duration_since(start) > self.config.failure_window)
                    .unwrap_or(true);
                if window_expired {
                    circuit.failure_count = 0;
                    circuit.window_started_at = Some(now);
                }

                circuit.failure_count = circuit.failure_count.saturating_add(1);
                if circuit.failure_count >= self.config.failure_threshold {
                    warn!(
                        endpoint = %endpoint,
                        failure_count = circuit.failure_count,
                        "Circuit breaker transitioning to OPEN"
                    );
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(endpoint = %endpoint, "Circuit breaker returning to OPEN from half-open");
                circuit.failure_count = circuit.failure_count.saturating_add(1);
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(now);
                circuit.trial_in_flight = false;
            }
            CircuitState::Open => {
                circuit.failure_count = circuit.failure_count.saturating_add(1);
            }
        }
    }

    /// Forces `endpoint` closed regardless of its failure count.
    pub fn reset(&self, endpoint: &str) {
        if self.circuits.lock().remove(endpoint).is_some() {
            info!(endpoint = %endpoint, "Circuit breaker reset to CLOSED");
        }
    }

    /// Gets the state of `endpoint`.
    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.circuits
            .lock()
            .get(endpoint)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Gets the recorded failure count of `endpoint`.
    pub fn failure_count(&self, endpoint: &str) -> u32 {
        self.circuits
            .lock()
            .get(endpoint)
            .map(|c| c.failure_count)
            .unwrap_or(0)
    }

    /// Endpoints whose circuit is not closed, sorted.
    pub fn open_endpoints(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .circuits
            .lock()
            .iter()
            .filter(|(_, c)| c.state != CircuitState::Closed)
            .map(|(endpoint, _)| endpoint.clone())
            .collect();
        open.sort();
        open
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(threshold: u32, timeout: Duration) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(
            CircuitBreakerConfig::new()
                .failure_threshold(threshold)
                .open_timeout(timeout),
        )
    }

    #[test]
    fn test_initial_state() {
        let cb = CircuitBreakerRegistry::default();
        assert_eq!(cb.state("repos"), CircuitState::Closed);
        assert_eq!(cb.failure_count("repos"), 0);
        assert!(cb.try_acquire("repos").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_open_circuit() {
        let cb = registry(3, Duration::from_secs(60));

        cb.on_failure("repos");
        cb.on_failure("repos");
        assert_eq!(cb.state("repos"), CircuitState::Closed);
        cb.on_failure("repos");

        assert_eq!(cb.state("repos"), CircuitState::Open);
        assert_eq!(cb.try_acquire("repos").unwrap_err(), Duration::from_secs(60));
        assert_eq!(cb.open_endpoints(), vec!["repos".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoints_are_independent() {
        let cb = registry(1, Duration::from_secs(60));
        cb.on_failure("a");

        assert!(cb.try_acquire("a").is_err());
        assert!(cb.try_acquire("b").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_accumulate() {
        let cb = CircuitBreakerRegistry::new(
            CircuitBreakerConfig::new()
                .failure_threshold(2)
                .failure_window(Duration::from_secs(10)),
        );

        cb.on_failure("a");
        tokio::time::advance(Duration::from_secs(11)).await;
        cb.on_failure("a");

        assert_eq!(cb.state("a"), CircuitState::Closed);
        assert_eq!(cb.failure_count("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_timeout() {
        let cb = registry(1, Duration::from_secs(30));
        cb.on_failure("a");

        tokio::time::advance(Duration::from_secs(30)).await;

        let trial = cb.try_acquire("a").unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.state("a"), CircuitState::HalfOpen);
        // A second caller does not get a trial of its own.
        assert_eq!(cb.try_acquire("a").unwrap_err(), Duration::ZERO);

        cb.on_success("a");
        drop(trial);
        assert_eq!(cb.state("a"), CircuitState::Closed);
        assert_eq!(cb.failure_count("a"), 0);
        assert!(!cb.try_acquire("a").unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let cb = registry(1, Duration::from_secs(30));
        cb.on_failure("a");
        tokio::time::advance(Duration::from_secs(30)).await;

        let trial = cb.try_acquire("a").unwrap();
        cb.on_failure("a");
        drop(trial);

        assert_eq!(cb.state("a"), CircuitState::Open);
        // Timeout restarts from the failed trial.
        assert_eq!(cb.try_acquire("a").unwrap_err(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_does_not_take_trial() {
        let cb = registry(1, Duration::from_secs(30));
        assert!(cb.check("a").is_ok());
        cb.on_failure("a");

        assert_eq!(cb.check("a").unwrap_err(), Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(cb.check("a").is_ok());
        assert!(cb.check("a").is_ok());
        assert_eq!(cb.state("a"), CircuitState::Open);

        let trial = cb.try_acquire("a").unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.check("a").unwrap_err(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_releases_slot() {
        let cb = registry(1, Duration::from_secs(30));
        cb.on_failure("a");
        tokio::time::advance(Duration::from_secs(30)).await;

        drop(cb.try_acquire("a").unwrap());

        assert_eq!(cb.state("a"), CircuitState::Open);
        assert!(cb.try_acquire("a").unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let cb = registry(1, Duration::from_secs(300));
        cb.on_failure("a");
        assert_eq!(cb.state("a"), CircuitState::Open);

        cb.reset("a");

        assert_eq!(cb.state("a"), CircuitState::Closed);
        assert!(cb.try_acquire("a").is_ok());
        assert!(cb.open_endpoints().is_empty());
    }
}
