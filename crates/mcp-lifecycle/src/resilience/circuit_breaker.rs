//! Circuit breaker pattern implementation for per-server fault isolation
//!
//! This module provides a circuit breaker implementation that:
//! - Counts consecutive failures and trips open to fail fast
//! - Optionally trips on the failure rate inside a rolling time window
//! - Admits a bounded number of half-open probes after the reset timeout
//! - Races every guarded operation against an operation timeout
//! - Reports live statistics for monitoring
//!
//! State is kept behind a `parking_lot::Mutex` that is never held across an
//! `.await`; every outcome is applied as one update in completion order.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CircuitBreakerOpenError, LifecycleError, Result};

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Half-open successes that close the circuit
    pub success_threshold: u32,
    /// Time spent open before probes are admitted
    pub reset_timeout: Duration,
    /// Timeout raced against every guarded operation (`None` disables the race)
    pub operation_timeout: Option<Duration>,
    /// Rolling window for rate-based tripping (`None` disables it)
    pub rolling_window: Option<Duration>,
    /// Operations the rolling window must hold before the rate is considered
    pub minimum_operations: u32,
    /// Failure rate (0.0 - 1.0) inside the rolling window that opens the circuit
    pub failure_rate_threshold: f64,
    /// Probes allowed in flight while half-open (`None` = unlimited)
    pub half_open_max_probes: Option<u32>,
    /// Upper bound on retained operation history
    pub max_history: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            operation_timeout: Some(Duration::from_secs(30)),
            rolling_window: None,
            minimum_operations: 10,
            failure_rate_threshold: 0.5,
            half_open_max_probes: Some(1),
            max_history: 100,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration with sensible defaults
    pub fn new() -> Self {
        Self::default()
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed (normal operation)
    #[default]
    Closed,
    /// Circuit is open (failing fast)
    Open,
    /// Circuit is half-open (testing if the server recovered)
    HalfOpen,
}

/// Operation result for rolling-window tracking
#[derive(Debug, Clone)]
pub struct OperationRecord {
    /// When the outcome was recorded
    pub timestamp: Instant,
    /// Whether the operation succeeded
    pub success: bool,
    /// Operation duration
    pub duration: Duration,
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Current circuit state
    pub state: CircuitState,
    /// Consecutive failure count
    pub failure_count: u32,
    /// Success count in the current half-open period
    pub success_count: u32,
    /// Operations recorded since creation or last reset
    pub total_operations: u64,
    /// Operations inside the rolling window (or retained history)
    pub windowed_operations: usize,
    /// Failure rate (0.0 - 1.0) over the same operations
    pub failure_rate: f64,
    /// Average duration over the same operations
    pub avg_operation_duration: Duration,
    /// When the last failure was recorded
    pub last_failure_time: Option<Instant>,
    /// When the last success was recorded
    pub last_success_time: Option<Instant>,
    /// When the circuit admits probes again (set only while open)
    pub next_retry_time: Option<Instant>,
    /// Time spent in the current state
    pub time_in_current_state: Duration,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    total_operations: u64,
    last_failure_time: Option<Instant>,
    last_success_time: Option<Instant>,
    next_retry_time: Option<Instant>,
    last_state_change: Instant,
    history: VecDeque<OperationRecord>,
    in_flight_probes: u32,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_operations: 0,
            last_failure_time: None,
            last_success_time: None,
            next_retry_time: None,
            last_state_change: now,
            history: VecDeque::new(),
            in_flight_probes: 0,
        }
    }
}

/// Circuit breaker implementation
///
/// One breaker guards one server. It is `Sync` and meant to be shared behind
/// an `Arc`; all mutation goes through [`execute`](Self::execute), the
/// `record_*` methods, or the administrative `force_*`/[`reset`](Self::reset).
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Releases a reserved half-open probe slot when the guarded call ends,
/// including when its future is dropped mid-flight.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    reserved: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.reserved {
            let mut inner = self.breaker.inner.lock();
            inner.in_flight_probes = inner.in_flight_probes.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new(Instant::now())),
        }
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Name used in log events (normally the server name)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check if an operation would be admitted right now
    ///
    /// Transitions `Open -> HalfOpen` when the reset timeout has elapsed.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        self.update_state(&mut inner, Instant::now());
        self.admits(&inner)
    }

    /// Fail fast if a call would be rejected right now
    ///
    /// Lets callers skip expensive setup for a call the breaker would refuse.
    /// Does not reserve a half-open probe slot.
    ///
    /// # Errors
    ///
    /// Returns the [`LifecycleError::CircuitOpen`] that
    /// [`execute`](Self::execute) would produce.
    pub fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.update_state(&mut inner, Instant::now());
        if self.admits(&inner) {
            Ok(())
        } else {
            Err(Self::rejection(&inner))
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.update_state(&mut inner, Instant::now());
        inner.state
    }

    /// Consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Run `operation` under the breaker
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::CircuitOpen`] if the circuit rejects the call; the
    ///   operation is not started
    /// - [`LifecycleError::OperationTimeout`] if `operation_timeout` elapses; the
    ///   in-flight future is dropped and the outcome recorded as a failure
    /// - any error returned by `operation`, recorded as a failure
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _slot = self.admit()?;
        let started = Instant::now();

        let result = match self.config.operation_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_) => Err(LifecycleError::OperationTimeout {
                    operation: format!("circuit '{}'", self.name),
                    timeout: limit,
                }),
            },
            None => operation().await,
        };

        let duration = started.elapsed();
        match &result {
            Ok(_) => self.record(true, duration),
            // Cancellation says nothing about the server's health
            Err(LifecycleError::Aborted { .. }) => {}
            Err(e) => {
                debug!(circuit = %self.name, error = %e, "Guarded operation failed");
                self.record(false, duration);
            }
        }
        result
    }

    /// Record a success observed outside [`execute`](Self::execute)
    pub fn record_success(&self, duration: Duration) {
        self.record(true, duration);
    }

    /// Record a failure observed outside [`execute`](Self::execute)
    pub fn record_failure(&self, duration: Duration) {
        self.record(false, duration);
    }

    /// Get circuit breaker statistics
    ///
    /// Trims operation history to the rolling window before computing rates.
    pub fn stats(&self) -> CircuitBreakerStats {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.update_state(&mut inner, now);
        self.trim_history(&mut inner, now);

        let windowed = inner.history.len();
        let failure_rate = if windowed == 0 {
            0.0
        } else {
            let failures = inner.history.iter().filter(|r| !r.success).count();
            failures as f64 / windowed as f64
        };
        let avg_operation_duration = if windowed == 0 {
            Duration::ZERO
        } else {
            let total: Duration = inner.history.iter().map(|r| r.duration).sum();
            total / windowed as u32
        };

        CircuitBreakerStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_operations: inner.total_operations,
            windowed_operations: windowed,
            failure_rate,
            avg_operation_duration,
            last_failure_time: inner.last_failure_time,
            last_success_time: inner.last_success_time,
            next_retry_time: inner.next_retry_time,
            time_in_current_state: now.saturating_duration_since(inner.last_state_change),
        }
    }

    /// Force the circuit open (operator intervention)
    pub fn force_open(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        warn!(circuit = %self.name, "Circuit forced open");
        self.open(&mut inner, now);
    }

    /// Force the circuit closed (operator intervention)
    pub fn force_close(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        info!(circuit = %self.name, "Circuit forced closed");
        self.close(&mut inner, now);
    }

    /// Reset the circuit breaker to a fresh closed state, clearing history
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let in_flight = inner.in_flight_probes;
        *inner = BreakerState::new(Instant::now());
        inner.in_flight_probes = in_flight;
    }

    fn admit(&self) -> Result<ProbeSlot<'_>> {
        let mut inner = self.inner.lock();
        self.update_state(&mut inner, Instant::now());

        if !self.admits(&inner) {
            debug!(circuit = %self.name, state = ?inner.state, "Call rejected by circuit breaker");
            return Err(Self::rejection(&inner));
        }

        let reserved = inner.state == CircuitState::HalfOpen;
        if reserved {
            inner.in_flight_probes += 1;
        }
        Ok(ProbeSlot {
            breaker: self,
            reserved,
        })
    }

    fn rejection(inner: &BreakerState) -> LifecycleError {
        CircuitBreakerOpenError {
            failure_count: inner.failure_count,
            last_failure_time: inner.last_failure_time,
            next_retry_time: inner.next_retry_time,
        }
        .into()
    }

    fn admits(&self, inner: &BreakerState) -> bool {
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => self
                .config
                .half_open_max_probes
                .is_none_or(|max| inner.in_flight_probes < max),
        }
    }

    fn record(&self, success: bool, duration: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        inner.history.push_back(OperationRecord {
            timestamp: now,
            success,
            duration,
        });
        self.trim_history(&mut inner, now);
        inner.total_operations += 1;

        if success {
            inner.last_success_time = Some(now);
            match inner.state {
                CircuitState::Closed => inner.failure_count = 0,
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.success_threshold {
                        info!(circuit = %self.name, "Circuit closed after successful probes");
                        self.close(&mut inner, now);
                    }
                }
                // Late result from a call admitted before the circuit opened
                CircuitState::Open => {}
            }
        } else {
            inner.last_failure_time = Some(now);
            inner.failure_count = inner.failure_count.saturating_add(1);
            match inner.state {
                CircuitState::Closed => {
                    if self.should_trip(&inner) {
                        warn!(
                            circuit = %self.name,
                            failure_count = inner.failure_count,
                            "Circuit opened"
                        );
                        self.open(&mut inner, now);
                    }
                }
                CircuitState::HalfOpen => {
                    warn!(circuit = %self.name, "Half-open probe failed, circuit re-opened");
                    self.open(&mut inner, now);
                }
                CircuitState::Open => {}
            }
        }
    }

    fn should_trip(&self, inner: &BreakerState) -> bool {
        if inner.failure_count >= self.config.failure_threshold {
            return true;
        }

        if self.config.rolling_window.is_none() {
            return false;
        }
        let total = inner.history.len();
        if total == 0 || (total as u64) < u64::from(self.config.minimum_operations) {
            return false;
        }
        let failures = inner.history.iter().filter(|r| !r.success).count();
        failures as f64 / total as f64 >= self.config.failure_rate_threshold
    }

    fn trim_history(&self, inner: &mut BreakerState, now: Instant) {
        if let Some(window) = self.config.rolling_window {
            while inner
                .history
                .front()
                .is_some_and(|r| now.saturating_duration_since(r.timestamp) > window)
            {
                inner.history.pop_front();
            }
        }
        while inner.history.len() > self.config.max_history {
            inner.history.pop_front();
        }
    }

    fn open(&self, inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Open;
        inner.success_count = 0;
        inner.next_retry_time = Some(now + self.config.reset_timeout);
        inner.last_state_change = now;
    }

    fn close(&self, inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.next_retry_time = None;
        inner.last_state_change = now;
    }

    /// Update circuit state based on time
    fn update_state(&self, inner: &mut BreakerState, now: Instant) {
        if inner.state == CircuitState::Open
            && inner.next_retry_time.is_some_and(|at| now >= at)
        {
            debug!(circuit = %self.name, "Reset timeout elapsed, circuit half-open");
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            inner.next_retry_time = None;
            inner.last_state_change = now;
        }
    }
}
