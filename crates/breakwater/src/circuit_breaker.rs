//! Circuit breaker: admission control for failing dependencies.
//!
//! One breaker per service name, with three states:
//! - **Closed**: normal operation, calls pass through.
//! - **Open**: the dependency is assumed down, calls fail fast.
//! - **HalfOpen**: a bounded number of probe calls test recovery.
//!
//! Transitions:
//! - Closed → Open once `failure_threshold` consecutive counted failures
//!   accumulate.
//! - Open → HalfOpen lazily, at the first admission attempt after
//!   `recovery_timeout` has elapsed since the last failure.
//! - HalfOpen → Closed after `success_threshold` successes.
//! - HalfOpen → Open on any failure, or when the probe budget
//!   (`half_open_max_calls`) is spent before the circuit closed.
//!
//! The breaker lock covers decision and bookkeeping only; the wrapped
//! operation runs without the lock held, so calls on the same breaker stay
//! concurrent while Closed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{duration_secs, ConfigError, ResilienceConfig};
use crate::error::CallError;

/// Aggregate counters reset after this many admitted operations, while the
/// breaker is Closed with no recent failures, to bound metric drift.
const ROTATION_THRESHOLD: u64 = 1000;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Rejecting all calls.
    Open,
    /// Admitting a bounded number of recovery probes.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker thresholds for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Counted failures before the circuit opens.
    pub failure_threshold: u32,

    /// How long the circuit stays open before admitting recovery probes.
    #[serde(with = "duration_secs")]
    pub recovery_timeout: Duration,

    /// Successes needed while half-open to close the circuit.
    pub success_threshold: u32,

    /// Probe budget while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Validate at construction; invalid configs fail fast.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit breaker failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit breaker success_threshold must be at least 1".to_string(),
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::Invalid(
                "circuit breaker half_open_max_calls must be at least 1".to_string(),
            ));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "circuit breaker recovery_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Typed classifier for which operation errors count toward the failure
/// threshold. Errors it rejects are re-raised without breaker bookkeeping.
#[derive(Clone)]
pub struct TripPolicy {
    counts: Arc<dyn Fn(&CallError) -> bool + Send + Sync>,
}

impl TripPolicy {
    /// Build a policy from a predicate.
    pub fn new(counts: impl Fn(&CallError) -> bool + Send + Sync + 'static) -> Self {
        Self {
            counts: Arc::new(counts),
        }
    }

    /// Every error counts (the default).
    pub fn all() -> Self {
        Self::new(|_| true)
    }

    /// Only transient errors count; permanent faults (bad requests and the
    /// like) say nothing about the dependency's availability.
    pub fn transient_only() -> Self {
        Self::new(CallError::is_transient)
    }

    /// Whether this error counts toward the failure threshold.
    pub fn counts(&self, error: &CallError) -> bool {
        (self.counts)(error)
    }
}

impl Default for TripPolicy {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for TripPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TripPolicy").finish_non_exhaustive()
    }
}

/// Errors from a breaker-gated call.
#[derive(Error, Debug)]
pub enum CircuitBreakerError {
    /// Admission refused; the operation was never invoked.
    #[error("circuit '{service}' is open, retry after {retry_after:?}")]
    Open {
        service: String,
        retry_after: Option<Duration>,
    },

    /// The operation itself failed; recorded and re-raised unchanged.
    #[error(transparent)]
    Operation(CallError),
}

#[derive(Debug, Default)]
struct CircuitMetrics {
    failure_count: u32,
    success_count: u32,
    total_requests: u64,
    half_open_calls: u32,
    state_changes: u64,
    last_failure_time: Option<Instant>,
    last_success_time: Option<Instant>,
    last_state_change: Option<Instant>,
}

struct BreakerInner {
    state: CircuitState,
    metrics: CircuitMetrics,
}

/// Point-in-time view of a breaker, for health endpoints and debugging.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u64,
    pub half_open_calls: u32,
    pub state_changes: u64,
    /// Seconds since the last recorded failure, if any.
    pub seconds_since_last_failure: Option<f64>,
    /// Seconds since the last recorded success, if any.
    pub seconds_since_last_success: Option<f64>,
    /// Seconds since the last state transition, if any occurred.
    pub seconds_since_last_state_change: Option<f64>,
}

/// Per-service circuit breaker.
///
/// Created lazily by [`CircuitBreakerManager`] on first reference to a
/// service name and lives for the process lifetime. All state mutation
/// happens under the breaker's own lock, inside its methods.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    trip_policy: TripPolicy,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker, validating the config up front.
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            trip_policy: TripPolicy::default(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                metrics: CircuitMetrics::default(),
            }),
        })
    }

    /// Replace the failure classifier.
    pub fn with_trip_policy(mut self, policy: TripPolicy) -> Self {
        self.trip_policy = policy;
        self
    }

    /// The service this breaker protects.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The state as last observed; admission calls perform the lazy
    /// Open → HalfOpen transition, this probe does not.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Request admission for one call.
    ///
    /// Performs the lazy Open → HalfOpen transition, charges the half-open
    /// probe budget, and rejects with [`CircuitBreakerError::Open`] when
    /// the circuit is open or the probe budget is spent.
    pub fn try_acquire(&self) -> Result<(), CircuitBreakerError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .metrics
                .last_failure_time
                .map(|t| now.duration_since(t))
                .unwrap_or(Duration::MAX);
            if elapsed >= self.config.recovery_timeout {
                self.transition(&mut inner, CircuitState::HalfOpen, now);
                inner.metrics.half_open_calls = 0;
                inner.metrics.success_count = 0;
            } else {
                let retry_after = self.config.recovery_timeout - elapsed;
                tracing::warn!(
                    service = %self.name,
                    retry_after_secs = retry_after.as_secs_f64(),
                    "circuit open, rejecting call"
                );
                return Err(CircuitBreakerError::Open {
                    service: self.name.clone(),
                    retry_after: Some(retry_after),
                });
            }
        }

        if inner.state == CircuitState::HalfOpen {
            // Invariant: half_open_calls never exceeds half_open_max_calls.
            if inner.metrics.half_open_calls >= self.config.half_open_max_calls {
                inner.metrics.last_failure_time = Some(now);
                self.transition(&mut inner, CircuitState::Open, now);
                tracing::warn!(
                    service = %self.name,
                    "half-open probe budget spent, reopening circuit"
                );
                return Err(CircuitBreakerError::Open {
                    service: self.name.clone(),
                    retry_after: Some(self.config.recovery_timeout),
                });
            }
            inner.metrics.half_open_calls += 1;
        }

        inner.metrics.total_requests += 1;
        Ok(())
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.metrics.last_success_time = Some(now);
        inner.metrics.success_count += 1;

        match inner.state {
            CircuitState::Closed => {
                // Failures must be consecutive to trip the breaker.
                inner.metrics.failure_count = 0;
                self.maybe_rotate(&mut inner);
            }
            CircuitState::HalfOpen => {
                if inner.metrics.success_count >= self.config.success_threshold {
                    inner.metrics.failure_count = 0;
                    inner.metrics.success_count = 0;
                    inner.metrics.half_open_calls = 0;
                    self.transition(&mut inner, CircuitState::Closed, now);
                    tracing::info!(service = %self.name, "circuit closed after recovery");
                }
            }
            CircuitState::Open => {
                // Outcome of a call admitted before the circuit opened.
            }
        }
    }

    /// Record a failed call. Only errors the trip policy counts should be
    /// routed here; [`CircuitBreaker::record_error`] applies the policy.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.metrics.last_failure_time = Some(now);
        inner.metrics.failure_count += 1;

        match inner.state {
            CircuitState::Closed => {
                if inner.metrics.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open, now);
                    tracing::warn!(
                        service = %self.name,
                        failures = inner.metrics.failure_count,
                        "failure threshold reached, circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open, now);
                tracing::warn!(
                    service = %self.name,
                    "recovery probe failed, circuit reopened"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// Record an operation error, consulting the trip policy.
    pub fn record_error(&self, error: &CallError) {
        if self.trip_policy.counts(error) {
            self.record_failure();
        }
    }

    /// Run `op` under the breaker.
    ///
    /// Admission and bookkeeping are serialized per breaker; the operation
    /// itself runs without the lock held. Operation errors are recorded and
    /// re-raised unchanged.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, CallError>>,
    {
        self.try_acquire()?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_error(&error);
                Err(CircuitBreakerError::Operation(error))
            }
        }
    }

    /// Point-in-time metrics snapshot.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            service: self.name.clone(),
            state: inner.state,
            failure_count: inner.metrics.failure_count,
            success_count: inner.metrics.success_count,
            total_requests: inner.metrics.total_requests,
            half_open_calls: inner.metrics.half_open_calls,
            state_changes: inner.metrics.state_changes,
            seconds_since_last_failure: inner
                .metrics
                .last_failure_time
                .map(|t| now.duration_since(t).as_secs_f64()),
            seconds_since_last_success: inner
                .metrics
                .last_success_time
                .map(|t| now.duration_since(t).as_secs_f64()),
            seconds_since_last_state_change: inner
                .metrics
                .last_state_change
                .map(|t| now.duration_since(t).as_secs_f64()),
        }
    }

    /// Force the breaker back to Closed and zero its counters.
    pub fn reset(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, now);
        }
        inner.metrics.failure_count = 0;
        inner.metrics.success_count = 0;
        inner.metrics.total_requests = 0;
        inner.metrics.half_open_calls = 0;
        tracing::info!(service = %self.name, "circuit breaker reset");
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.metrics.state_changes += 1;
        inner.metrics.last_state_change = Some(now);
        tracing::info!(
            service = %self.name,
            from = %from,
            to = %to,
            "circuit state transition"
        );
    }

    /// Rotate aggregate counters once enough operations accumulate.
    ///
    /// Only rotates while Closed with zero recent failures, so a failure
    /// run can never straddle a rotation boundary and the threshold
    /// comparison always sees an intact count.
    fn maybe_rotate(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Closed
            && inner.metrics.failure_count == 0
            && inner.metrics.total_requests >= ROTATION_THRESHOLD
        {
            inner.metrics.total_requests = 0;
            inner.metrics.success_count = 0;
            tracing::debug!(service = %self.name, "rotated breaker counters");
        }
    }
}

/// Registry of breakers, one per service name, created lazily with the
/// per-service defaults from [`ResilienceConfig`].
pub struct CircuitBreakerManager {
    config: ResilienceConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    /// Build with the default per-service policy table.
    pub fn new() -> Self {
        Self::from_config(ResilienceConfig::default())
    }

    /// Build from an explicit configuration.
    pub fn from_config(config: ResilienceConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// The breaker for a service, created on first reference.
    ///
    /// Concurrent first uses observe the same instance: creation happens
    /// under the map's write lock.
    pub fn get_breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(service) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let config = self.config.policy(service).circuit_breaker;
                let config = match config.validate() {
                    Ok(()) => config,
                    Err(error) => {
                        tracing::warn!(
                            service,
                            error = %error,
                            "invalid breaker config, falling back to defaults"
                        );
                        CircuitBreakerConfig::default()
                    }
                };
                Arc::new(CircuitBreaker {
                    name: service.to_string(),
                    config,
                    trip_policy: TripPolicy::default(),
                    inner: Mutex::new(BreakerInner {
                        state: CircuitState::Closed,
                        metrics: CircuitMetrics::default(),
                    }),
                })
            })
            .clone()
    }

    /// Run `op` under the service's breaker.
    pub async fn call<T, F, Fut>(&self, service: &str, op: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, CallError>>,
    {
        self.get_breaker(service).call(op).await
    }

    /// Snapshots for every breaker created so far.
    pub fn snapshot(&self) -> HashMap<String, CircuitBreakerSnapshot> {
        self.breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.snapshot()))
            .collect()
    }

    /// Reset one service's breaker, if it exists.
    pub fn reset(&self, service: &str) {
        if let Some(breaker) = self.breakers.read().get(service) {
            breaker.reset();
        }
    }

    /// Reset every breaker.
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(failure_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "llm",
            CircuitBreakerConfig {
                failure_threshold,
                recovery_timeout: Duration::from_secs(30),
                success_threshold: 2,
                half_open_max_calls: 2,
            },
        )
        .unwrap()
    }

    async fn failing_call(breaker: &CircuitBreaker, calls: &AtomicU32) -> Result<(), CircuitBreakerError> {
        breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CallError::transport("boom"))
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_failure_threshold() {
        let breaker = breaker(3);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let result = failing_call(&breaker, &calls).await;
            assert!(matches!(result, Err(CircuitBreakerError::Operation(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Rejected without invoking the operation.
        let result = failing_call(&breaker, &calls).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let breaker = breaker(3);

        breaker.try_acquire().unwrap();
        breaker.record_failure();
        breaker.try_acquire().unwrap();
        breaker.record_failure();
        breaker.try_acquire().unwrap();
        breaker.record_success();

        breaker.try_acquire().unwrap();
        breaker.record_failure();
        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_recovery_timeout() {
        let breaker = breaker(1);
        let calls = AtomicU32::new(0);

        let _ = failing_call(&breaker, &calls).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;

        // The next call is attempted, not rejected.
        let result = breaker.call(|| async { Ok::<_, CallError>(1u32) }).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let breaker = breaker(1);
        breaker.try_acquire().unwrap();
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(30)).await;

        breaker.try_acquire().unwrap();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.try_acquire().unwrap();
        breaker.record_success();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(1);
        breaker.try_acquire().unwrap();
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(30)).await;

        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_budget() {
        let breaker = breaker(1);
        breaker.try_acquire().unwrap();
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(30)).await;

        // Budget of 2 probes; outcomes not yet recorded.
        breaker.try_acquire().unwrap();
        breaker.try_acquire().unwrap();
        let result = breaker.try_acquire();
        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trip_policy_filters_errors() {
        let breaker = CircuitBreaker::new(
            "database",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
        )
        .unwrap()
        .with_trip_policy(TripPolicy::transient_only());

        // A permanent error is re-raised without tripping the breaker.
        let result = breaker
            .call(|| async { Err::<(), _>(CallError::permanent("bad query")) })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Operation(_))));
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = breaker
            .call(|| async { Err::<(), _>(CallError::transport("reset")) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_rotation_preserves_state() {
        let breaker = breaker(3);
        for _ in 0..ROTATION_THRESHOLD {
            breaker
                .call(|| async { Ok::<_, CallError>(()) })
                .await
                .unwrap();
        }
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.success_count, 0);
        assert_eq!(snapshot.state_changes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manager_returns_same_instance() {
        let manager = CircuitBreakerManager::new();
        let a = manager.get_breaker("llm");
        let b = manager.get_breaker("llm");
        assert!(Arc::ptr_eq(&a, &b));

        let other = manager.get_breaker("database");
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manager_uses_service_defaults() {
        let manager = CircuitBreakerManager::new();
        let snapshot = manager.get_breaker("database").snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert!(manager.snapshot().contains_key("database"));
    }
}
