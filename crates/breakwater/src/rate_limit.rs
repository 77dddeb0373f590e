//! Per-service, per-key admission control.
//!
//! Three interchangeable algorithms, selected by config:
//! - **Token bucket**: continuous refill at `max_requests / window` per
//!   second, up to capacity.
//! - **Sliding window**: exact timestamps of admitted requests in the
//!   trailing window.
//! - **Fixed window**: a counter that resets when the aligned window
//!   boundary advances.
//!
//! [`RateLimiter::check`] is a non-mutating probe; [`RateLimiter::consume`]
//! is the mutating admission decision production call paths use. A service
//! with no configured limiter is always admitted (fail-open).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::{duration_secs, duration_secs_f64, opt_duration_secs_f64, ConfigError};

/// Admission-control algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

/// Limiter configuration for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Which admission algorithm to run.
    pub algorithm: RateLimitAlgorithm,

    /// Requests admitted per window (bucket capacity for the token bucket).
    pub max_requests: u32,

    /// Window length. The token bucket refills at `max_requests / window`.
    #[serde(with = "duration_secs")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::TokenBucket,
            max_requests: 60,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Convenience constructor for the common requests-per-minute shape.
    pub fn per_minute(algorithm: RateLimitAlgorithm, requests_per_minute: u32) -> Self {
        Self {
            algorithm,
            max_requests: requests_per_minute,
            window: Duration::from_secs(60),
        }
    }

    /// Validate at construction; invalid configs fail fast.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::Invalid(
                "rate limit max_requests must be at least 1".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(ConfigError::Invalid(
                "rate limit window must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of an admission decision.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,

    /// Configured limit for the window.
    pub limit: u32,

    /// Requests (or tokens) consumed in the current window.
    pub used: u32,

    /// Requests still admissible without waiting.
    pub remaining: u32,

    /// Time until the window fully resets.
    #[serde(with = "duration_secs_f64")]
    pub reset_after: Duration,

    /// How long to wait before the denied request would be admitted.
    /// `None` when the request was allowed.
    #[serde(with = "opt_duration_secs_f64")]
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    /// Decision for a service with no limiter configured: always admitted.
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: u32::MAX,
            used: 0,
            remaining: u32::MAX,
            reset_after: Duration::ZERO,
            retry_after: None,
        }
    }
}

// Comparisons against fractional token counts tolerate float error from
// the refill arithmetic.
const TOKEN_EPSILON: f64 = 1e-9;

/// New token count after `elapsed` of continuous refill.
pub(crate) fn refill_tokens(tokens: f64, elapsed: Duration, capacity: f64, rate: f64) -> f64 {
    (tokens + elapsed.as_secs_f64() * rate).min(capacity)
}

#[derive(Debug, Clone)]
enum KeyState {
    Bucket { tokens: f64, last_refill: Instant },
    Sliding { admitted: VecDeque<Instant> },
    Fixed { count: u32, window_start: Instant },
}

/// Admission control for one service, keyed by caller identity.
///
/// State per `(service, key)` pair is created on first use and removed only
/// by [`RateLimiter::reset`]. All mutation happens under the limiter's own
/// lock; distinct services and keys are independent.
pub struct RateLimiter {
    service: String,
    config: RateLimitConfig,
    epoch: Instant,
    keys: Mutex<HashMap<String, KeyState>>,
}

impl RateLimiter {
    /// Create a limiter, validating the config up front.
    pub fn new(service: impl Into<String>, config: RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            service: service.into(),
            config,
            epoch: Instant::now(),
            keys: Mutex::new(HashMap::new()),
        })
    }

    /// The service this limiter protects.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The limiter's configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Non-mutating probe: would a single request be admitted right now?
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let keys = self.keys.lock();
        let mut state = keys
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.fresh_state(now));
        drop(keys);
        self.decide(&mut state, 1, now)
    }

    /// Mutating admission decision for `tokens` units of work.
    pub fn consume(&self, key: &str, tokens: u32) -> RateLimitDecision {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        let state = keys
            .entry(key.to_string())
            .or_insert_with(|| self.fresh_state(now));
        let decision = self.decide(state, tokens, now);
        if !decision.allowed {
            tracing::debug!(
                service = %self.service,
                key,
                used = decision.used,
                limit = decision.limit,
                retry_after = ?decision.retry_after,
                "rate limit denied request"
            );
        }
        decision
    }

    /// Drop all per-key state.
    pub fn reset(&self) {
        self.keys.lock().clear();
    }

    /// Drop one key's state.
    pub fn reset_key(&self, key: &str) {
        self.keys.lock().remove(key);
    }

    fn fresh_state(&self, now: Instant) -> KeyState {
        match self.config.algorithm {
            RateLimitAlgorithm::TokenBucket => KeyState::Bucket {
                tokens: self.config.max_requests as f64,
                last_refill: now,
            },
            RateLimitAlgorithm::SlidingWindow => KeyState::Sliding {
                admitted: VecDeque::new(),
            },
            RateLimitAlgorithm::FixedWindow => KeyState::Fixed {
                count: 0,
                window_start: self.aligned_window_start(now),
            },
        }
    }

    /// Window boundary at or before `now`, aligned to the limiter's epoch.
    fn aligned_window_start(&self, now: Instant) -> Instant {
        let window_nanos = self.config.window.as_nanos().max(1);
        let elapsed_nanos = now.duration_since(self.epoch).as_nanos();
        let periods = elapsed_nanos / window_nanos;
        self.epoch + Duration::from_nanos((periods * window_nanos) as u64)
    }

    fn decide(&self, state: &mut KeyState, tokens: u32, now: Instant) -> RateLimitDecision {
        let limit = self.config.max_requests;
        let window = self.config.window;

        match state {
            KeyState::Bucket {
                tokens: available,
                last_refill,
            } => {
                let capacity = limit as f64;
                let rate = capacity / window.as_secs_f64();
                *available = refill_tokens(
                    *available,
                    now.duration_since(*last_refill),
                    capacity,
                    rate,
                );
                *last_refill = now;

                let requested = tokens as f64;
                let allowed = *available + TOKEN_EPSILON >= requested;
                if allowed {
                    *available -= requested;
                }
                let remaining = available.max(0.0).floor() as u32;
                RateLimitDecision {
                    allowed,
                    limit,
                    used: limit.saturating_sub(remaining),
                    remaining,
                    reset_after: Duration::from_secs_f64((capacity - *available).max(0.0) / rate),
                    retry_after: (!allowed)
                        .then(|| Duration::from_secs_f64(requested / rate)),
                }
            }

            KeyState::Sliding { admitted } => {
                // Entries outside the trailing window are purged before
                // every decision.
                while admitted
                    .front()
                    .is_some_and(|&oldest| now.duration_since(oldest) >= window)
                {
                    admitted.pop_front();
                }

                let used = admitted.len() as u32;
                let allowed = used + tokens <= limit;
                if allowed {
                    for _ in 0..tokens {
                        admitted.push_back(now);
                    }
                }
                let used_after = admitted.len() as u32;
                let oldest_exit = admitted
                    .front()
                    .map(|&oldest| (oldest + window).saturating_duration_since(now))
                    .unwrap_or(Duration::ZERO);
                RateLimitDecision {
                    allowed,
                    limit,
                    used: used_after,
                    remaining: limit.saturating_sub(used_after),
                    reset_after: oldest_exit,
                    retry_after: (!allowed).then_some(oldest_exit),
                }
            }

            KeyState::Fixed {
                count,
                window_start,
            } => {
                let boundary = self.aligned_window_start(now);
                if boundary > *window_start {
                    *window_start = boundary;
                    *count = 0;
                }

                let allowed = *count + tokens <= limit;
                if allowed {
                    *count += tokens;
                }
                let reset_after = (*window_start + window).saturating_duration_since(now);
                RateLimitDecision {
                    allowed,
                    limit,
                    used: *count,
                    remaining: limit.saturating_sub(*count),
                    reset_after,
                    retry_after: (!allowed).then_some(reset_after),
                }
            }
        }
    }
}

/// Registry of limiters, one per service name.
///
/// A service with no registered limiter is always admitted: admission
/// control fails open by design, so a missing config can never take a
/// dependency offline.
pub struct RateLimitManager {
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimitManager {
    pub fn new() -> Self {
        Self {
            limiters: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the limiter for a service.
    pub fn add_limiter(
        &self,
        service: impl Into<String>,
        config: RateLimitConfig,
    ) -> Result<(), ConfigError> {
        let service = service.into();
        let limiter = Arc::new(RateLimiter::new(service.clone(), config)?);
        self.limiters.write().insert(service, limiter);
        Ok(())
    }

    /// The limiter for a service, if one is configured.
    pub fn limiter(&self, service: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.read().get(service).cloned()
    }

    /// Non-mutating probe against a service's limiter.
    pub fn check(&self, service: &str, key: &str) -> RateLimitDecision {
        match self.limiter(service) {
            Some(limiter) => limiter.check(key),
            None => RateLimitDecision::unlimited(),
        }
    }

    /// Mutating admission decision against a service's limiter.
    pub fn consume(&self, service: &str, key: &str, tokens: u32) -> RateLimitDecision {
        match self.limiter(service) {
            Some(limiter) => limiter.consume(key, tokens),
            None => RateLimitDecision::unlimited(),
        }
    }

    /// Drop all per-key state for a service.
    pub fn reset(&self, service: &str) {
        if let Some(limiter) = self.limiter(service) {
            limiter.reset();
        }
    }
}

impl Default for RateLimitManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(algorithm: RateLimitAlgorithm, max_requests: u32) -> RateLimiter {
        RateLimiter::new(
            "llm",
            RateLimitConfig {
                algorithm,
                max_requests,
                window: Duration::from_secs(60),
            },
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_admits_then_denies() {
        let limiter = limiter(RateLimitAlgorithm::TokenBucket, 5);

        for expected_remaining in (0..5).rev() {
            let decision = limiter.consume("user_123", 1);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        for _ in 0..3 {
            let decision = limiter.consume("user_123", 1);
            assert!(!decision.allowed);
            assert!(decision.retry_after.unwrap() > Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_refills_after_retry_after() {
        let limiter = limiter(RateLimitAlgorithm::TokenBucket, 5);

        for _ in 0..5 {
            assert!(limiter.consume("user_123", 1).allowed);
        }
        let denied = limiter.consume("user_123", 1);
        assert!(!denied.allowed);

        tokio::time::advance(denied.retry_after.unwrap()).await;
        assert!(limiter.consume("user_123", 1).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_exact_count() {
        let limiter = limiter(RateLimitAlgorithm::SlidingWindow, 3);

        assert!(limiter.consume("tenant", 1).allowed);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.consume("tenant", 1).allowed);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.consume("tenant", 1).allowed);

        let denied = limiter.consume("tenant", 1);
        assert!(!denied.allowed);
        // The oldest admission exits the window 40s from now.
        assert_eq!(denied.retry_after.unwrap(), Duration::from_secs(40));

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(limiter.consume("tenant", 1).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_resets_on_boundary() {
        let limiter = limiter(RateLimitAlgorithm::FixedWindow, 2);

        assert!(limiter.consume("k", 1).allowed);
        assert!(limiter.consume("k", 1).allowed);
        assert!(!limiter.consume("k", 1).allowed);

        tokio::time::advance(Duration::from_secs(60)).await;
        let decision = limiter.consume("k", 1);
        assert!(decision.allowed);
        assert_eq!(decision.used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_does_not_mutate() {
        let limiter = limiter(RateLimitAlgorithm::TokenBucket, 2);

        for _ in 0..10 {
            assert!(limiter.check("user").allowed);
        }
        // The probe consumed nothing.
        assert!(limiter.consume("user", 1).allowed);
        assert!(limiter.consume("user", 1).allowed);
        assert!(!limiter.consume("user", 1).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = limiter(RateLimitAlgorithm::TokenBucket, 1);
        assert!(limiter.consume("a", 1).allowed);
        assert!(!limiter.consume("a", 1).allowed);
        assert!(limiter.consume("b", 1).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfigured_service_fails_open() {
        let manager = RateLimitManager::new();
        let decision = manager.consume("llm", "user", 1);
        assert!(decision.allowed);
        assert!(decision.retry_after.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_state() {
        let limiter = limiter(RateLimitAlgorithm::TokenBucket, 1);
        assert!(limiter.consume("user", 1).allowed);
        assert!(!limiter.consume("user", 1).allowed);
        limiter.reset();
        assert!(limiter.consume("user", 1).allowed);
    }

    proptest::proptest! {
        // Refill never pushes the token count above capacity.
        #[test]
        fn prop_tokens_never_exceed_capacity(
            start in 0.0f64..100.0,
            elapsed_ms in 0u64..1_000_000,
            capacity in 1.0f64..100.0,
            rate in 0.001f64..50.0,
        ) {
            let start = start.min(capacity);
            let tokens = refill_tokens(
                start,
                Duration::from_millis(elapsed_ms),
                capacity,
                rate,
            );
            proptest::prop_assert!(tokens <= capacity);
            proptest::prop_assert!(tokens >= start);
        }
    }
}
