//! # breakwater
//!
//! Composable resilience primitives for calls to unreliable dependencies:
//! LLM providers, databases, MCP tool servers, secret managers.
//!
//! Five components, each usable on its own:
//! - [`CircuitBreaker`]: per-service state machine that stops calling a
//!   failing dependency and probes recovery.
//! - [`retry`](crate::retry::retry): bounded attempts with exponential,
//!   linear, or fixed backoff and typed retryable-error classification.
//! - [`RateLimiter`]: token bucket, sliding window, or fixed window
//!   admission control per `(service, key)`.
//! - [`ServiceHealthMonitor`]: background probes with success-rate-based
//!   status aggregation and a stable JSON health payload.
//! - [`FallbackManager`]: ordered degradation strategies (cached result,
//!   default value, alternative call, short retry) for calls that failed
//!   even after retries.
//!
//! [`ResilienceManager`] composes them into one guarded call path per
//! service: rate-limit admission, breaker admission, retried call,
//! fallback on residual failure.
//!
//! All state is in-process and in-memory, scoped to one service instance.
//! Everything is async and safe to share across tasks; internal locks are
//! never held across an await.
//!
//! ## Example
//!
//! ```rust,ignore
//! use breakwater::{CallError, ResilienceManager};
//! use serde_json::json;
//!
//! let manager: ResilienceManager = ResilienceManager::with_defaults()?;
//! let llm = manager.llm_guard();
//!
//! let completion = llm
//!     .execute("tenant_42", || async {
//!         call_provider().await.map_err(|e| CallError::transport(e.to_string()))
//!     })
//!     .await?;
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod fallback;
pub mod health;
pub mod manager;
pub mod rate_limit;
pub mod retry;

// Re-export the main types at the crate root.
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerManager,
    CircuitBreakerSnapshot, CircuitState, TripPolicy,
};
pub use config::{services, ConfigError, ResilienceConfig, ServicePolicy};
pub use error::{CallError, CorrelationId, ResilienceError};
pub use fallback::{
    AlternativeServiceStrategy, CachedResultStrategy, CircuitBreakerAwareStrategy,
    DefaultValueStrategy, FallbackConfig, FallbackContext, FallbackError, FallbackHandler,
    FallbackManager, FallbackStrategy, RetryWithBackoffStrategy,
};
pub use health::{
    run_check, CustomHealthChecker, DatabaseHealthChecker, HealthCheckResult, HealthChecker,
    HealthError, HealthMonitorConfig, HealthReport, HealthSnapshot, HealthStatus,
    HttpHealthChecker, RedisHealthChecker, ServiceHealthMetrics, ServiceHealthMonitor,
};
pub use manager::{ResilienceManager, ResilienceManagerBuilder, ServiceGuard};
pub use rate_limit::{
    RateLimitAlgorithm, RateLimitConfig, RateLimitDecision, RateLimitManager, RateLimiter,
};
pub use retry::{BackoffKind, RetryConfig, RetryContext, RetryError, RetryManager, RetryPolicy};
