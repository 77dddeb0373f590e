//! Retry with bounded attempts and pluggable backoff.
//!
//! The engine wraps an async operation factory and re-invokes it on
//! transient failure, sleeping between attempts according to a
//! [`BackoffKind`]. Which errors are worth retrying is decided by a typed
//! [`RetryPolicy`] predicate on the error value, not by matching on error
//! type names.
//!
//! Backoff sleeps are cooperative suspension points: they never block other
//! in-flight operations and cancelling the enclosing task cancels the sleep.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{duration_ms, ConfigError, ResilienceConfig};
use crate::error::CallError;

/// Backoff curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// `base * multiplier^(attempt-1)`, capped at `max_delay`.
    Exponential,
    /// `base * attempt`, capped at `max_delay`.
    Linear,
    /// `base` every time.
    Fixed,
}

/// Retry attempt and backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of invocations, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,

    /// Cap on any single backoff delay (before jitter).
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Growth factor for exponential backoff.
    pub multiplier: f64,

    /// Randomize delays to avoid synchronized retry storms.
    pub jitter: bool,

    /// Backoff curve.
    pub backoff: BackoffKind,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            backoff: BackoffKind::Exponential,
        }
    }
}

impl RetryConfig {
    /// Validate at construction; invalid configs fail fast.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if self.base_delay.is_zero() {
            return Err(ConfigError::Invalid(
                "retry base_delay must be positive".to_string(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::Invalid(format!(
                "retry max_delay {:?} must be at least base_delay {:?}",
                self.max_delay, self.base_delay
            )));
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Typed classifier deciding whether an error is worth another attempt.
///
/// Defaults to [`CallError::is_transient`]. Callers can supply their own
/// predicate when a service has unusual failure semantics.
#[derive(Clone)]
pub struct RetryPolicy {
    classify: Arc<dyn Fn(&CallError) -> bool + Send + Sync>,
}

impl RetryPolicy {
    /// Build a policy from a predicate.
    pub fn new(classify: impl Fn(&CallError) -> bool + Send + Sync + 'static) -> Self {
        Self {
            classify: Arc::new(classify),
        }
    }

    /// Retry transient errors only (the default).
    pub fn transient() -> Self {
        Self::new(CallError::is_transient)
    }

    /// Retry every error.
    pub fn always() -> Self {
        Self::new(|_| true)
    }

    /// Never retry.
    pub fn never() -> Self {
        Self::new(|_| false)
    }

    /// Whether the policy allows retrying this error.
    pub fn is_retryable(&self, error: &CallError) -> bool {
        (self.classify)(error)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::transient()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy").finish_non_exhaustive()
    }
}

/// Outcome of a spent retry loop.
#[derive(Error, Debug)]
pub enum RetryError {
    /// Every allowed attempt failed; carries the final error.
    #[error("retries exhausted after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        source: CallError,
    },

    /// The policy classified the error as not retryable.
    #[error("operation failed with a non-retryable error")]
    Aborted {
        #[source]
        source: CallError,
    },
}

impl RetryError {
    /// The underlying operation error.
    pub fn into_source(self) -> CallError {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Aborted { source } => source,
        }
    }

    /// Borrow the underlying operation error.
    pub fn source_error(&self) -> &CallError {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Aborted { source } => source,
        }
    }
}

/// Per-invocation retry bookkeeping. Created at call start, dropped at
/// call completion.
#[derive(Debug)]
pub struct RetryContext {
    /// Failed attempts so far.
    pub attempt: u32,

    /// When the first attempt started.
    pub started_at: Instant,

    /// The most recent attempt's error.
    pub last_error: Option<CallError>,

    /// Accumulated backoff sleep time.
    pub total_delay: Duration,
}

impl RetryContext {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            started_at: Instant::now(),
            last_error: None,
            total_delay: Duration::ZERO,
        }
    }

    /// Record a failed attempt and decide whether another is allowed.
    pub fn should_retry(&mut self, config: &RetryConfig) -> bool {
        self.attempt += 1;
        self.attempt < config.max_attempts
    }

    /// Backoff delay before the next attempt, with per-curve jitter.
    pub fn next_delay(&self, config: &RetryConfig) -> Duration {
        compute_delay(config, self.attempt)
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Delay for the given (1-based) failed-attempt count.
pub(crate) fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let base = config.base_delay.as_secs_f64();
    let cap = config.max_delay.as_secs_f64();

    let (raw, jitter_range) = match config.backoff {
        BackoffKind::Exponential => (
            base * config.multiplier.powi(attempt as i32 - 1),
            (0.75, 1.25),
        ),
        BackoffKind::Linear => (base * attempt as f64, (0.8, 1.2)),
        BackoffKind::Fixed => (base, (0.9, 1.1)),
    };

    let mut delay = raw.min(cap);
    if config.jitter {
        let factor = rand::thread_rng().gen_range(jitter_range.0..=jitter_range.1);
        delay *= factor;
    }
    Duration::from_secs_f64(delay)
}

/// Run `op` under the retry policy, sleeping between attempts.
///
/// Returns the first success, [`RetryError::Aborted`] when the policy
/// refuses an error, or [`RetryError::Exhausted`] once `max_attempts`
/// invocations have failed. The final error is carried unchanged.
pub async fn retry<T, F, Fut>(
    service: &str,
    config: &RetryConfig,
    policy: &RetryPolicy,
    op: F,
) -> Result<T, RetryError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, CallError>>,
{
    let mut ctx = RetryContext::new();
    loop {
        match op().await {
            Ok(value) => {
                if ctx.attempt > 0 {
                    tracing::debug!(
                        service,
                        attempts = ctx.attempt + 1,
                        total_delay_ms = ctx.total_delay.as_millis() as u64,
                        "operation succeeded after retries"
                    );
                }
                return Ok(value);
            }
            Err(error) => {
                ctx.last_error = Some(error.clone());
                if !policy.is_retryable(&error) {
                    return Err(RetryError::Aborted { source: error });
                }
                if !ctx.should_retry(config) {
                    tracing::warn!(
                        service,
                        attempts = ctx.attempt,
                        error = %error,
                        "retries exhausted"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: ctx.attempt,
                        source: error,
                    });
                }
                let delay = ctx.next_delay(config);
                tracing::debug!(
                    service,
                    attempt = ctx.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                ctx.total_delay += delay;
            }
        }
    }
}

/// Per-service retry configuration registry.
pub struct RetryManager {
    configs: RwLock<HashMap<String, RetryConfig>>,
    policies: RwLock<HashMap<String, RetryPolicy>>,
}

impl RetryManager {
    /// Build from the default per-service policy table.
    pub fn new() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }

    /// Build from an explicit configuration.
    pub fn from_config(config: &ResilienceConfig) -> Self {
        let configs = config
            .services
            .iter()
            .map(|(name, policy)| (name.clone(), policy.retry.clone()))
            .collect();
        Self {
            configs: RwLock::new(configs),
            policies: RwLock::new(HashMap::new()),
        }
    }

    /// The retry config for a service (built-in default for unknown names).
    pub fn config_for(&self, service: &str) -> RetryConfig {
        self.configs
            .read()
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace a service's retry config.
    pub fn set_config(&self, service: impl Into<String>, config: RetryConfig) {
        self.configs.write().insert(service.into(), config);
    }

    /// The retry policy for a service (transient-only by default).
    pub fn policy_for(&self, service: &str) -> RetryPolicy {
        self.policies
            .read()
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace a service's retry policy.
    pub fn set_policy(&self, service: impl Into<String>, policy: RetryPolicy) {
        self.policies.write().insert(service.into(), policy);
    }

    /// Run `op` under the service's configured retry policy.
    pub async fn retry<T, F, Fut>(&self, service: &str, op: F) -> Result<T, RetryError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, CallError>>,
    {
        let config = self.config_for(service);
        let policy = self.policy_for(service);
        retry(service, &config, &policy, op).await
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new()
    }
}
