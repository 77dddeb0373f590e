//! Degradation strategies for calls that failed even after retries.
//!
//! Each service gets a [`FallbackHandler`]: an ordered chain of
//! [`FallbackStrategy`] implementations tried in sequence until one
//! produces a value. A strategy returning `Ok(None)` declines and the
//! chain moves on; if every strategy declines or fails, the last strategy
//! error is re-raised (or [`FallbackError::Exhausted`] if none errored).
//!
//! Every strategy invocation is bounded by the handler's
//! `fallback_timeout`, so the degraded path can never hang a caller.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::{duration_secs, services, ConfigError};
use crate::error::CallError;
use crate::retry::{self, BackoffKind, RetryConfig, RetryPolicy};

/// Boxed future of a protected operation.
pub type BoxCallFuture<T> = Pin<Box<dyn Future<Output = Result<T, CallError>> + Send>>;

/// A re-invokable protected operation, as seen by fallback strategies.
pub type OperationFn<T> = dyn Fn() -> BoxCallFuture<T> + Send + Sync;

/// Policy shared by every strategy in a handler's chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Master switch; a disabled handler declines every call.
    pub enabled: bool,

    /// How long cached results stay servable.
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,

    /// Cache capacity; the oldest quarter is evicted when exceeded.
    pub max_cache_size: usize,

    /// Advisory delay before the caller re-tries the primary path after a
    /// fallback engagement. Surfaced in log events.
    #[serde(with = "duration_secs")]
    pub retry_after: Duration,

    /// Deadline for each strategy invocation.
    #[serde(with = "duration_secs")]
    pub fallback_timeout: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl: Duration::from_secs(300),
            max_cache_size: 1000,
            retry_after: Duration::from_secs(60),
            fallback_timeout: Duration::from_secs(30),
        }
    }
}

impl FallbackConfig {
    /// Validate at construction; invalid configs fail fast.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache_size == 0 {
            return Err(ConfigError::Invalid(
                "fallback max_cache_size must be at least 1".to_string(),
            ));
        }
        if self.cache_ttl.is_zero() {
            return Err(ConfigError::Invalid(
                "fallback cache_ttl must be positive".to_string(),
            ));
        }
        if self.fallback_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "fallback fallback_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Errors from the degraded path.
#[derive(Error, Debug)]
pub enum FallbackError {
    /// A strategy ran and failed.
    #[error("fallback strategy '{strategy}' failed: {message}")]
    Strategy { strategy: String, message: String },

    /// A strategy exceeded the fallback deadline.
    #[error("fallback strategy '{strategy}' timed out after {timeout:?}")]
    Timeout { strategy: String, timeout: Duration },

    /// Every strategy declined and none produced an error of its own.
    #[error("all fallback strategies were exhausted")]
    Exhausted,

    /// Fallback is disabled for this service.
    #[error("fallback disabled for '{0}'")]
    Disabled(String),

    /// No handler is registered; the original operation error passes
    /// through unchanged.
    #[error(transparent)]
    Operation(CallError),
}

/// Everything a strategy can see about the failed call.
pub struct FallbackContext<'a, T> {
    /// The service whose primary call failed.
    pub service: &'a str,

    /// Identity of the call for cache lookups.
    pub cache_key: &'a str,

    /// The error the primary path ultimately failed with.
    pub error: &'a CallError,

    /// The handler's shared policy.
    pub config: &'a FallbackConfig,

    /// The original operation, re-invokable by strategies that want
    /// another attempt. Absent when the caller cannot safely re-run it.
    pub operation: Option<&'a OperationFn<T>>,
}

/// One degradation tactic in a handler's chain.
///
/// `recover` returns `Ok(Some(value))` to satisfy the call, `Ok(None)` to
/// decline and let the next strategy try, or `Err` on its own failure.
/// `record_success` lets caching strategies observe primary-path results.
#[async_trait]
pub trait FallbackStrategy<T: Clone + Send + Sync + 'static>: Send + Sync {
    /// Short name for log events.
    fn name(&self) -> &str;

    /// Attempt to produce a substitute result.
    async fn recover(&self, ctx: &FallbackContext<'_, T>) -> Result<Option<T>, FallbackError>;

    /// Observe a successful primary-path result.
    async fn record_success(&self, _key: &str, _value: &T, _config: &FallbackConfig) {}
}

/// Static canned response.
pub struct DefaultValueStrategy<T> {
    value: T,
}

impl<T> DefaultValueStrategy<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> FallbackStrategy<T> for DefaultValueStrategy<T> {
    fn name(&self) -> &str {
        "default_value"
    }

    async fn recover(&self, _ctx: &FallbackContext<'_, T>) -> Result<Option<T>, FallbackError> {
        Ok(Some(self.value.clone()))
    }
}

struct CacheEntry<T> {
    value: T,
    stored_at: Instant,
}

struct CacheInner<T> {
    map: HashMap<String, CacheEntry<T>>,
    // Keys in first-insertion order; eviction drops from the front.
    order: VecDeque<String>,
}

/// Serves the last successful result for an identical call signature,
/// bounded by `cache_ttl`. When the cache grows past `max_cache_size`, the
/// oldest 25% of entries (by first insertion) are evicted.
pub struct CachedResultStrategy<T> {
    inner: Mutex<CacheInner<T>>,
}

impl<T: Clone> CachedResultStrategy<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
    }
}

impl<T: Clone> Default for CachedResultStrategy<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> FallbackStrategy<T> for CachedResultStrategy<T> {
    fn name(&self) -> &str {
        "cached_result"
    }

    async fn recover(&self, ctx: &FallbackContext<'_, T>) -> Result<Option<T>, FallbackError> {
        let mut inner = self.inner.lock();
        let stale = match inner.map.get(ctx.cache_key) {
            Some(entry) => {
                if entry.stored_at.elapsed() <= ctx.config.cache_ttl {
                    return Ok(Some(entry.value.clone()));
                }
                true
            }
            None => false,
        };
        if stale {
            inner.map.remove(ctx.cache_key);
            inner.order.retain(|k| k.as_str() != ctx.cache_key);
        }
        Ok(None)
    }

    async fn record_success(&self, key: &str, value: &T, config: &FallbackConfig) {
        let mut inner = self.inner.lock();
        let entry = CacheEntry {
            value: value.clone(),
            stored_at: Instant::now(),
        };
        if inner.map.insert(key.to_string(), entry).is_none() {
            inner.order.push_back(key.to_string());
        }

        if inner.map.len() > config.max_cache_size {
            let evict = (inner.map.len() / 4).max(1);
            for _ in 0..evict {
                if let Some(oldest) = inner.order.pop_front() {
                    inner.map.remove(&oldest);
                }
            }
        }
    }
}

/// Calls a substitute operation under its own deadline.
pub struct AlternativeServiceStrategy<T> {
    alternative: Arc<dyn Fn() -> BoxCallFuture<T> + Send + Sync>,
    timeout: Duration,
}

impl<T> AlternativeServiceStrategy<T> {
    pub fn new<F, Fut>(alternative: F, timeout: Duration) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        Self {
            alternative: Arc::new(move || Box::pin(alternative())),
            timeout,
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> FallbackStrategy<T> for AlternativeServiceStrategy<T> {
    fn name(&self) -> &str {
        "alternative_service"
    }

    async fn recover(&self, ctx: &FallbackContext<'_, T>) -> Result<Option<T>, FallbackError> {
        match tokio::time::timeout(self.timeout, (self.alternative)()).await {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(error)) => Err(FallbackError::Strategy {
                strategy: self.name().to_string(),
                message: format!("alternative for '{}' failed: {error}", ctx.service),
            }),
            Err(_) => Err(FallbackError::Timeout {
                strategy: self.name().to_string(),
                timeout: self.timeout,
            }),
        }
    }
}

/// A short second retry loop over the original operation, for transient
/// blips that outlived the primary retry budget. Distinct from the main
/// retry engine: tighter attempts and delays, tuned for the degraded path.
pub struct RetryWithBackoffStrategy {
    config: RetryConfig,
    policy: RetryPolicy,
}

impl RetryWithBackoffStrategy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            policy: RetryPolicy::transient(),
        }
    }

    /// Two quick attempts with sub-second backoff.
    pub fn quick() -> Self {
        Self::new(RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
            backoff: BackoffKind::Exponential,
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> FallbackStrategy<T> for RetryWithBackoffStrategy {
    fn name(&self) -> &str {
        "retry_with_backoff"
    }

    async fn recover(&self, ctx: &FallbackContext<'_, T>) -> Result<Option<T>, FallbackError> {
        let Some(operation) = ctx.operation else {
            return Ok(None);
        };

        match retry::retry(ctx.service, &self.config, &self.policy, || operation()).await {
            Ok(value) => Ok(Some(value)),
            Err(error) => Err(FallbackError::Strategy {
                strategy: <RetryWithBackoffStrategy as FallbackStrategy<T>>::name(self).to_string(),
                message: error.source_error().to_string(),
            }),
        }
    }
}

/// Gates an inner strategy on a circuit breaker: while the breaker is
/// open, the inner strategy is skipped rather than hammering a dependency
/// already known to be down.
pub struct CircuitBreakerAwareStrategy<T> {
    breaker: Arc<CircuitBreaker>,
    inner: Arc<dyn FallbackStrategy<T>>,
}

impl<T: Clone + Send + Sync + 'static> CircuitBreakerAwareStrategy<T> {
    pub fn new(breaker: Arc<CircuitBreaker>, inner: Arc<dyn FallbackStrategy<T>>) -> Self {
        Self { breaker, inner }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> FallbackStrategy<T> for CircuitBreakerAwareStrategy<T> {
    fn name(&self) -> &str {
        "circuit_breaker_aware"
    }

    async fn recover(&self, ctx: &FallbackContext<'_, T>) -> Result<Option<T>, FallbackError> {
        if self.breaker.state() == CircuitState::Open {
            tracing::debug!(
                service = ctx.service,
                breaker = self.breaker.name(),
                "breaker open, skipping inner fallback strategy"
            );
            return Ok(None);
        }
        self.inner.recover(ctx).await
    }

    async fn record_success(&self, key: &str, value: &T, config: &FallbackConfig) {
        self.inner.record_success(key, value, config).await;
    }
}

/// Ordered chain of strategies for one service.
pub struct FallbackHandler<T: Clone + Send + Sync + 'static> {
    config: FallbackConfig,
    strategies: Vec<Arc<dyn FallbackStrategy<T>>>,
}

impl<T: Clone + Send + Sync + 'static> FallbackHandler<T> {
    /// Create an empty handler, validating the config up front.
    pub fn new(config: FallbackConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            strategies: Vec::new(),
        })
    }

    /// Append a strategy to the chain.
    pub fn with_strategy(mut self, strategy: Arc<dyn FallbackStrategy<T>>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// The handler's shared policy.
    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Try each strategy in order until one produces a value.
    pub async fn handle(
        &self,
        service: &str,
        cache_key: &str,
        error: &CallError,
        operation: Option<&OperationFn<T>>,
    ) -> Result<T, FallbackError> {
        if !self.config.enabled {
            return Err(FallbackError::Disabled(service.to_string()));
        }

        let ctx = FallbackContext {
            service,
            cache_key,
            error,
            config: &self.config,
            operation,
        };

        let mut last_error = None;
        for strategy in &self.strategies {
            match tokio::time::timeout(self.config.fallback_timeout, strategy.recover(&ctx)).await
            {
                Ok(Ok(Some(value))) => {
                    tracing::info!(
                        service,
                        strategy = strategy.name(),
                        retry_after_secs = self.config.retry_after.as_secs(),
                        "fallback engaged"
                    );
                    return Ok(value);
                }
                Ok(Ok(None)) => continue,
                Ok(Err(strategy_error)) => {
                    tracing::debug!(
                        service,
                        strategy = strategy.name(),
                        error = %strategy_error,
                        "fallback strategy failed"
                    );
                    last_error = Some(strategy_error);
                }
                Err(_) => {
                    let timeout_error = FallbackError::Timeout {
                        strategy: strategy.name().to_string(),
                        timeout: self.config.fallback_timeout,
                    };
                    tracing::debug!(service, error = %timeout_error, "fallback strategy timed out");
                    last_error = Some(timeout_error);
                }
            }
        }

        Err(last_error.unwrap_or(FallbackError::Exhausted))
    }

    /// Let caching strategies observe a successful primary result.
    pub async fn record_success(&self, key: &str, value: &T) {
        for strategy in &self.strategies {
            strategy.record_success(key, value, &self.config).await;
        }
    }
}

/// Registry of fallback handlers, one per service name.
pub struct FallbackManager<T: Clone + Send + Sync + 'static> {
    handlers: RwLock<HashMap<String, Arc<FallbackHandler<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> FallbackManager<T> {
    /// An empty manager; services without handlers propagate their errors.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Pre-wire the well-known services with a cached-result strategy
    /// followed by a short degraded-path retry.
    pub fn with_default_handlers() -> Self {
        let manager = Self::new();
        let retry_configs = [
            (services::LLM, 2u32, Duration::from_millis(500), Duration::from_secs(5)),
            (services::DATABASE, 3u32, Duration::from_millis(200), Duration::from_secs(2)),
            (services::MCP, 2u32, Duration::from_secs(1), Duration::from_secs(10)),
            (services::SECRET, 2u32, Duration::from_millis(500), Duration::from_secs(3)),
        ];

        for (service, max_attempts, base_delay, max_delay) in retry_configs {
            let retry = RetryConfig {
                max_attempts,
                base_delay,
                max_delay,
                multiplier: 2.0,
                jitter: true,
                backoff: BackoffKind::Exponential,
            };
            let handler = FallbackHandler {
                config: FallbackConfig::default(),
                strategies: Vec::new(),
            }
            .with_strategy(Arc::new(CachedResultStrategy::new()))
            .with_strategy(Arc::new(RetryWithBackoffStrategy::new(retry)));
            manager.register_handler(service, handler);
        }
        manager
    }

    /// Register (or replace) the handler for a service.
    pub fn register_handler(&self, service: impl Into<String>, handler: FallbackHandler<T>) {
        self.handlers.write().insert(service.into(), Arc::new(handler));
    }

    /// The handler for a service, if one is registered.
    pub fn handler(&self, service: &str) -> Option<Arc<FallbackHandler<T>>> {
        self.handlers.read().get(service).cloned()
    }

    /// Run `op`, degrading through the service's fallback chain on failure.
    ///
    /// With no handler registered the original error passes through
    /// unchanged. On primary success, caching strategies observe the value.
    pub async fn handle_service_call<F, Fut>(&self, service: &str, op: F) -> Result<T, FallbackError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        let operation = move || -> BoxCallFuture<T> { Box::pin(op()) };

        match operation().await {
            Ok(value) => {
                if let Some(handler) = self.handler(service) {
                    handler.record_success(service, &value).await;
                }
                Ok(value)
            }
            Err(error) => {
                let Some(handler) = self.handler(service) else {
                    return Err(FallbackError::Operation(error));
                };
                handler
                    .handle(service, service, &error, Some(&operation))
                    .await
            }
        }
    }

    /// Let caching strategies observe an externally produced success.
    pub async fn record_success(&self, service: &str, key: &str, value: &T) {
        if let Some(handler) = self.handler(service) {
            handler.record_success(key, value).await;
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for FallbackManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ctx<'a, T>(
        error: &'a CallError,
        config: &'a FallbackConfig,
        operation: Option<&'a OperationFn<T>>,
    ) -> FallbackContext<'a, T> {
        FallbackContext {
            service: "mcp",
            cache_key: "mcp:call",
            error,
            config,
            operation,
        }
    }

    #[tokio::test]
    async fn test_default_value_strategy() {
        let strategy = DefaultValueStrategy::new(json!({"error": "unavailable"}));
        let error = CallError::transport("down");
        let config = FallbackConfig::default();

        let value = strategy
            .recover(&ctx::<Value>(&error, &config, None))
            .await
            .unwrap();
        assert_eq!(value.unwrap(), json!({"error": "unavailable"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_result_ttl() {
        let strategy: CachedResultStrategy<Value> = CachedResultStrategy::new();
        let error = CallError::transport("down");
        let config = FallbackConfig {
            cache_ttl: Duration::from_secs(60),
            ..Default::default()
        };

        // Nothing cached yet.
        let miss = strategy.recover(&ctx(&error, &config, None)).await.unwrap();
        assert!(miss.is_none());

        FallbackStrategy::<Value>::record_success(&strategy, "mcp:call", &json!(1), &config).await;
        let hit = strategy.recover(&ctx(&error, &config, None)).await.unwrap();
        assert_eq!(hit.unwrap(), json!(1));

        tokio::time::advance(Duration::from_secs(61)).await;
        let stale = strategy.recover(&ctx(&error, &config, None)).await.unwrap();
        assert!(stale.is_none());
        assert!(strategy.is_empty());
    }

    #[tokio::test]
    async fn test_cache_evicts_oldest_quarter() {
        let strategy: CachedResultStrategy<Value> = CachedResultStrategy::new();
        let config = FallbackConfig {
            max_cache_size: 4,
            ..Default::default()
        };

        for i in 0..8 {
            FallbackStrategy::<Value>::record_success(
                &strategy,
                &format!("key{i}"),
                &json!(i),
                &config,
            )
            .await;
        }

        // Each insert past capacity evicts the oldest entry.
        assert_eq!(strategy.len(), 4);
        let error = CallError::transport("down");
        let old = FallbackContext::<Value> {
            service: "mcp",
            cache_key: "key0",
            error: &error,
            config: &config,
            operation: None,
        };
        assert!(strategy.recover(&old).await.unwrap().is_none());

        let newest = FallbackContext::<Value> {
            service: "mcp",
            cache_key: "key7",
            error: &error,
            config: &config,
            operation: None,
        };
        assert_eq!(strategy.recover(&newest).await.unwrap().unwrap(), json!(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_alternative_service_timeout() {
        let strategy = AlternativeServiceStrategy::new(
            || async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(json!("late"))
            },
            Duration::from_secs(1),
        );
        let error = CallError::transport("down");
        let config = FallbackConfig::default();

        let result = strategy.recover(&ctx::<Value>(&error, &config, None)).await;
        assert!(matches!(result, Err(FallbackError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_reinvokes_operation() {
        let strategy = RetryWithBackoffStrategy::quick();
        let error = CallError::transport("down");
        let config = FallbackConfig::default();

        let calls = Arc::new(AtomicU32::new(0));
        let op_calls = calls.clone();
        let operation = move || -> BoxCallFuture<Value> {
            let calls = op_calls.clone();
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(CallError::transport("still down"))
                } else {
                    Ok(json!("recovered"))
                }
            })
        };

        let value = strategy
            .recover(&ctx(&error, &config, Some(&operation)))
            .await
            .unwrap();
        assert_eq!(value.unwrap(), json!("recovered"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_declines_without_operation() {
        let strategy = RetryWithBackoffStrategy::quick();
        let error = CallError::transport("down");
        let config = FallbackConfig::default();

        let result = strategy
            .recover(&ctx::<Value>(&error, &config, None))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_aware_skips_while_open() {
        let breaker = Arc::new(
            CircuitBreaker::new(
                "mcp",
                crate::circuit_breaker::CircuitBreakerConfig {
                    failure_threshold: 1,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let strategy = CircuitBreakerAwareStrategy::new(
            breaker.clone(),
            Arc::new(DefaultValueStrategy::new(json!("inner"))),
        );
        let error = CallError::transport("down");
        let config = FallbackConfig::default();

        let value = strategy.recover(&ctx(&error, &config, None)).await.unwrap();
        assert_eq!(value.unwrap(), json!("inner"));

        breaker.try_acquire().unwrap();
        breaker.record_failure();
        let skipped = strategy.recover(&ctx(&error, &config, None)).await.unwrap();
        assert!(skipped.is_none());
    }

    #[tokio::test]
    async fn test_handler_chain_order_and_exhaustion() {
        let handler: FallbackHandler<Value> = FallbackHandler::new(FallbackConfig::default())
            .unwrap()
            .with_strategy(Arc::new(CachedResultStrategy::new()))
            .with_strategy(Arc::new(DefaultValueStrategy::new(json!("canned"))));

        let error = CallError::transport("down");
        // Cache declines, default value answers.
        let value = handler.handle("mcp", "sig", &error, None).await.unwrap();
        assert_eq!(value, json!("canned"));

        let empty: FallbackHandler<Value> =
            FallbackHandler::new(FallbackConfig::default()).unwrap();
        let result = empty.handle("mcp", "sig", &error, None).await;
        assert!(matches!(result, Err(FallbackError::Exhausted)));
    }

    #[tokio::test]
    async fn test_disabled_handler_declines() {
        let handler: FallbackHandler<Value> = FallbackHandler::new(FallbackConfig {
            enabled: false,
            ..Default::default()
        })
        .unwrap()
        .with_strategy(Arc::new(DefaultValueStrategy::new(json!("canned"))));

        let error = CallError::transport("down");
        let result = handler.handle("mcp", "sig", &error, None).await;
        assert!(matches!(result, Err(FallbackError::Disabled(_))));
    }

    #[tokio::test]
    async fn test_handle_service_call_substitutes_default_value() {
        let manager: FallbackManager<Value> = FallbackManager::new();
        let handler = FallbackHandler::new(FallbackConfig::default())
            .unwrap()
            .with_strategy(Arc::new(DefaultValueStrategy::new(
                json!({"error": "unavailable"}),
            )));
        manager.register_handler("mcp", handler);

        let value = manager
            .handle_service_call("mcp", || async {
                Err::<Value, _>(CallError::transport("tool server down"))
            })
            .await
            .unwrap();
        assert_eq!(value, json!({"error": "unavailable"}));
    }

    #[tokio::test]
    async fn test_no_handler_propagates_original_error() {
        let manager: FallbackManager<Value> = FallbackManager::new();
        let result = manager
            .handle_service_call("mcp", || async {
                Err::<Value, _>(CallError::permanent("broken"))
            })
            .await;
        assert!(matches!(
            result,
            Err(FallbackError::Operation(CallError::Permanent(_)))
        ));
    }

    #[tokio::test]
    async fn test_success_populates_default_handler_cache() {
        let manager: FallbackManager<Value> = FallbackManager::with_default_handlers();

        // A success primes the cache...
        let value = manager
            .handle_service_call("llm", || async { Ok(json!("completion")) })
            .await
            .unwrap();
        assert_eq!(value, json!("completion"));

        // ...and a later failure is served from it.
        let fallback = manager
            .handle_service_call("llm", || async {
                Err::<Value, _>(CallError::permanent("provider down"))
            })
            .await
            .unwrap();
        assert_eq!(fallback, json!("completion"));
    }
}
