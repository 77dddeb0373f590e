//! The resilience orchestrator.
//!
//! [`ResilienceManager`] owns at most one instance of each sub-manager
//! (rate limits, circuit breakers, retries, fallbacks, health) and composes
//! them into per-service [`ServiceGuard`]s. A guard is the staged call path
//! most application code should use; it is composed once per service at
//! setup time, not rebuilt per invocation.
//!
//! Stage order is strict: rate-limit admission, then breaker admission,
//! then the operation under the retry engine, then the fallback chain on
//! residual failure. Any sub-manager may be absent, in which case its stage
//! is a passthrough; a manager with no stages at all simply invokes the
//! operation.

use std::sync::Arc;

use serde_json::Value;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitBreakerManager};
use crate::config::{services, ConfigError, ResilienceConfig};
use crate::error::{CallError, CorrelationId, ResilienceError};
use crate::fallback::{BoxCallFuture, FallbackError, FallbackHandler, FallbackManager};
use crate::health::{HealthReport, ServiceHealthMonitor};
use crate::rate_limit::{RateLimitManager, RateLimiter};
use crate::retry::{self, RetryConfig, RetryError, RetryManager, RetryPolicy};

/// Composed protection pipeline for one service.
///
/// Built by [`ResilienceManager::guard`]; holds resolved references to the
/// service's limiter, breaker, retry policy, and fallback handler. Stages
/// whose sub-manager (or per-service entry) is absent pass through.
pub struct ServiceGuard<T: Clone + Send + Sync + 'static> {
    service: String,
    limiter: Option<Arc<RateLimiter>>,
    breaker: Option<Arc<CircuitBreaker>>,
    retry: Option<(RetryConfig, RetryPolicy)>,
    fallback: Option<Arc<FallbackHandler<T>>>,
}

impl<T: Clone + Send + Sync + 'static> ServiceGuard<T> {
    /// The service this guard protects.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Run `op` through the full pipeline.
    ///
    /// `key` identifies the caller for rate limiting and doubles as the
    /// cache signature for fallback caching. Admission refusals are
    /// fail-fast: the operation is never invoked.
    pub async fn execute<F, Fut>(&self, key: &str, op: F) -> Result<T, ResilienceError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, CallError>> + Send + 'static,
    {
        let correlation_id = CorrelationId::new();

        if let Some(limiter) = &self.limiter {
            let decision = limiter.consume(key, 1);
            if !decision.allowed {
                let retry_after = decision.retry_after.unwrap_or_default();
                tracing::warn!(
                    service = %self.service,
                    key,
                    %correlation_id,
                    retry_after_secs = retry_after.as_secs_f64(),
                    "call rejected by rate limiter"
                );
                return Err(ResilienceError::RateLimited {
                    service: self.service.clone(),
                    retry_after,
                    correlation_id,
                });
            }
        }

        if let Some(breaker) = &self.breaker {
            if let Err(rejection) = breaker.try_acquire() {
                return Err(match rejection {
                    CircuitBreakerError::Open { retry_after, .. } => {
                        ResilienceError::CircuitOpen {
                            service: self.service.clone(),
                            retry_after,
                            correlation_id,
                        }
                    }
                    CircuitBreakerError::Operation(source) => ResilienceError::Operation {
                        service: self.service.clone(),
                        correlation_id,
                        source,
                    },
                });
            }
        }

        let result: Result<T, RetryError> = match &self.retry {
            Some((config, policy)) => retry::retry(&self.service, config, policy, &op).await,
            None => op().await.map_err(|source| RetryError::Aborted { source }),
        };

        if let Some(breaker) = &self.breaker {
            match &result {
                Ok(_) => breaker.record_success(),
                Err(error) => breaker.record_error(error.source_error()),
            }
        }

        match result {
            Ok(value) => {
                if let Some(handler) = &self.fallback {
                    handler.record_success(key, &value).await;
                }
                Ok(value)
            }
            Err(retry_error) => {
                let Some(handler) = &self.fallback else {
                    return Err(ResilienceError::from_retry(
                        &self.service,
                        correlation_id,
                        retry_error,
                    ));
                };

                let operation = move || -> BoxCallFuture<T> { Box::pin(op()) };
                let outcome = handler
                    .handle(
                        &self.service,
                        key,
                        retry_error.source_error(),
                        Some(&operation),
                    )
                    .await;

                match outcome {
                    Ok(value) => {
                        tracing::info!(
                            service = %self.service,
                            %correlation_id,
                            "primary call failed, fallback value substituted"
                        );
                        Ok(value)
                    }
                    Err(FallbackError::Disabled(_)) => Err(ResilienceError::from_retry(
                        &self.service,
                        correlation_id,
                        retry_error,
                    )),
                    Err(fallback_error) => {
                        tracing::warn!(
                            service = %self.service,
                            %correlation_id,
                            error = %fallback_error,
                            "fallback path failed after primary failure"
                        );
                        Err(ResilienceError::FallbackFailed {
                            service: self.service.clone(),
                            correlation_id,
                            original: retry_error.into_source(),
                            source: fallback_error,
                        })
                    }
                }
            }
        }
    }
}

/// Orchestrator owning one instance of each sub-manager.
pub struct ResilienceManager<T = Value>
where
    T: Clone + Send + Sync + 'static,
{
    config: ResilienceConfig,
    rate_limits: Option<Arc<RateLimitManager>>,
    breakers: Option<Arc<CircuitBreakerManager>>,
    retries: Option<Arc<RetryManager>>,
    fallbacks: Option<Arc<FallbackManager<T>>>,
    health: Option<Arc<ServiceHealthMonitor>>,
}

impl<T: Clone + Send + Sync + 'static> ResilienceManager<T> {
    /// Start building a manager with an explicit subset of stages.
    pub fn builder() -> ResilienceManagerBuilder<T> {
        ResilienceManagerBuilder::new()
    }

    /// Fully-armed manager: default policy table, every stage present,
    /// default fallback handlers for the well-known services.
    pub fn with_defaults() -> Result<Self, ConfigError> {
        let config = ResilienceConfig::validated()?;
        ResilienceManagerBuilder::new()
            .config(config.clone())
            .rate_limits(Arc::new(RateLimitManager::new()))
            .circuit_breakers(Arc::new(CircuitBreakerManager::from_config(config.clone())))
            .retries(Arc::new(RetryManager::from_config(&config)))
            .fallbacks(Arc::new(FallbackManager::with_default_handlers()))
            .health(Arc::new(ServiceHealthMonitor::new(config.health.clone())?))
            .build()
    }

    /// The manager's configuration.
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// The rate limit stage, if configured.
    pub fn rate_limits(&self) -> Option<&Arc<RateLimitManager>> {
        self.rate_limits.as_ref()
    }

    /// The circuit breaker stage, if configured.
    pub fn circuit_breakers(&self) -> Option<&Arc<CircuitBreakerManager>> {
        self.breakers.as_ref()
    }

    /// The retry stage, if configured.
    pub fn retries(&self) -> Option<&Arc<RetryManager>> {
        self.retries.as_ref()
    }

    /// The fallback stage, if configured.
    pub fn fallbacks(&self) -> Option<&Arc<FallbackManager<T>>> {
        self.fallbacks.as_ref()
    }

    /// The health monitor, if configured.
    pub fn health_monitor(&self) -> Option<&Arc<ServiceHealthMonitor>> {
        self.health.as_ref()
    }

    /// The stable health payload, when a monitor is configured.
    pub fn health_report(&self) -> Option<HealthReport> {
        self.health.as_ref().map(|monitor| monitor.report())
    }

    /// Compose the protection pipeline for a service.
    ///
    /// Resolution happens here, once: later additions of limiters or
    /// fallback handlers are picked up by new guards, not existing ones.
    pub fn guard(&self, service: &str) -> ServiceGuard<T> {
        ServiceGuard {
            service: service.to_string(),
            limiter: self
                .rate_limits
                .as_ref()
                .and_then(|manager| manager.limiter(service)),
            breaker: self
                .breakers
                .as_ref()
                .map(|manager| manager.get_breaker(service)),
            retry: self
                .retries
                .as_ref()
                .map(|manager| (manager.config_for(service), manager.policy_for(service))),
            fallback: self
                .fallbacks
                .as_ref()
                .and_then(|manager| manager.handler(service)),
        }
    }

    /// Guard for LLM provider calls.
    pub fn llm_guard(&self) -> ServiceGuard<T> {
        self.guard(services::LLM)
    }

    /// Guard for database queries.
    pub fn database_guard(&self) -> ServiceGuard<T> {
        self.guard(services::DATABASE)
    }

    /// Guard for MCP tool server invocations.
    pub fn mcp_guard(&self) -> ServiceGuard<T> {
        self.guard(services::MCP)
    }

    /// Guard for secret manager operations.
    pub fn secret_guard(&self) -> ServiceGuard<T> {
        self.guard(services::SECRET)
    }
}

/// Builder assembling a [`ResilienceManager`] from an explicit subset of
/// stages. Omitted stages are passthroughs in every guard.
pub struct ResilienceManagerBuilder<T = Value>
where
    T: Clone + Send + Sync + 'static,
{
    config: ResilienceConfig,
    rate_limits: Option<Arc<RateLimitManager>>,
    breakers: Option<Arc<CircuitBreakerManager>>,
    retries: Option<Arc<RetryManager>>,
    fallbacks: Option<Arc<FallbackManager<T>>>,
    health: Option<Arc<ServiceHealthMonitor>>,
}

impl<T: Clone + Send + Sync + 'static> ResilienceManagerBuilder<T> {
    pub fn new() -> Self {
        Self {
            config: ResilienceConfig::default(),
            rate_limits: None,
            breakers: None,
            retries: None,
            fallbacks: None,
            health: None,
        }
    }

    /// Replace the policy table.
    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rate_limits(mut self, manager: Arc<RateLimitManager>) -> Self {
        self.rate_limits = Some(manager);
        self
    }

    pub fn circuit_breakers(mut self, manager: Arc<CircuitBreakerManager>) -> Self {
        self.breakers = Some(manager);
        self
    }

    pub fn retries(mut self, manager: Arc<RetryManager>) -> Self {
        self.retries = Some(manager);
        self
    }

    pub fn fallbacks(mut self, manager: Arc<FallbackManager<T>>) -> Self {
        self.fallbacks = Some(manager);
        self
    }

    pub fn health(mut self, monitor: Arc<ServiceHealthMonitor>) -> Self {
        self.health = Some(monitor);
        self
    }

    /// Validate the configuration and wire per-service rate limits from
    /// the policy table into the rate limit stage.
    pub fn build(self) -> Result<ResilienceManager<T>, ConfigError> {
        self.config.validate()?;

        if let Some(rate_limits) = &self.rate_limits {
            for (service, policy) in &self.config.services {
                if let Some(rate_limit) = &policy.rate_limit {
                    if rate_limits.limiter(service).is_none() {
                        rate_limits.add_limiter(service.clone(), rate_limit.clone())?;
                    }
                }
            }
        }

        Ok(ResilienceManager {
            config: self.config,
            rate_limits: self.rate_limits,
            breakers: self.breakers,
            retries: self.retries,
            fallbacks: self.fallbacks,
            health: self.health,
        })
    }
}

impl<T: Clone + Send + Sync + 'static> Default for ResilienceManagerBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}
