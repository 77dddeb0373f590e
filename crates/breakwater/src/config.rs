//! Configuration for the resilience components.
//!
//! All configuration is explicit and immutable: each component takes a
//! config struct at construction, validation happens up front via
//! [`ResilienceConfig::validated`] (or the per-struct `validate` methods),
//! and an invalid value fails fast instead of surfacing at first use.
//!
//! Defaults are tuned per dependency class: LLM providers tolerate long
//! exponential backoff, databases get more attempts with a tighter cap,
//! MCP tool servers are slow to recover, secret managers fail fast.
//!
//! Environment overrides use `BREAKWATER_<SERVICE>_<KNOB>` variables with
//! human-readable durations (`"500ms"`, `"2m"`), parsed with `humantime`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::fallback::FallbackConfig;
use crate::health::HealthMonitorConfig;
use crate::rate_limit::{RateLimitAlgorithm, RateLimitConfig};
use crate::retry::{BackoffKind, RetryConfig};

/// Well-known service names the default policy table covers.
pub mod services {
    /// LLM provider calls.
    pub const LLM: &str = "llm";
    /// Database queries.
    pub const DATABASE: &str = "database";
    /// MCP tool server invocations.
    pub const MCP: &str = "mcp";
    /// Secret manager operations.
    pub const SECRET: &str = "secret";

    /// All well-known service names.
    pub const ALL: [&str; 4] = [LLM, DATABASE, MCP, SECRET];
}

/// Errors from configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid environment value for {var}: {message}")]
    Env { var: String, message: String },
}

/// Serialize a `Duration` as whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serialize a `Duration` as whole milliseconds, for sub-second delays.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Serialize a `Duration` as fractional seconds, for observed timings.
pub(crate) mod duration_secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

/// `Option<Duration>` as fractional seconds.
pub(crate) mod opt_duration_secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}

/// The full protection policy for one named service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePolicy {
    /// Circuit breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry attempts and backoff.
    pub retry: RetryConfig,

    /// Admission control. `None` means no limiter: requests are always
    /// admitted (fail-open, matching the manager-level default).
    pub rate_limit: Option<RateLimitConfig>,

    /// Degraded-path policy shared by the service's fallback strategies.
    pub fallback: FallbackConfig,
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: None,
            fallback: FallbackConfig::default(),
        }
    }
}

impl ServicePolicy {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        self.fallback.validate()?;
        Ok(())
    }
}

/// Top-level configuration: one policy per service plus health monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Per-service policies, keyed by service name.
    pub services: HashMap<String, ServicePolicy>,

    /// Health monitor cadence and probe timeout.
    pub health: HealthMonitorConfig,
}

impl Default for ResilienceConfig {
    /// The default policy table for the well-known services.
    fn default() -> Self {
        let mut services = HashMap::new();

        services.insert(
            services::LLM.to_string(),
            ServicePolicy {
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 5,
                    recovery_timeout: Duration::from_secs(60),
                    success_threshold: 3,
                    half_open_max_calls: 3,
                },
                retry: RetryConfig {
                    max_attempts: 3,
                    base_delay: Duration::from_secs(1),
                    max_delay: Duration::from_secs(60),
                    multiplier: 2.0,
                    jitter: true,
                    backoff: BackoffKind::Exponential,
                },
                rate_limit: None,
                fallback: FallbackConfig::default(),
            },
        );

        services.insert(
            services::DATABASE.to_string(),
            ServicePolicy {
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 3,
                    recovery_timeout: Duration::from_secs(30),
                    success_threshold: 2,
                    half_open_max_calls: 2,
                },
                retry: RetryConfig {
                    max_attempts: 5,
                    base_delay: Duration::from_millis(500),
                    max_delay: Duration::from_secs(30),
                    multiplier: 1.5,
                    jitter: true,
                    backoff: BackoffKind::Exponential,
                },
                rate_limit: None,
                fallback: FallbackConfig::default(),
            },
        );

        services.insert(
            services::MCP.to_string(),
            ServicePolicy {
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 5,
                    recovery_timeout: Duration::from_secs(120),
                    success_threshold: 3,
                    half_open_max_calls: 3,
                },
                retry: RetryConfig {
                    max_attempts: 3,
                    base_delay: Duration::from_secs(2),
                    max_delay: Duration::from_secs(120),
                    multiplier: 2.0,
                    jitter: true,
                    backoff: BackoffKind::Exponential,
                },
                rate_limit: None,
                fallback: FallbackConfig::default(),
            },
        );

        services.insert(
            services::SECRET.to_string(),
            ServicePolicy {
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 3,
                    recovery_timeout: Duration::from_secs(60),
                    success_threshold: 2,
                    half_open_max_calls: 2,
                },
                retry: RetryConfig {
                    max_attempts: 2,
                    base_delay: Duration::from_secs(1),
                    max_delay: Duration::from_secs(10),
                    multiplier: 2.0,
                    jitter: true,
                    backoff: BackoffKind::Exponential,
                },
                rate_limit: None,
                fallback: FallbackConfig::default(),
            },
        );

        Self {
            services,
            health: HealthMonitorConfig::default(),
        }
    }
}

impl ResilienceConfig {
    /// Build the default table and fail fast if it is somehow invalid.
    pub fn validated() -> Result<Self, ConfigError> {
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load the default table with environment overrides applied.
    ///
    /// Recognized variables, per well-known service (upper-cased name):
    /// `BREAKWATER_<SVC>_MAX_ATTEMPTS`, `BREAKWATER_<SVC>_BASE_DELAY`,
    /// `BREAKWATER_<SVC>_MAX_DELAY`, `BREAKWATER_<SVC>_RETRY_MULTIPLIER`,
    /// `BREAKWATER_<SVC>_FAILURE_THRESHOLD`,
    /// `BREAKWATER_<SVC>_RECOVERY_TIMEOUT`,
    /// `BREAKWATER_<SVC>_REQUESTS_PER_MINUTE`,
    /// `BREAKWATER_<SVC>_RATE_STRATEGY` (`token_bucket` | `sliding_window`
    /// | `fixed_window`), plus `BREAKWATER_HEALTH_CHECK_INTERVAL` and
    /// `BREAKWATER_HEALTH_CHECK_TIMEOUT`. Durations are humantime strings.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for service in services::ALL {
            let prefix = format!("BREAKWATER_{}", service.to_uppercase());
            let Some(policy) = config.services.get_mut(service) else {
                continue;
            };

            if let Some(v) = env_u32(&format!("{prefix}_MAX_ATTEMPTS"))? {
                policy.retry.max_attempts = v;
            }
            if let Some(v) = env_duration(&format!("{prefix}_BASE_DELAY"))? {
                policy.retry.base_delay = v;
            }
            if let Some(v) = env_duration(&format!("{prefix}_MAX_DELAY"))? {
                policy.retry.max_delay = v;
            }
            if let Some(v) = env_f64(&format!("{prefix}_RETRY_MULTIPLIER"))? {
                policy.retry.multiplier = v;
            }
            if let Some(v) = env_u32(&format!("{prefix}_FAILURE_THRESHOLD"))? {
                policy.circuit_breaker.failure_threshold = v;
            }
            if let Some(v) = env_duration(&format!("{prefix}_RECOVERY_TIMEOUT"))? {
                policy.circuit_breaker.recovery_timeout = v;
            }
            if let Some(rpm) = env_u32(&format!("{prefix}_REQUESTS_PER_MINUTE"))? {
                let algorithm = match env_string(&format!("{prefix}_RATE_STRATEGY")) {
                    Some(name) => parse_algorithm(&name).ok_or_else(|| ConfigError::Env {
                        var: format!("{prefix}_RATE_STRATEGY"),
                        message: format!("unknown rate limit strategy '{name}'"),
                    })?,
                    None => RateLimitAlgorithm::TokenBucket,
                };
                policy.rate_limit = Some(RateLimitConfig {
                    algorithm,
                    max_requests: rpm,
                    window: Duration::from_secs(60),
                });
            }
        }

        if let Some(v) = env_duration("BREAKWATER_HEALTH_CHECK_INTERVAL")? {
            config.health.check_interval = v;
        }
        if let Some(v) = env_duration("BREAKWATER_HEALTH_CHECK_TIMEOUT")? {
            config.health.check_timeout = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate every service policy and the health section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, policy) in &self.services {
            policy
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("service '{name}': {e}")))?;
        }
        self.health.validate()?;
        Ok(())
    }

    /// The policy for a service, or the built-in default for unknown names.
    pub fn policy(&self, service: &str) -> ServicePolicy {
        self.services.get(service).cloned().unwrap_or_default()
    }
}

fn parse_algorithm(name: &str) -> Option<RateLimitAlgorithm> {
    match name {
        "token_bucket" => Some(RateLimitAlgorithm::TokenBucket),
        "sliding_window" => Some(RateLimitAlgorithm::SlidingWindow),
        "fixed_window" => Some(RateLimitAlgorithm::FixedWindow),
        _ => None,
    }
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn env_u32(var: &str) -> Result<Option<u32>, ConfigError> {
    match env_string(var) {
        Some(v) => v
            .parse::<u32>()
            .map(Some)
            .map_err(|e| ConfigError::Env {
                var: var.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

fn env_f64(var: &str) -> Result<Option<f64>, ConfigError> {
    match env_string(var) {
        Some(v) => v
            .parse::<f64>()
            .map(Some)
            .map_err(|e| ConfigError::Env {
                var: var.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

fn env_duration(var: &str) -> Result<Option<Duration>, ConfigError> {
    match env_string(var) {
        Some(v) => humantime::parse_duration(&v)
            .map(Some)
            .map_err(|e| ConfigError::Env {
                var: var.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}
