//! Error types shared across the resilience components.
//!
//! Two layers of errors exist:
//! - [`CallError`] is what a protected operation fails with. It carries a
//!   typed transience marker so retry and breaker policies can classify
//!   errors without matching on type names or strings.
//! - [`ResilienceError`] is what the orchestrated call path surfaces to the
//!   caller. Every variant carries the service name and a correlation id so
//!   a failure can be traced through logs.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::fallback::FallbackError;
use crate::retry::RetryError;

/// Correlation id attached to every orchestrated call.
///
/// Generated once per call and threaded through log events and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh correlation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Failure of a protected operation.
///
/// This is the error vocabulary every wrapped callable speaks. The variants
/// map onto how unreliable dependencies actually fail: a hang, a broken
/// connection, an upstream status, an upstream throttle, or a fault that no
/// amount of retrying will fix.
#[derive(Error, Debug, Clone)]
pub enum CallError {
    /// The operation did not complete within its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Connection-level failure (DNS, TCP reset, TLS, broken pipe).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The dependency answered with an error status.
    #[error("upstream error: {status} - {message}")]
    Upstream { status: u16, message: String },

    /// The dependency throttled the call.
    #[error("upstream rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// A failure that retrying cannot fix (bad request, auth, invariant).
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl CallError {
    /// Whether this error class is worth retrying.
    ///
    /// Timeouts, transport faults, throttles, and 5xx/429 upstream answers
    /// are transient; everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            CallError::Timeout(_) | CallError::Transport(_) | CallError::RateLimited { .. } => true,
            CallError::Upstream { status, .. } => *status >= 500 || *status == 429,
            CallError::Permanent(_) => false,
        }
    }

    /// Shorthand for a transport failure.
    pub fn transport(message: impl Into<String>) -> Self {
        CallError::Transport(message.into())
    }

    /// Shorthand for a permanent failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        CallError::Permanent(message.into())
    }
}

/// Errors surfaced by the orchestrated call path.
///
/// Admission refusals (`CircuitOpen`, `RateLimited`) are fail-fast: the
/// operation was never invoked. `RetryExhausted` and `Operation` carry the
/// operation's own error after local retries were spent or refused.
/// `FallbackFailed` means the degraded path failed too and chains both ends.
#[derive(Error, Debug)]
pub enum ResilienceError {
    /// The circuit breaker refused admission without invoking the operation.
    #[error("circuit open for '{service}', retry after {retry_after:?} [{correlation_id}]")]
    CircuitOpen {
        service: String,
        retry_after: Option<Duration>,
        correlation_id: CorrelationId,
    },

    /// The rate limiter refused admission.
    #[error("rate limit exceeded for '{service}', retry after {retry_after:?} [{correlation_id}]")]
    RateLimited {
        service: String,
        retry_after: Duration,
        correlation_id: CorrelationId,
    },

    /// Retry attempts were exhausted; no fallback was available or configured.
    #[error("retries exhausted for '{service}' after {attempts} attempts [{correlation_id}]")]
    RetryExhausted {
        service: String,
        attempts: u32,
        correlation_id: CorrelationId,
        #[source]
        source: CallError,
    },

    /// The operation failed with an error the retry policy refused to retry.
    #[error("operation failed for '{service}' [{correlation_id}]")]
    Operation {
        service: String,
        correlation_id: CorrelationId,
        #[source]
        source: CallError,
    },

    /// Every fallback strategy failed after the primary call was spent.
    #[error("all fallbacks failed for '{service}': {original} [{correlation_id}]")]
    FallbackFailed {
        service: String,
        correlation_id: CorrelationId,
        original: CallError,
        #[source]
        source: FallbackError,
    },
}

impl ResilienceError {
    /// The service name this error belongs to.
    pub fn service(&self) -> &str {
        match self {
            ResilienceError::CircuitOpen { service, .. }
            | ResilienceError::RateLimited { service, .. }
            | ResilienceError::RetryExhausted { service, .. }
            | ResilienceError::Operation { service, .. }
            | ResilienceError::FallbackFailed { service, .. } => service,
        }
    }

    /// The correlation id for tracing this call through logs.
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            ResilienceError::CircuitOpen { correlation_id, .. }
            | ResilienceError::RateLimited { correlation_id, .. }
            | ResilienceError::RetryExhausted { correlation_id, .. }
            | ResilienceError::Operation { correlation_id, .. }
            | ResilienceError::FallbackFailed { correlation_id, .. } => *correlation_id,
        }
    }

    /// Whether this is an admission refusal (no attempt was made).
    pub fn is_admission_refusal(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen { .. } | ResilienceError::RateLimited { .. }
        )
    }

    pub(crate) fn from_retry(
        service: &str,
        correlation_id: CorrelationId,
        error: RetryError,
    ) -> Self {
        match error {
            RetryError::Exhausted { attempts, source } => ResilienceError::RetryExhausted {
                service: service.to_string(),
                attempts,
                correlation_id,
                source,
            },
            RetryError::Aborted { source } => ResilienceError::Operation {
                service: service.to_string(),
                correlation_id,
                source,
            },
        }
    }
}
