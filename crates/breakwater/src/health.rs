//! Health monitoring for external dependencies.
//!
//! A [`ServiceHealthMonitor`] owns a set of pluggable [`HealthChecker`]s
//! and a background task that runs them all concurrently on an interval.
//! Probe failures never propagate into call paths: a hung or erroring
//! checker becomes a synthesized `Unhealthy` result, observable only via
//! health queries and the [`HealthReport`].
//!
//! Checker variants cover the common dependency shapes: a database probe
//! (the `SELECT 1` equivalent lives in the caller's connection closure, the
//! driver itself is out of scope here), an HTTP GET with an expected
//! status, a Redis-style PING with optional INFO details, and a fully
//! custom async probe.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{duration_secs, duration_secs_f64, ConfigError};

/// Bounded per-service history of check results.
const HISTORY_LIMIT: usize = 100;

/// Derived health of a monitored service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Checks are passing.
    Healthy,
    /// Elevated failure rate but still operational.
    Degraded,
    /// Failing streak or majority of checks failing.
    Unhealthy,
    /// No checks recorded yet.
    Unknown,
}

impl HealthStatus {
    /// Whether the service can still serve traffic.
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Monitor cadence and probe deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    /// How often the background loop runs all checkers.
    #[serde(with = "duration_secs")]
    pub check_interval: Duration,

    /// Deadline for a single probe; a slower probe is recorded unhealthy.
    #[serde(with = "duration_secs")]
    pub check_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(10),
        }
    }
}

impl HealthMonitorConfig {
    /// Validate at construction; invalid configs fail fast.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "health check_interval must be positive".to_string(),
            ));
        }
        if self.check_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "health check_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of one probe run.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub service: String,
    pub status: HealthStatus,

    /// How long the probe took (or how long until it was cut off).
    #[serde(with = "duration_secs_f64")]
    pub response_time: Duration,

    /// Error description for failed probes.
    pub error: Option<String>,

    /// Checker-specific details (status codes, INFO payloads).
    pub details: Option<serde_json::Value>,

    pub checked_at: DateTime<Utc>,
}

/// A pluggable probe for one dependency.
///
/// `check` returns `Ok` with optional details when the dependency is
/// reachable and functional, `Err` otherwise. Probes are always run through
/// [`run_check`], which enforces the deadline and converts failures into
/// synthesized results.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// The service name this checker reports under.
    fn name(&self) -> &str;

    /// Probe the dependency once.
    async fn check(&self) -> anyhow::Result<Option<serde_json::Value>>;
}

type ProbeFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type DetailProbeFn =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync>;
type BoolProbeFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Probes a database by running a trivial query through a supplied
/// connection closure.
pub struct DatabaseHealthChecker {
    name: String,
    probe: ProbeFn,
}

impl DatabaseHealthChecker {
    /// `probe` should acquire a connection and run `SELECT 1` (or the
    /// engine's equivalent), returning `Err` on any failure.
    pub fn new<F, Fut>(name: impl Into<String>, probe: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            probe: Arc::new(move || Box::pin(probe())),
        }
    }
}

#[async_trait]
impl HealthChecker for DatabaseHealthChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> anyhow::Result<Option<serde_json::Value>> {
        (self.probe)().await?;
        Ok(None)
    }
}

/// Probes an HTTP endpoint with GET and compares the status code.
pub struct HttpHealthChecker {
    name: String,
    url: String,
    expected_status: u16,
    client: reqwest::Client,
}

impl HttpHealthChecker {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            expected_status: 200,
            client: reqwest::Client::new(),
        }
    }

    /// Expect a status other than 200.
    pub fn with_expected_status(mut self, status: u16) -> Self {
        self.expected_status = status;
        self
    }

    /// Reuse an existing client (connection pools, proxies, TLS config).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> anyhow::Result<Option<serde_json::Value>> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status().as_u16();
        if status != self.expected_status {
            anyhow::bail!(
                "unexpected status {status}, expected {}",
                self.expected_status
            );
        }
        Ok(Some(serde_json::json!({ "status_code": status })))
    }
}

/// Probes a Redis-style dependency with a supplied PING closure and an
/// optional INFO closure for details.
pub struct RedisHealthChecker {
    name: String,
    ping: ProbeFn,
    info: Option<DetailProbeFn>,
}

impl RedisHealthChecker {
    pub fn new<F, Fut>(name: impl Into<String>, ping: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            ping: Arc::new(move || Box::pin(ping())),
            info: None,
        }
    }

    /// Attach an INFO probe whose payload lands in the result details.
    pub fn with_info<F, Fut>(mut self, info: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.info = Some(Arc::new(move || Box::pin(info())));
        self
    }
}

#[async_trait]
impl HealthChecker for RedisHealthChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> anyhow::Result<Option<serde_json::Value>> {
        (self.ping)().await?;
        match &self.info {
            Some(info) => Ok(Some(info().await?)),
            None => Ok(None),
        }
    }
}

/// Arbitrary async probe returning a healthy/unhealthy verdict.
pub struct CustomHealthChecker {
    name: String,
    probe: BoolProbeFn,
}

impl CustomHealthChecker {
    pub fn new<F, Fut>(name: impl Into<String>, probe: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Self {
            name: name.into(),
            probe: Arc::new(move || Box::pin(probe())),
        }
    }
}

#[async_trait]
impl HealthChecker for CustomHealthChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> anyhow::Result<Option<serde_json::Value>> {
        if (self.probe)().await? {
            Ok(None)
        } else {
            anyhow::bail!("probe reported unhealthy")
        }
    }
}

/// Run one probe under the deadline, synthesizing a result on failure.
///
/// A hang becomes an `Unhealthy` result whose error mentions the timeout;
/// a probe error becomes an `Unhealthy` result carrying the error chain.
/// This function never returns an error.
pub async fn run_check(checker: &dyn HealthChecker, timeout: Duration) -> HealthCheckResult {
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, checker.check()).await;
    let response_time = started.elapsed();

    let (status, error, details) = match outcome {
        Ok(Ok(details)) => (HealthStatus::Healthy, None, details),
        Ok(Err(error)) => (HealthStatus::Unhealthy, Some(format!("{error:#}")), None),
        Err(_) => (
            HealthStatus::Unhealthy,
            Some(format!("timeout after {timeout:?}")),
            None,
        ),
    };

    HealthCheckResult {
        service: checker.name().to_string(),
        status,
        response_time,
        error,
        details,
        checked_at: Utc::now(),
    }
}

/// Accumulated check statistics for one service.
#[derive(Debug, Clone, Default)]
pub struct ServiceHealthMetrics {
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub consecutive_failures: u32,
    pub average_response_time: Duration,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    total_response_time: Duration,
    history: VecDeque<HealthCheckResult>,
}

impl ServiceHealthMetrics {
    fn record(&mut self, result: &HealthCheckResult) {
        self.total_checks += 1;
        self.total_response_time += result.response_time;
        self.average_response_time = self.total_response_time / self.total_checks as u32;
        self.last_check_time = Some(result.checked_at);

        if result.status == HealthStatus::Healthy {
            self.successful_checks += 1;
            self.consecutive_failures = 0;
            self.last_success_time = Some(result.checked_at);
        } else {
            self.failed_checks += 1;
            self.consecutive_failures += 1;
            self.last_failure_time = Some(result.checked_at);
        }

        self.history.push_back(result.clone());
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    /// Fraction of checks that succeeded, in `[0, 1]`.
    pub fn success_rate(&self) -> f64 {
        if self.total_checks == 0 {
            return 0.0;
        }
        self.successful_checks as f64 / self.total_checks as f64
    }

    /// Derive the status from streaks and the success rate.
    pub fn status(&self) -> HealthStatus {
        if self.total_checks == 0 {
            return HealthStatus::Unknown;
        }
        let rate = self.success_rate();
        if self.consecutive_failures >= 3 || rate <= 0.5 {
            HealthStatus::Unhealthy
        } else if rate > 0.8 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    }

    /// Recent check results, oldest first (bounded at 100 entries).
    pub fn history(&self) -> impl Iterator<Item = &HealthCheckResult> {
        self.history.iter()
    }
}

/// Serializable view of one service's health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    #[serde(with = "duration_secs_f64")]
    pub average_response_time: Duration,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
}

impl From<&ServiceHealthMetrics> for HealthSnapshot {
    fn from(metrics: &ServiceHealthMetrics) -> Self {
        Self {
            status: metrics.status(),
            total_checks: metrics.total_checks,
            successful_checks: metrics.successful_checks,
            failed_checks: metrics.failed_checks,
            consecutive_failures: metrics.consecutive_failures,
            success_rate: metrics.success_rate(),
            average_response_time: metrics.average_response_time,
            last_check_time: metrics.last_check_time,
            last_success_time: metrics.last_success_time,
            last_failure_time: metrics.last_failure_time,
        }
    }
}

/// The externally stable health payload served to collaborators.
///
/// Field set is part of the crate's public contract: `{status, timestamp,
/// services, uptime_seconds, version}`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub services: HashMap<String, HealthSnapshot>,
    pub uptime_seconds: u64,
    pub version: String,
}

/// Called on every status transition with `(service, from, to)`.
pub type StatusCallback = Arc<dyn Fn(&str, HealthStatus, HealthStatus) + Send + Sync>;

/// Errors from on-demand health queries.
#[derive(Error, Debug)]
pub enum HealthError {
    #[error("no health checker registered for '{0}'")]
    UnknownService(String),
}

struct MonitorShared {
    config: HealthMonitorConfig,
    checkers: RwLock<HashMap<String, Arc<dyn HealthChecker>>>,
    metrics: RwLock<HashMap<String, ServiceHealthMetrics>>,
    on_transition: RwLock<Option<StatusCallback>>,
    started_at: Instant,
}

impl MonitorShared {
    /// Run every registered checker concurrently and fold in the results.
    async fn run_all_checks(&self) {
        let checkers: Vec<(String, Arc<dyn HealthChecker>)> = self
            .checkers
            .read()
            .iter()
            .map(|(name, checker)| (name.clone(), checker.clone()))
            .collect();

        let timeout = self.config.check_timeout;
        let results = join_all(checkers.iter().map(|(_, checker)| {
            let checker = checker.clone();
            async move { run_check(checker.as_ref(), timeout).await }
        }))
        .await;

        for ((name, _), result) in checkers.iter().zip(results) {
            self.record_result(name, &result);
        }
    }

    fn record_result(&self, service: &str, result: &HealthCheckResult) {
        let (previous, current) = {
            let mut metrics = self.metrics.write();
            let entry = metrics.entry(service.to_string()).or_default();
            let previous = entry.status();
            entry.record(result);
            (previous, entry.status())
        };

        if previous != current {
            tracing::info!(
                service,
                from = ?previous,
                to = ?current,
                error = result.error.as_deref(),
                "service health transition"
            );
            let callback = self.on_transition.read().clone();
            if let Some(callback) = callback {
                callback(service, previous, current);
            }
        }
    }
}

/// Background poller aggregating per-service health.
///
/// `start_monitoring` and `stop_monitoring` are idempotent; stopping
/// cancels the background task and awaits its exit before returning.
pub struct ServiceHealthMonitor {
    shared: Arc<MonitorShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceHealthMonitor {
    /// Create a monitor, validating the config up front.
    pub fn new(config: HealthMonitorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(MonitorShared {
                config,
                checkers: RwLock::new(HashMap::new()),
                metrics: RwLock::new(HashMap::new()),
                on_transition: RwLock::new(None),
                started_at: Instant::now(),
            }),
            task: Mutex::new(None),
        })
    }

    /// Register a checker under a service name. The service reports
    /// `Unknown` until its first check completes.
    pub fn add_checker(&self, name: impl Into<String>, checker: Arc<dyn HealthChecker>) {
        let name = name.into();
        self.shared.checkers.write().insert(name.clone(), checker);
        self.shared.metrics.write().entry(name).or_default();
    }

    /// Remove a checker and its accumulated metrics.
    pub fn remove_checker(&self, name: &str) {
        self.shared.checkers.write().remove(name);
        self.shared.metrics.write().remove(name);
    }

    /// Install the transition callback.
    pub fn set_transition_callback(&self, callback: StatusCallback) {
        *self.shared.on_transition.write() = Some(callback);
    }

    /// Start the background polling loop. A second call while running is a
    /// no-op.
    pub fn start_monitoring(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let shared = self.shared.clone();
        let interval = shared.config.check_interval;
        tracing::info!(interval_secs = interval.as_secs(), "health monitoring started");
        *task = Some(tokio::spawn(async move {
            loop {
                shared.run_all_checks().await;
                tokio::time::sleep(interval).await;
            }
        }));
    }

    /// Stop the background loop, awaiting task exit. A call while stopped
    /// is a no-op.
    pub async fn stop_monitoring(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            tracing::info!("health monitoring stopped");
        }
    }

    /// Whether the background loop is currently running.
    pub fn is_monitoring(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Run one out-of-band check immediately, updating metrics.
    pub async fn check_service_now(&self, name: &str) -> Result<HealthCheckResult, HealthError> {
        let checker = self
            .shared
            .checkers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| HealthError::UnknownService(name.to_string()))?;

        let result = run_check(checker.as_ref(), self.shared.config.check_timeout).await;
        self.shared.record_result(name, &result);
        Ok(result)
    }

    /// Snapshot of one service's health.
    pub fn get_service_health(&self, name: &str) -> Option<HealthSnapshot> {
        self.shared.metrics.read().get(name).map(HealthSnapshot::from)
    }

    /// Snapshots for every monitored service.
    pub fn get_all_health(&self) -> HashMap<String, HealthSnapshot> {
        self.shared
            .metrics
            .read()
            .iter()
            .map(|(name, metrics)| (name.clone(), HealthSnapshot::from(metrics)))
            .collect()
    }

    /// The stable health payload: overall status is the worst of the
    /// per-service statuses, with `Unknown` not counting against it.
    pub fn report(&self) -> HealthReport {
        let services = self.get_all_health();
        let status = services
            .values()
            .fold(HealthStatus::Healthy, |worst, snapshot| {
                match (worst, snapshot.status) {
                    (_, HealthStatus::Unhealthy) | (HealthStatus::Unhealthy, _) => {
                        HealthStatus::Unhealthy
                    }
                    (_, HealthStatus::Degraded) | (HealthStatus::Degraded, _) => {
                        HealthStatus::Degraded
                    }
                    (worst, _) => worst,
                }
            });

        HealthReport {
            status,
            timestamp: Utc::now(),
            services,
            uptime_seconds: self.shared.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Drop for ServiceHealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
