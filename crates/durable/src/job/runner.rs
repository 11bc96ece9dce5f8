//! Job runner: lock, heartbeat, alert, release
//!
//! ```text
//!          lock held elsewhere
//!   IDLE ───────────────────────► SKIPPED ──► IDLE
//!     │
//!     │ lock acquired
//!     ▼
//!  RUNNING ── success | error | panic ──► RELEASING ──► IDLE
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::alert::{Alert, AlertSink};
use crate::lock::{DistributedMutex, LockLease};

/// Default lock TTL for jobs
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(40);

/// A named unit of periodic work
///
/// The name is an explicit, stable identifier: it builds the lock key and
/// must not change across deploys.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Stable job identifier
    fn name(&self) -> &str;

    /// Execute the job body
    ///
    /// Long-running bodies must call [`Heartbeat::beat`] between
    /// iterations, otherwise the lock may expire while they still run.
    async fn run(&self, heartbeat: Heartbeat) -> anyhow::Result<()>;
}

type JobFn = Arc<
    dyn Fn(Heartbeat) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync,
>;

/// [`Job`] built from a name and an async closure
///
/// # Example
///
/// ```ignore
/// let job = FnJob::new("createRewards", |heartbeat| async move {
///     for chunk in pending_chunks().await? {
///         process(chunk).await?;
///         heartbeat.beat().await;
///     }
///     Ok(())
/// });
/// ```
pub struct FnJob {
    name: String,
    body: JobFn,
}

impl FnJob {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Heartbeat) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(move |heartbeat| Box::pin(body(heartbeat))),
        }
    }
}

#[async_trait]
impl Job for FnJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, heartbeat: Heartbeat) -> anyhow::Result<()> {
        (self.body)(heartbeat).await
    }
}

/// Renews the lock of the running job
///
/// Cheap to clone; every clone renews the same lease.
#[derive(Clone)]
pub struct Heartbeat {
    inner: Option<Arc<HeartbeatInner>>,
}

struct HeartbeatInner {
    mutex: DistributedMutex,
    lease: LockLease,
    ttl: Duration,
    lost: AtomicBool,
}

impl Heartbeat {
    pub(crate) fn new(mutex: DistributedMutex, lease: LockLease, ttl: Duration) -> Self {
        Self {
            inner: Some(Arc::new(HeartbeatInner {
                mutex,
                lease,
                ttl,
                lost: AtomicBool::new(false),
            })),
        }
    }

    /// Heartbeat that does nothing (job invoked outside the runner)
    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// Reset the lock TTL
    ///
    /// Store errors are logged and swallowed: the job keeps running and the
    /// lock may expire early.
    pub async fn beat(&self) {
        let Some(inner) = &self.inner else {
            return;
        };

        match inner.mutex.renew(&inner.lease, inner.ttl).await {
            Ok(true) => {
                debug!(job = %inner.lease.name(), "heartbeat renewed lock");
            }
            Ok(false) => {
                if !inner.lost.swap(true, Ordering::Relaxed) {
                    warn!(
                        job = %inner.lease.name(),
                        "lock lost before heartbeat, another worker may run this job"
                    );
                }
            }
            Err(e) => {
                error!(job = %inner.lease.name(), error = %e, "heartbeat failed to renew lock");
            }
        }
    }

    /// Whether a heartbeat found the lock owned by someone else
    pub fn is_lost(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.lost.load(Ordering::Relaxed))
    }
}

/// Result of one scheduled invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Another worker holds the lock; nothing ran
    Skipped,

    /// The body ran and returned `Ok`
    Completed,

    /// The body returned an error or panicked
    Failed(String),

    /// The lock could not be checked because the store failed
    LockUnavailable(String),
}

/// Job runner configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRunnerConfig {
    /// TTL applied on acquire and on every heartbeat
    #[serde(with = "crate::duration_millis")]
    pub lock_ttl: Duration,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }
}

impl JobRunnerConfig {
    /// Set the lock TTL
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }
}

/// Runs jobs under a fleet-wide lock
///
/// # Example
///
/// ```ignore
/// let runner = Arc::new(JobRunner::new(mutex, Arc::new(TracingAlertSink)));
/// let tick = runner.clone().schedulable(Arc::new(my_job));
///
/// // From a timer on every worker:
/// tick().await;
/// ```
pub struct JobRunner {
    mutex: DistributedMutex,
    alerts: Arc<dyn AlertSink>,
    config: JobRunnerConfig,
}

impl JobRunner {
    /// Create a runner with the default configuration
    pub fn new(mutex: DistributedMutex, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            mutex,
            alerts,
            config: JobRunnerConfig::default(),
        }
    }

    /// Set the runner configuration
    pub fn with_config(mut self, config: JobRunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// The mutex used for job locks
    pub fn mutex(&self) -> &DistributedMutex {
        &self.mutex
    }

    /// Run the job once if no other worker holds its lock
    ///
    /// Never returns an error: failures of the body are logged, alerted and
    /// reported as [`JobOutcome::Failed`]. The lock is released in every case.
    #[instrument(skip(self, job), fields(job = %job.name()))]
    pub async fn run(&self, job: &dyn Job) -> JobOutcome {
        let name = job.name();
        let ttl = self.config.lock_ttl;

        let lease = match self.mutex.acquire(name, ttl).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(job = %name, "job is already running elsewhere, skipping");
                return JobOutcome::Skipped;
            }
            Err(e) => {
                error!(job = %name, error = %e, "failed to check job lock");
                return JobOutcome::LockUnavailable(e.to_string());
            }
        };

        let heartbeat = Heartbeat::new(self.mutex.clone(), lease.clone(), ttl);
        let started = tokio::time::Instant::now();

        let result = AssertUnwindSafe(job.run(heartbeat)).catch_unwind().await;

        let outcome = match result {
            Ok(Ok(())) => {
                info!(
                    job = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                );
                JobOutcome::Completed
            }
            Ok(Err(e)) => {
                let message = format!("{e:#}");
                self.report_failure(name, &message).await;
                JobOutcome::Failed(message)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.report_failure(name, &message).await;
                JobOutcome::Failed(message)
            }
        };

        match self.mutex.release(&lease).await {
            Ok(true) => {}
            Ok(false) => warn!(job = %name, "lock was already gone at release"),
            Err(e) => error!(job = %name, error = %e, "failed to release job lock"),
        }

        outcome
    }

    /// Parameterless function that runs `job` when called
    pub fn schedulable(
        self: Arc<Self>,
        job: Arc<dyn Job>,
    ) -> impl Fn() -> BoxFuture<'static, JobOutcome> + Send + Sync + 'static {
        move || {
            let runner = self.clone();
            let job = job.clone();
            async move { runner.run(job.as_ref()).await }.boxed()
        }
    }

    async fn report_failure(&self, name: &str, message: &str) {
        error!(job = %name, error = %message, "job failed");

        let alert = Alert::system(format!("Cron job {name} error: {message}"));
        if let Err(e) = self.alerts.notify(alert).await {
            warn!(job = %name, error = %e, "failed to send job failure alert");
        }
    }
}

/// Text recorded for a caught panic payload
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
