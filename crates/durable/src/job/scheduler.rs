//! Periodic job scheduling
//!
//! Every worker process runs the same scheduler; the [`JobRunner`] lock
//! makes sure each tick executes on at most one of them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::runner::{Job, JobOutcome, JobRunner};
use crate::lock::LockError;

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Two jobs registered with the same name
    #[error("job already registered: {0}")]
    DuplicateJob(String),

    /// Jobs cannot be registered once timers are running
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// Lock cleanup failed
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
}

struct ScheduledJob {
    job: Arc<dyn Job>,
    period: Duration,
}

/// Drives registered jobs on independent periodic timers
///
/// # Example
///
/// ```ignore
/// let mut scheduler = JobScheduler::new(runner);
/// scheduler.register(Arc::new(sweeper_job), Duration::from_secs(10))?;
/// scheduler.start();
/// // ...
/// scheduler.shutdown().await;
/// ```
pub struct JobScheduler {
    runner: Arc<JobRunner>,
    jobs: Vec<ScheduledJob>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl JobScheduler {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            runner,
            jobs: Vec::new(),
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Register a job to run every `period`
    pub fn register(&mut self, job: Arc<dyn Job>, period: Duration) -> Result<(), SchedulerError> {
        if !self.handles.is_empty() {
            return Err(SchedulerError::AlreadyRunning);
        }
        if self.jobs.iter().any(|s| s.job.name() == job.name()) {
            return Err(SchedulerError::DuplicateJob(job.name().to_string()));
        }
        self.jobs.push(ScheduledJob { job, period });
        Ok(())
    }

    /// Names of every registered job
    pub fn job_names(&self) -> HashSet<String> {
        self.jobs.iter().map(|s| s.job.name().to_string()).collect()
    }

    /// Force-release the lock of every registered job
    ///
    /// Clears locks left behind by workers that crashed mid-run. Only safe
    /// when no other worker is running these jobs right now.
    pub async fn clear_stale_locks(&self) -> Result<usize, SchedulerError> {
        let mut cleared = 0;
        for scheduled in &self.jobs {
            if self.runner.mutex().force_release(scheduled.job.name()).await? {
                warn!(job = %scheduled.job.name(), "cleared stale job lock");
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    /// Start one timer per job
    pub fn start(&mut self) {
        if !self.handles.is_empty() {
            return;
        }

        for scheduled in &self.jobs {
            let runner = self.runner.clone();
            let job = scheduled.job.clone();
            let period = scheduled.period;
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            info!(job = %job.name(), period_ms = period.as_millis() as u64, "scheduling job");

            self.handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let JobOutcome::LockUnavailable(e) = runner.run(job.as_ref()).await {
                                warn!(job = %job.name(), error = %e, "tick dropped, lock store unavailable");
                            }
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }));
        }
    }

    /// Stop all timers and wait for in-flight runs to finish
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "job timer task failed");
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::coordination::InMemoryCoordinationStore;
    use crate::job::{FnJob, InMemoryAlertSink};
    use crate::lock::DistributedMutex;

    fn create_test_runner() -> Arc<JobRunner> {
        let store = Arc::new(InMemoryCoordinationStore::new());
        Arc::new(JobRunner::new(
            DistributedMutex::new(store),
            Arc::new(InMemoryAlertSink::new()),
        ))
    }

    #[test]
    fn test_duplicate_job_rejected() {
        let mut scheduler = JobScheduler::new(create_test_runner());
        let period = Duration::from_secs(1);

        scheduler
            .register(Arc::new(FnJob::new("a", |_| async { Ok(()) })), period)
            .unwrap();
        let result = scheduler.register(Arc::new(FnJob::new("a", |_| async { Ok(()) })), period);

        assert!(matches!(result, Err(SchedulerError::DuplicateJob(name)) if name == "a"));
        assert_eq!(scheduler.job_names().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_run_job_periodically() {
        let mut scheduler = JobScheduler::new(create_test_runner());
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        scheduler
            .register(
                Arc::new(FnJob::new("counter", move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })),
                Duration::from_millis(100),
            )
            .unwrap();

        scheduler.start();
        // First tick fires immediately, then every 100ms
        tokio::time::sleep(Duration::from_millis(350)).await;
        scheduler.shutdown().await;

        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_clear_stale_locks() {
        let runner = create_test_runner();
        let mut scheduler = JobScheduler::new(runner.clone());
        scheduler
            .register(
                Arc::new(FnJob::new("crashed", |_| async { Ok(()) })),
                Duration::from_secs(1),
            )
            .unwrap();

        runner
            .mutex()
            .acquire("crashed", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(scheduler.clear_stale_locks().await.unwrap(), 1);
        assert!(!runner.mutex().is_locked("crashed").await.unwrap());
    }
}
