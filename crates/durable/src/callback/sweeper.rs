//! Periodic retry of PENDING callback runs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use super::handler::{call_handler, HandlerRegistry};
use super::model::{CallbackTaskRun, RunStatus};
use super::recorder::TaskRunRecorder;
use super::registry::{CallbackError, NO_HANDLER_MESSAGE};
use crate::coordination::CoordinationStore;
use crate::job::{Heartbeat, Job};
use crate::lock::DistributedMutex;
use crate::persistence::CallbackStore;
use crate::reliability::SlidingWindowRateLimiter;

/// Job name of the sweeper
pub const SWEEPER_JOB_NAME: &str = "runPendingCallbackTasks";

/// Lock key prefix guarding a single run
pub const RUN_LOCK_KEY_PREFIX: &str = "callback-task-run-lock:";

/// Error message stored when a run's task disappeared
pub const TASK_NOT_FOUND_MESSAGE: &str = "Callback task not found";

/// Batching and locking settings for [`PendingRunSweeper`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperConfig {
    pub batch_size: u32,
    pub run_lock_ttl: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            run_lock_ttl: Duration::from_secs(30),
        }
    }
}

impl SweeperConfig {
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub succeeded: u32,
    pub pending: u32,
    pub failed: u32,
    /// Runs locked by another worker
    pub skipped: u32,
    /// Runs whose processing raised an error
    pub errors: u32,
}

impl SweepReport {
    pub fn processed(&self) -> u32 {
        self.succeeded + self.pending + self.failed
    }

    fn count(&mut self, status: RunStatus) {
        match status {
            RunStatus::Success => self.succeeded += 1,
            RunStatus::Pending => self.pending += 1,
            RunStatus::Failure => self.failed += 1,
        }
    }
}

/// Gives every due PENDING run one more attempt
///
/// Registered with the scheduler as the `runPendingCallbackTasks` job. A run
/// is visited at most once per sweep; runs left PENDING wait for the next
/// sweep and their `next_run_at`.
#[derive(Clone)]
pub struct PendingRunSweeper {
    store: Arc<dyn CallbackStore>,
    handlers: Arc<HandlerRegistry>,
    limiter: SlidingWindowRateLimiter,
    recorder: TaskRunRecorder,
    run_locks: DistributedMutex,
    config: SweeperConfig,
}

impl PendingRunSweeper {
    pub fn new(
        store: Arc<dyn CallbackStore>,
        handlers: Arc<HandlerRegistry>,
        limiter: SlidingWindowRateLimiter,
        coordination: Arc<dyn CoordinationStore>,
    ) -> Self {
        Self {
            recorder: TaskRunRecorder::new(store.clone()),
            store,
            handlers,
            limiter,
            run_locks: DistributedMutex::new(coordination).with_key_prefix(RUN_LOCK_KEY_PREFIX),
            config: SweeperConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SweeperConfig) -> Self {
        self.config = config;
        self
    }

    /// Process every due run once
    #[instrument(skip(self, heartbeat))]
    pub async fn sweep(&self, heartbeat: &Heartbeat) -> Result<SweepReport, CallbackError> {
        let mut report = SweepReport::default();
        let mut after_id = 0;

        'batches: loop {
            let batch = self
                .store
                .due_pending_runs(Utc::now(), after_id, self.config.batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            after_id = last.id;
            debug!(size = batch.len(), "processing batch of pending runs");

            for run in &batch {
                // Rate-limited runs can each wait a full window
                heartbeat.beat().await;
                if heartbeat.is_lost() {
                    warn!("sweeper lock taken over, stopping sweep");
                    break 'batches;
                }

                match self.process(run).await {
                    Ok(Some(status)) => report.count(status),
                    Ok(None) => report.skipped += 1,
                    Err(e) => {
                        error!(run_uuid = %run.run_uuid, error = %e, "error processing callback run");
                        report.errors += 1;
                    }
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                succeeded = report.succeeded,
                pending = report.pending,
                failed = report.failed,
                skipped = report.skipped,
                errors = report.errors,
                "callback sweep finished"
            );
        }
        Ok(report)
    }

    /// One attempt for one run, under its run lock
    ///
    /// Returns `None` when another worker holds the lock.
    async fn process(&self, run: &CallbackTaskRun) -> Result<Option<RunStatus>, CallbackError> {
        let lock_name = run.run_uuid.to_string();
        let lease = match self
            .run_locks
            .acquire(&lock_name, self.config.run_lock_ttl)
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                warn!(run_uuid = %run.run_uuid, "run locked elsewhere, skipping");
                return Ok(None);
            }
            Err(e) => {
                warn!(run_uuid = %run.run_uuid, error = %e, "could not lock run, skipping");
                return Ok(None);
            }
        };

        let result = self.attempt(run).await;

        if let Err(e) = self.run_locks.release(&lease).await {
            warn!(run_uuid = %run.run_uuid, error = %e, "failed to release run lock");
        }

        result.map(Some)
    }

    async fn attempt(&self, run: &CallbackTaskRun) -> Result<RunStatus, CallbackError> {
        let Some(task) = self.store.get_task(run.task_id).await? else {
            error!(run_uuid = %run.run_uuid, task_id = run.task_id, "no callback task for run");
            let run = self.recorder.fail_run(run, TASK_NOT_FOUND_MESSAGE).await?;
            return Ok(run.status);
        };

        let identity = task.identity;
        let Some(handler) = self.handlers.get(identity.api_name, identity.task_function) else {
            error!(
                run_uuid = %run.run_uuid,
                api = %identity.api_name,
                function = %identity.task_function,
                "no handler for callback run"
            );
            let run = self.recorder.fail_run(run, NO_HANDLER_MESSAGE).await?;
            return Ok(run.status);
        };

        self.limiter.acquire(identity.api_name.as_str()).await?;

        let payload = run.payload.as_ref().or(task.payload_template.as_ref());
        info!(
            run_uuid = %run.run_uuid,
            api = %identity.api_name,
            attempt = run.attempts + 1,
            "retrying callback run"
        );

        let result = call_handler(handler.as_ref(), task.http_method, payload).await;

        let policy = task.retry_policy.to_retry_policy();
        let updated = self.recorder.record_retry(run, result, &policy).await?;
        Ok(updated.status)
    }
}

#[async_trait]
impl Job for PendingRunSweeper {
    fn name(&self) -> &str {
        SWEEPER_JOB_NAME
    }

    async fn run(&self, heartbeat: Heartbeat) -> anyhow::Result<()> {
        self.sweep(&heartbeat).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{
        ApiName, FnHandler, HandlerResult, NewCallbackTask, NewTaskRun, TaskFunction,
        TaskIdentity,
    };
    use crate::coordination::InMemoryCoordinationStore;
    use crate::persistence::InMemoryCallbackStore;
    use crate::reliability::RateLimitPolicy;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        store: Arc<InMemoryCallbackStore>,
        coordination: Arc<InMemoryCoordinationStore>,
        calls: Arc<AtomicU32>,
        sweeper: PendingRunSweeper,
    }

    fn fixture(succeed: bool) -> Fixture {
        let store = Arc::new(InMemoryCallbackStore::new());
        let coordination = Arc::new(InMemoryCoordinationStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handlers = HandlerRegistry::new().with_handler(
            ApiName::Tonfest,
            TaskFunction::AddUserTicketFromOnton,
            FnHandler::new(move |payload| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if succeed {
                        Ok(HandlerResult::success(json!({ "payload": payload })))
                    } else {
                        Ok(HandlerResult::failure(json!({ "error": "rejected" })))
                    }
                }
            }),
        );
        let limiter = SlidingWindowRateLimiter::new(coordination.clone())
            .with_default_policy(RateLimitPolicy::new(1000, Duration::from_secs(1)));
        let sweeper =
            PendingRunSweeper::new(store.clone(), Arc::new(handlers), limiter, coordination.clone());

        Fixture {
            store,
            coordination,
            calls,
            sweeper,
        }
    }

    async fn pending_run(
        store: &InMemoryCallbackStore,
        function: TaskFunction,
        payload: Option<serde_json::Value>,
    ) -> CallbackTaskRun {
        let task = store
            .register_task(
                NewCallbackTask::new(TaskIdentity::new(ApiName::Tonfest, function))
                    .with_payload_template(json!({"from": "template"})),
            )
            .await
            .unwrap();
        store
            .insert_run(NewTaskRun {
                task_id: task.id,
                status: RunStatus::Pending,
                payload,
                response: json!({}),
                attempts: 1,
                next_run_at: Some(Utc::now()),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sweep_retries_due_runs() {
        let f = fixture(true);
        let run = pending_run(&f.store, TaskFunction::AddUserTicketFromOnton, None).await;

        let report = f.sweeper.sweep(&Heartbeat::noop()).await.unwrap();
        assert_eq!(report.succeeded, 1);

        let run = f.store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.attempts, 2);
        assert_eq!(run.response, json!({"payload": {"from": "template"}}));
        assert_eq!(f.coordination.key_count(), 0);
    }

    #[tokio::test]
    async fn test_each_run_visited_once_per_sweep() {
        let f = fixture(false);
        let sweeper = f
            .sweeper
            .clone()
            .with_config(SweeperConfig::default().with_batch_size(2));
        for _ in 0..5 {
            pending_run(&f.store, TaskFunction::AddUserTicketFromOnton, Some(json!({}))).await;
        }

        let report = sweeper.sweep(&Heartbeat::noop()).await.unwrap();

        assert_eq!(report.processed(), 5);
        assert_eq!(report.pending, 5);
        assert_eq!(f.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_bounded_retries() {
        let f = fixture(false);
        let run = pending_run(&f.store, TaskFunction::AddUserTicketFromOnton, None).await;

        for _ in 0..5 {
            f.sweeper.sweep(&Heartbeat::noop()).await.unwrap();
        }

        let run = f.store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failure);
        assert_eq!(run.attempts, crate::callback::MAX_ATTEMPTS);
        // Attempts 2 and 3 went through the sweeper
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_run() {
        let f = fixture(true);
        let run = pending_run(&f.store, TaskFunction::AddSbtFromOnton, None).await;

        let report = f.sweeper.sweep(&Heartbeat::noop()).await.unwrap();
        assert_eq!(report.failed, 1);

        let run = f.store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failure);
        assert_eq!(run.response, json!({"error": NO_HANDLER_MESSAGE}));
    }

    #[tokio::test]
    async fn test_missing_task_fails_run() {
        let f = fixture(true);
        let run = pending_run(&f.store, TaskFunction::AddUserTicketFromOnton, None).await;
        assert!(f.store.remove_task(run.task_id));

        f.sweeper.sweep(&Heartbeat::noop()).await.unwrap();

        let run = f.store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failure);
        assert_eq!(run.response, json!({"error": TASK_NOT_FOUND_MESSAGE}));
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_locked_run_is_skipped() {
        let f = fixture(true);
        let run = pending_run(&f.store, TaskFunction::AddUserTicketFromOnton, None).await;

        let other =
            DistributedMutex::new(f.coordination.clone()).with_key_prefix(RUN_LOCK_KEY_PREFIX);
        let _lease = other
            .acquire(&run.run_uuid.to_string(), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let report = f.sweeper.sweep(&Heartbeat::noop()).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            f.store.get_run(run.id).await.unwrap().unwrap().status,
            RunStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_releases_run_lock() {
        let store = Arc::new(InMemoryCallbackStore::new());
        let coordination = Arc::new(InMemoryCoordinationStore::new());
        let handlers = HandlerRegistry::new()
            .with_handler(
                ApiName::Tonfest,
                TaskFunction::AddSbtFromOnton,
                FnHandler::new(|_| async { panic!("handler bug") }),
            )
            .with_handler(
                ApiName::Tonfest,
                TaskFunction::AddUserTicketFromOnton,
                FnHandler::new(|_| async { Ok(HandlerResult::success(json!({"ok": true}))) }),
            );
        let limiter = SlidingWindowRateLimiter::new(coordination.clone())
            .with_default_policy(RateLimitPolicy::new(1000, Duration::from_secs(1)));
        let sweeper =
            PendingRunSweeper::new(store.clone(), Arc::new(handlers), limiter, coordination.clone());

        let broken = pending_run(&store, TaskFunction::AddSbtFromOnton, None).await;
        let healthy = pending_run(&store, TaskFunction::AddUserTicketFromOnton, None).await;

        let report = sweeper.sweep(&Heartbeat::noop()).await.unwrap();
        assert_eq!(report.processed(), 2);
        assert_eq!(report.errors, 0);

        let broken = store.get_run(broken.id).await.unwrap().unwrap();
        assert_eq!(broken.attempts, 2);
        assert_eq!(broken.response, json!({"error": "panicked: handler bug"}));

        let healthy = store.get_run(healthy.id).await.unwrap().unwrap();
        assert_eq!(healthy.status, RunStatus::Success);

        let run_locks = DistributedMutex::new(coordination).with_key_prefix(RUN_LOCK_KEY_PREFIX);
        for run in [&broken, &healthy] {
            assert!(!run_locks.is_locked(&run.run_uuid.to_string()).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_sweep_stops_when_job_lock_is_lost() {
        let f = fixture(true);
        for _ in 0..3 {
            pending_run(&f.store, TaskFunction::AddUserTicketFromOnton, None).await;
        }

        let job_locks = DistributedMutex::new(f.coordination.clone());
        let lease = job_locks
            .acquire(SWEEPER_JOB_NAME, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let heartbeat = Heartbeat::new(job_locks.clone(), lease, Duration::from_secs(30));

        // Another worker takes the lock over
        job_locks.force_release(SWEEPER_JOB_NAME).await.unwrap();
        job_locks
            .acquire(SWEEPER_JOB_NAME, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let report = f.sweeper.sweep(&heartbeat).await.unwrap();
        assert_eq!(report.processed(), 0);
        assert!(heartbeat.is_lost());
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_job_name() {
        let f = fixture(true);
        assert_eq!(f.sweeper.name(), "runPendingCallbackTasks");
    }
}
