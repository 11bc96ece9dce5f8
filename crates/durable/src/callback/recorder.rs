//! Run history writer

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use super::handler::HandlerResult;
use super::model::{
    next_status_within, CallbackTask, CallbackTaskRun, NewTaskRun, RunStatus, RunUpdate,
};
use crate::persistence::{CallbackStore, CallbackStoreError};
use crate::reliability::RetryPolicy;

/// Persists one run row per invocation and applies retry results
#[derive(Clone)]
pub struct TaskRunRecorder {
    store: Arc<dyn CallbackStore>,
}

impl TaskRunRecorder {
    pub fn new(store: Arc<dyn CallbackStore>) -> Self {
        Self { store }
    }

    /// Record the first attempt of an invocation
    ///
    /// Success becomes SUCCESS; a failure stays PENDING for the sweeper
    /// unless the policy allows a single attempt only.
    #[instrument(skip(self, task, payload, result), fields(task_id = task.id, success = result.success))]
    pub async fn record_invocation(
        &self,
        task: &CallbackTask,
        payload: Option<Value>,
        result: HandlerResult,
    ) -> Result<CallbackTaskRun, CallbackStoreError> {
        let policy = task.retry_policy.to_retry_policy();
        let status = if result.success {
            RunStatus::Success
        } else {
            next_status_within(0, policy.effective_max_attempts())
        };

        self.store
            .insert_run(NewTaskRun {
                task_id: task.id,
                status,
                payload,
                response: result.data,
                attempts: 1,
                next_run_at: next_run_at(status, &policy, 1),
            })
            .await
    }

    /// Record a terminal failure that never reached a handler
    #[instrument(skip(self, task, payload), fields(task_id = task.id))]
    pub async fn record_failure(
        &self,
        task: &CallbackTask,
        payload: Option<Value>,
        message: &str,
    ) -> Result<CallbackTaskRun, CallbackStoreError> {
        self.store
            .insert_run(NewTaskRun {
                task_id: task.id,
                status: RunStatus::Failure,
                payload,
                response: json!({ "error": message }),
                attempts: 1,
                next_run_at: None,
            })
            .await
    }

    /// Apply the result of one more attempt to a PENDING run
    ///
    /// Terminal runs are rejected with [`CallbackStoreError::TerminalRun`].
    #[instrument(skip(self, run, result, policy), fields(run_uuid = %run.run_uuid, success = result.success))]
    pub async fn record_retry(
        &self,
        run: &CallbackTaskRun,
        result: HandlerResult,
        policy: &RetryPolicy,
    ) -> Result<CallbackTaskRun, CallbackStoreError> {
        if run.status.is_terminal() {
            return Err(CallbackStoreError::TerminalRun(run.id));
        }

        let attempts = run.attempts + 1;
        let status = if result.success {
            RunStatus::Success
        } else {
            next_status_within(run.attempts, policy.effective_max_attempts())
        };

        match status {
            RunStatus::Success => info!(attempts, "callback run succeeded"),
            RunStatus::Failure => warn!(attempts, "callback run failed permanently"),
            RunStatus::Pending => warn!(attempts, "callback run attempt failed, left pending"),
        }

        self.store
            .update_run(
                run.id,
                RunUpdate {
                    status,
                    response: result.data,
                    attempts,
                    next_run_at: next_run_at(status, policy, attempts),
                },
            )
            .await
    }

    /// Mark a PENDING run as FAILURE without counting an attempt
    #[instrument(skip(self, run), fields(run_uuid = %run.run_uuid))]
    pub async fn fail_run(
        &self,
        run: &CallbackTaskRun,
        message: &str,
    ) -> Result<CallbackTaskRun, CallbackStoreError> {
        self.store
            .update_run(
                run.id,
                RunUpdate {
                    status: RunStatus::Failure,
                    response: json!({ "error": message }),
                    attempts: run.attempts,
                    next_run_at: None,
                },
            )
            .await
    }
}

fn next_run_at(status: RunStatus, policy: &RetryPolicy, attempts: u32) -> Option<DateTime<Utc>> {
    match status {
        RunStatus::Pending => {
            let delay = policy.delay_for_attempt(attempts + 1);
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            Some(Utc::now() + delay)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{
        ApiName, NewCallbackTask, TaskFunction, TaskIdentity, TaskRetryPolicy, MAX_ATTEMPTS,
    };
    use crate::persistence::InMemoryCallbackStore;

    async fn setup(policy: TaskRetryPolicy) -> (TaskRunRecorder, CallbackTask) {
        let store = Arc::new(InMemoryCallbackStore::new());
        let task = store
            .register_task(
                NewCallbackTask::new(TaskIdentity::new(ApiName::TsApi, TaskFunction::PridipieAuth))
                    .with_retry_policy(policy),
            )
            .await
            .unwrap();
        (TaskRunRecorder::new(store), task)
    }

    #[tokio::test]
    async fn test_success_is_terminal() {
        let (recorder, task) = setup(TaskRetryPolicy::default()).await;

        let run = recorder
            .record_invocation(&task, None, HandlerResult::success(json!({"ok": 1})))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.attempts, 1);
        assert_eq!(run.next_run_at, None);
    }

    #[tokio::test]
    async fn test_failure_stays_pending_with_wait() {
        let policy = TaskRetryPolicy {
            max_attempts: 3,
            wait_for_retry_ms: 60_000,
        };
        let (recorder, task) = setup(policy).await;
        let before = Utc::now();

        let run = recorder
            .record_invocation(&task, Some(json!({"a": 1})), HandlerResult::failure(json!({})))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.payload, Some(json!({"a": 1})));
        let next = run.next_run_at.unwrap();
        assert!(next >= before + chrono::Duration::seconds(59));
    }

    #[tokio::test]
    async fn test_single_attempt_policy_fails_immediately() {
        let policy = TaskRetryPolicy {
            max_attempts: 1,
            wait_for_retry_ms: 0,
        };
        let (recorder, task) = setup(policy).await;

        let run = recorder
            .record_invocation(&task, None, HandlerResult::failure(json!({})))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failure);
    }

    #[tokio::test]
    async fn test_retries_end_in_failure() {
        let (recorder, task) = setup(TaskRetryPolicy::default()).await;
        let policy = task.retry_policy.to_retry_policy();

        let mut run = recorder
            .record_invocation(&task, None, HandlerResult::failure(json!({"n": 1})))
            .await
            .unwrap();

        let mut attempts = 1;
        while run.status == RunStatus::Pending {
            run = recorder
                .record_retry(&run, HandlerResult::failure(json!({})), &policy)
                .await
                .unwrap();
            attempts += 1;
        }

        assert_eq!(run.status, RunStatus::Failure);
        assert_eq!(run.attempts, MAX_ATTEMPTS);
        assert_eq!(attempts, MAX_ATTEMPTS);

        let again = recorder
            .record_retry(&run, HandlerResult::success(json!({})), &policy)
            .await;
        assert!(matches!(again, Err(CallbackStoreError::TerminalRun(_))));
    }

    #[tokio::test]
    async fn test_retry_success() {
        let (recorder, task) = setup(TaskRetryPolicy::default()).await;
        let policy = task.retry_policy.to_retry_policy();

        let run = recorder
            .record_invocation(&task, None, HandlerResult::failure(json!({})))
            .await
            .unwrap();
        let run = recorder
            .record_retry(&run, HandlerResult::success(json!({"done": true})), &policy)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.attempts, 2);
        assert_eq!(run.response, json!({"done": true}));
    }

    #[tokio::test]
    async fn test_fail_run_keeps_attempts() {
        let (recorder, task) = setup(TaskRetryPolicy::default()).await;
        let run = recorder
            .record_invocation(&task, None, HandlerResult::failure(json!({})))
            .await
            .unwrap();

        let failed = recorder.fail_run(&run, "Callback task not found").await.unwrap();
        assert_eq!(failed.status, RunStatus::Failure);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.response["error"], "Callback task not found");
    }
}
