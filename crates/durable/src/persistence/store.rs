//! CallbackStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::callback::{
    CallbackTask, CallbackTaskRun, NewCallbackTask, NewTaskRun, RunUpdate, TaskIdentity,
};

/// Error type for callback store operations
#[derive(Debug, thiserror::Error)]
pub enum CallbackStoreError {
    /// Task not found
    #[error("callback task not found: {0}")]
    TaskNotFound(i64),

    /// Run not found
    #[error("callback task run not found: {0}")]
    RunNotFound(i64),

    /// SUCCESS and FAILURE rows are never rewritten
    #[error("callback task run {0} is terminal")]
    TerminalRun(i64),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Durable storage for callback tasks and their runs
///
/// Implementations must:
/// - keep the task identity tuple unique, with absent item fields equal
/// - never rewrite a run once its status is terminal
#[async_trait]
pub trait CallbackStore: Send + Sync + 'static {
    /// Look up a task by its identity
    async fn find_task(
        &self,
        identity: &TaskIdentity,
    ) -> Result<Option<CallbackTask>, CallbackStoreError>;

    /// Register a task, returning the existing row if the identity is taken
    async fn register_task(&self, task: NewCallbackTask)
        -> Result<CallbackTask, CallbackStoreError>;

    /// Load a task by id
    async fn get_task(&self, task_id: i64) -> Result<Option<CallbackTask>, CallbackStoreError>;

    /// Append a run row
    async fn insert_run(&self, run: NewTaskRun) -> Result<CallbackTaskRun, CallbackStoreError>;

    /// Apply a retry result to a PENDING run
    ///
    /// Fails with [`CallbackStoreError::TerminalRun`] if the run already
    /// finished.
    async fn update_run(
        &self,
        run_id: i64,
        update: RunUpdate,
    ) -> Result<CallbackTaskRun, CallbackStoreError>;

    /// Load a run by id
    async fn get_run(&self, run_id: i64) -> Result<Option<CallbackTaskRun>, CallbackStoreError>;

    /// PENDING runs due at `now`, with id greater than `after_id`, oldest id first
    async fn due_pending_runs(
        &self,
        now: DateTime<Utc>,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<CallbackTaskRun>, CallbackStoreError>;

    /// Every run of a task, oldest first
    async fn runs_for_task(&self, task_id: i64)
        -> Result<Vec<CallbackTaskRun>, CallbackStoreError>;
}
