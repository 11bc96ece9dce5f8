//! Callback invocation entry point

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, instrument, warn};

use super::handler::{call_handler, HandlerRegistry, HandlerResult};
use super::model::{
    ApiName, CallbackTask, CallbackTaskRun, ItemType, NewCallbackTask, TaskFunction, TaskIdentity,
};
use super::recorder::TaskRunRecorder;
use crate::coordination::StoreError;
use crate::persistence::{CallbackStore, CallbackStoreError};
use crate::reliability::SlidingWindowRateLimiter;

/// Error message stored when no handler is registered
pub const NO_HANDLER_MESSAGE: &str = "No handler function for this task";

/// Errors that prevent an invocation from being recorded
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    /// Strict resolution found no registered task
    #[error("no callback task registered for {0}")]
    TaskNotRegistered(TaskIdentity),

    #[error(transparent)]
    Store(#[from] CallbackStoreError),

    #[error("rate limiter unavailable: {0}")]
    RateLimit(#[from] StoreError),
}

/// How an invocation finds its callback task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resolution {
    /// Find the task or register it on first use
    #[default]
    Register,
    /// Require the task to exist already
    Strict,
}

/// A request to perform one callback
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRequest {
    pub api_name: ApiName,
    pub task_function: TaskFunction,
    pub payload: Option<Value>,
    pub item_type: Option<ItemType>,
    pub item_id: Option<i64>,
    pub resolution: Resolution,
}

impl InvokeRequest {
    pub fn new(api_name: ApiName, task_function: TaskFunction) -> Self {
        Self {
            api_name,
            task_function,
            payload: None,
            item_type: None,
            item_id: None,
            resolution: Resolution::default(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_item(mut self, item_type: ItemType, item_id: Option<i64>) -> Self {
        self.item_type = Some(item_type);
        self.item_id = item_id;
        self
    }

    /// Fail with [`CallbackError::TaskNotRegistered`] instead of registering
    pub fn strict(mut self) -> Self {
        self.resolution = Resolution::Strict;
        self
    }

    pub fn identity(&self) -> TaskIdentity {
        TaskIdentity {
            api_name: self.api_name,
            task_function: self.task_function,
            item_type: self.item_type,
            item_id: self.item_id,
        }
    }
}

/// Result of [`CallbackTaskRegistry::invoke`]
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOutcome {
    pub task: CallbackTask,
    pub run: CallbackTaskRun,
    pub result: HandlerResult,
}

impl InvokeOutcome {
    pub fn success(&self) -> bool {
        self.result.success
    }
}

/// Routes callback invocations to handlers and records every attempt
///
/// # Example
///
/// ```ignore
/// let registry = CallbackTaskRegistry::new(store, handlers, limiter);
///
/// let outcome = registry
///     .invoke(
///         InvokeRequest::new(ApiName::Tonfest, TaskFunction::AddUserTicketFromOnton)
///             .with_item(ItemType::Event, Some(event_id))
///             .with_payload(json!({ "user_id": user_id })),
///     )
///     .await?;
///
/// if !outcome.success() {
///     // left PENDING for the sweeper
/// }
/// ```
#[derive(Clone)]
pub struct CallbackTaskRegistry {
    store: Arc<dyn CallbackStore>,
    handlers: Arc<HandlerRegistry>,
    limiter: SlidingWindowRateLimiter,
    recorder: TaskRunRecorder,
}

impl CallbackTaskRegistry {
    pub fn new(
        store: Arc<dyn CallbackStore>,
        handlers: Arc<HandlerRegistry>,
        limiter: SlidingWindowRateLimiter,
    ) -> Self {
        let recorder = TaskRunRecorder::new(store.clone());
        Self {
            store,
            handlers,
            limiter,
            recorder,
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn recorder(&self) -> &TaskRunRecorder {
        &self.recorder
    }

    /// Register a task with explicit settings; idempotent on identity
    pub async fn register(&self, task: NewCallbackTask) -> Result<CallbackTask, CallbackError> {
        Ok(self.store.register_task(task).await?)
    }

    /// Perform one callback and record exactly one run row
    ///
    /// Handler failures never surface as `Err`: they are stored on the run
    /// and reported through [`InvokeOutcome::success`].
    #[instrument(
        skip(self, request),
        fields(api = %request.api_name, function = %request.task_function)
    )]
    pub async fn invoke(&self, request: InvokeRequest) -> Result<InvokeOutcome, CallbackError> {
        let identity = request.identity();
        let task = match request.resolution {
            Resolution::Register => {
                self.store
                    .register_task(NewCallbackTask::new(identity))
                    .await?
            }
            Resolution::Strict => self
                .store
                .find_task(&identity)
                .await?
                .ok_or(CallbackError::TaskNotRegistered(identity))?,
        };

        let Some(handler) = self.handlers.get(request.api_name, request.task_function) else {
            error!(task_id = task.id, "no handler registered for callback task");
            let run = self
                .recorder
                .record_failure(&task, request.payload, NO_HANDLER_MESSAGE)
                .await?;
            let result = HandlerResult::failure(run.response.clone());
            return Ok(InvokeOutcome { task, run, result });
        };

        self.limiter.acquire(request.api_name.as_str()).await?;

        let payload = request.payload.or_else(|| task.payload_template.clone());
        let result = call_handler(handler.as_ref(), task.http_method, payload.as_ref()).await;

        if result.success {
            info!(task_id = task.id, "callback succeeded");
        } else {
            warn!(task_id = task.id, response = %result.data, "callback failed");
        }

        let run = self
            .recorder
            .record_invocation(&task, payload, result.clone())
            .await?;
        Ok(InvokeOutcome { task, run, result })
    }
}
