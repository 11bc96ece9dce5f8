//! Callback tasks: outbound calls to partner APIs with recorded attempts
//!
//! This module provides:
//! - [`CallbackTaskRegistry`] - resolve task, rate-limit, call handler, record run
//! - [`HandlerRegistry`] - typed `(ApiName, TaskFunction)` routing
//! - [`TaskRunRecorder`] - run rows and retry bookkeeping
//! - [`PendingRunSweeper`] - periodic job retrying PENDING runs
//!
//! # Run lifecycle
//!
//! ```text
//!   invoke ──► success ──────────────────────────► SUCCESS
//!     │
//!     ├──────► no handler ───────────────────────► FAILURE
//!     │
//!     └──────► failure ──► PENDING ── sweeper ──┬─► SUCCESS
//!                            ▲                  ├─► FAILURE (attempts exhausted)
//!                            └──────────────────┘
//! ```

mod handler;
mod model;
mod recorder;
mod registry;
mod sweeper;

pub use handler::{
    ExternalTaskHandler, FnHandler, HandlerError, HandlerKey, HandlerRegistry, HandlerResult,
    HttpCallbackHandler,
};
pub use model::{
    compute_next_status, next_status_within, ApiName, CallbackTask, CallbackTaskRun, HttpMethod,
    ItemType, NewCallbackTask, NewTaskRun, RunStatus, RunUpdate, StepName, TaskFunction,
    TaskIdentity, TaskRetryPolicy, UnknownVariant,
};
pub use recorder::TaskRunRecorder;
pub use registry::{
    CallbackError, CallbackTaskRegistry, InvokeOutcome, InvokeRequest, Resolution,
    NO_HANDLER_MESSAGE,
};
pub use sweeper::{
    PendingRunSweeper, SweepReport, SweeperConfig, RUN_LOCK_KEY_PREFIX, SWEEPER_JOB_NAME,
    TASK_NOT_FOUND_MESSAGE,
};

pub use crate::reliability::MAX_ATTEMPTS;
