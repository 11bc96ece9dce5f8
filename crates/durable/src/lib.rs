//! # Jobguard
//!
//! Safety net for periodic background jobs that run on many processes at once.
//!
//! ## Features
//!
//! - **Fleet-wide job locks**: at most one process runs a given job at a time; locks self-heal after a crash
//! - **Failure isolation**: job errors and panics are caught, logged, alerted, and never stop the scheduler
//! - **Distributed rate limiting**: sliding-window limits per external API, shared by every worker
//! - **Callback tasks**: every outbound partner call is recorded and retried a bounded number of times
//! - **Patient HTTP**: fixed-delay retry for throttled provider endpoints
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 JobScheduler / JobRunner                     │
//! │  (periodic ticks, lock, heartbeat, alert, release)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        CallbackTaskRegistry / PendingRunSweeper              │
//! │  (handler routing, rate limiting, run recording)            │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                              │
//!                 ▼                              ▼
//! ┌───────────────────────────┐  ┌──────────────────────────────┐
//! │    CoordinationStore      │  │        CallbackStore         │
//! │  (Redis: locks, windows)  │  │  (PostgreSQL: tasks, runs)   │
//! └───────────────────────────┘  └──────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use jobguard_durable::prelude::*;
//!
//! let coordination: Arc<dyn CoordinationStore> =
//!     Arc::new(RedisCoordinationStore::connect("redis://localhost").await?);
//! let runner = Arc::new(JobRunner::new(
//!     DistributedMutex::new(coordination.clone()),
//!     Arc::new(TracingAlertSink),
//! ));
//!
//! let mut scheduler = JobScheduler::new(runner);
//! scheduler.register(
//!     Arc::new(FnJob::new("createRewards", |_heartbeat| async { Ok(()) })),
//!     Duration::from_secs(60),
//! )?;
//! scheduler.start();
//! ```

pub mod callback;
pub mod coordination;
pub mod job;
pub mod lock;
pub mod persistence;
pub mod reliability;

mod duration_millis;

/// Prelude for common imports
pub mod prelude {
    pub use crate::callback::{
        ApiName, CallbackError, CallbackTaskRegistry, ExternalTaskHandler, HandlerError,
        HandlerRegistry, HandlerResult, InvokeOutcome, InvokeRequest, ItemType,
        PendingRunSweeper, RunStatus, TaskFunction,
    };
    pub use crate::coordination::{
        CoordinationStore, InMemoryCoordinationStore, RedisCoordinationStore, StoreError,
    };
    pub use crate::job::{
        AlertSink, FnJob, Heartbeat, Job, JobOutcome, JobRunner, JobScheduler, TracingAlertSink,
        WebhookAlertSink,
    };
    pub use crate::lock::{DistributedMutex, LockLease};
    pub use crate::persistence::{CallbackStore, InMemoryCallbackStore, PostgresCallbackStore};
    pub use crate::reliability::{
        HttpRetryConfig, ProviderRequest, RateLimitPolicy, RetryPolicy, RetryingHttpExecutor,
        SlidingWindowRateLimiter,
    };
}

// Re-export key types at crate root
pub use callback::{
    CallbackError, CallbackTaskRegistry, HandlerRegistry, InvokeRequest, PendingRunSweeper,
    TaskRunRecorder,
};
pub use coordination::{
    CoordinationStore, InMemoryCoordinationStore, RedisCoordinationStore, StoreError,
};
pub use job::{Job, JobOutcome, JobRunner, JobScheduler};
pub use lock::{DistributedMutex, LockError, LockLease};
pub use persistence::{
    CallbackStore, CallbackStoreError, InMemoryCallbackStore, PostgresCallbackStore,
};
pub use reliability::{
    RateLimitPolicy, RetryPolicy, RetryingHttpExecutor, SlidingWindowRateLimiter,
};
