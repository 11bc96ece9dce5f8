//! Periodic job execution
//!
//! This module provides:
//! - [`JobRunner`] - runs a [`Job`] under its fleet-wide lock
//! - [`Heartbeat`] - lock renewal handed to long-running job bodies
//! - [`JobScheduler`] - one periodic timer per registered job
//! - [`AlertSink`] - operator notification for failed jobs
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ tick ┌─────────────┐ acquire/renew/release ┌──────────────────┐
//! │ JobScheduler │ ───► │  JobRunner  │ ────────────────────► │ DistributedMutex │
//! └──────────────┘      └──────┬──────┘                       └──────────────────┘
//!                              │ run(heartbeat)        on error
//!                              ▼                    ┌────────────┐
//!                        ┌───────────┐ ───────────► │ AlertSink  │
//!                        │    Job    │              └────────────┘
//!                        └───────────┘
//! ```

mod alert;
mod runner;
mod scheduler;

pub use alert::{
    Alert, AlertError, AlertSink, InMemoryAlertSink, TracingAlertSink, WebhookAlertSink,
    SYSTEM_TOPIC,
};
pub(crate) use runner::panic_message;
pub use runner::{FnJob, Heartbeat, Job, JobOutcome, JobRunner, JobRunnerConfig, DEFAULT_LOCK_TTL};
pub use scheduler::{JobScheduler, SchedulerError};
