//! Callback task data model

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::reliability::{RetryPolicy, MAX_ATTEMPTS};

/// Error returned when a stored enum value is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident as $kind:literal { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum! {
    /// External API a callback is delivered to
    ApiName as "api name" {
        Tonfest => "TONFEST",
        TsApi => "TS_API",
        PridipieApi => "PRIDIPIE_API",
    }
}

string_enum! {
    /// Operation performed against the external API
    TaskFunction as "task function" {
        AddUserTicketFromOnton => "addUserTicketFromOnton",
        AddSbtFromOnton => "addSbtFromOnton",
        PridipieAuth => "PridipieAUTH",
    }
}

string_enum! {
    /// Kind of platform item a task is scoped to
    ItemType as "item type" {
        Event => "EVENT",
        AllItems => "ALL_ITEMS",
        EventOrganizer => "EVENT_ORGANIZER",
    }
}

string_enum! {
    /// Platform step that triggers a callback
    StepName as "step name" {
        EventCreated => "event_created",
        EventUpdated => "event_updated",
        PaymentCompleted => "payment_completed",
        OrderCompleted => "order_completed",
        EventStarted => "event_started",
        EventEnded => "event_ended",
    }
}

string_enum! {
    HttpMethod as "http method" {
        Get => "GET",
        Post => "POST",
        Put => "PUT",
        Patch => "PATCH",
        Delete => "DELETE",
    }
}

string_enum! {
    /// Lifecycle of a callback task run
    ///
    /// `Success` and `Failure` are terminal.
    RunStatus as "run status" {
        Pending => "PENDING",
        Success => "SUCCESS",
        Failure => "FAILURE",
    }
}

impl Default for HttpMethod {
    fn default() -> Self {
        Self::Post
    }
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Status for a run that just failed its `attempts`-th attempt
///
/// ```
/// use jobguard_durable::callback::{compute_next_status, RunStatus};
///
/// assert_eq!(compute_next_status(1), RunStatus::Pending);
/// assert_eq!(compute_next_status(2), RunStatus::Failure);
/// ```
pub fn compute_next_status(attempts: u32) -> RunStatus {
    next_status_within(attempts, MAX_ATTEMPTS)
}

/// [`compute_next_status`] against a task-specific attempt limit
pub fn next_status_within(attempts: u32, max_attempts: u32) -> RunStatus {
    if attempts + 1 >= max_attempts {
        RunStatus::Failure
    } else {
        RunStatus::Pending
    }
}

/// Identity of a callback task; unique across the store
///
/// Absent `item_type` / `item_id` take part in the identity: two
/// registrations without an item id refer to the same task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskIdentity {
    pub api_name: ApiName,
    pub task_function: TaskFunction,
    pub item_type: Option<ItemType>,
    pub item_id: Option<i64>,
}

impl TaskIdentity {
    pub fn new(api_name: ApiName, task_function: TaskFunction) -> Self {
        Self {
            api_name,
            task_function,
            item_type: None,
            item_id: None,
        }
    }

    pub fn with_item(mut self, item_type: ItemType, item_id: Option<i64>) -> Self {
        self.item_type = Some(item_type);
        self.item_id = item_id;
        self
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_name, self.task_function)?;
        if let Some(item_type) = self.item_type {
            write!(f, "/{item_type}")?;
        }
        if let Some(item_id) = self.item_id {
            write!(f, "/{item_id}")?;
        }
        Ok(())
    }
}

/// Retry settings stored with each task
///
/// Serialised as `{"max_attempts": 3, "wait_for_retry_ms": 0}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub wait_for_retry_ms: u64,
}

fn default_max_attempts() -> u32 {
    MAX_ATTEMPTS
}

impl Default for TaskRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            wait_for_retry_ms: 0,
        }
    }
}

impl TaskRetryPolicy {
    pub fn wait_for_retry(&self) -> Duration {
        Duration::from_millis(self.wait_for_retry_ms)
    }

    /// Fixed-interval [`RetryPolicy`] equivalent
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.wait_for_retry(), self.max_attempts)
    }
}

/// Registration data for a new callback task
#[derive(Debug, Clone, PartialEq)]
pub struct NewCallbackTask {
    pub identity: TaskIdentity,
    pub step_name: Option<StepName>,
    pub payload_template: Option<Value>,
    pub http_method: HttpMethod,
    pub retry_policy: TaskRetryPolicy,
}

impl NewCallbackTask {
    pub fn new(identity: TaskIdentity) -> Self {
        Self {
            identity,
            step_name: None,
            payload_template: None,
            http_method: HttpMethod::default(),
            retry_policy: TaskRetryPolicy::default(),
        }
    }

    pub fn with_step_name(mut self, step_name: StepName) -> Self {
        self.step_name = Some(step_name);
        self
    }

    pub fn with_payload_template(mut self, template: Value) -> Self {
        self.payload_template = Some(template);
        self
    }

    pub fn with_http_method(mut self, method: HttpMethod) -> Self {
        self.http_method = method;
        self
    }

    pub fn with_retry_policy(mut self, policy: TaskRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Registered unit of outbound work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackTask {
    pub id: i64,
    pub task_uuid: Uuid,
    #[serde(flatten)]
    pub identity: TaskIdentity,
    pub step_name: Option<StepName>,
    pub payload_template: Option<Value>,
    pub http_method: HttpMethod,
    pub active: bool,
    pub retry_policy: TaskRetryPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Data for inserting a run row
#[derive(Debug, Clone, PartialEq)]
pub struct NewTaskRun {
    pub task_id: i64,
    pub status: RunStatus,
    pub payload: Option<Value>,
    pub response: Value,
    pub attempts: u32,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Changes applied to a PENDING run after a retry
#[derive(Debug, Clone, PartialEq)]
pub struct RunUpdate {
    pub status: RunStatus,
    pub response: Value,
    pub attempts: u32,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// One attempt history record for a callback task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackTaskRun {
    pub id: i64,
    pub run_uuid: Uuid,
    pub task_id: i64,
    pub status: RunStatus,
    pub payload: Option<Value>,
    pub response: Value,
    pub attempts: u32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
