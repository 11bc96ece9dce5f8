//! PostgreSQL implementation of CallbackStore
//!
//! - Idempotent task registration via `ON CONFLICT` on the identity constraint
//! - Terminal runs guarded in the `UPDATE` predicate

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::callback::{
    CallbackTask, CallbackTaskRun, NewCallbackTask, NewTaskRun, RunUpdate, TaskIdentity,
    TaskRetryPolicy,
};

const TASK_COLUMNS: &str = "id, task_uuid, api_name, task_function, item_type, item_id, \
     step_name, payload_template, http_method, active, retry_policy, created_at, updated_at";

const RUN_COLUMNS: &str = "id, run_uuid, callback_task_id, status, payload, response, \
     attempts, next_run_at, created_at, updated_at";

/// Apply the bundled schema migrations
pub async fn migrate(pool: &PgPool) -> Result<(), CallbackStoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| {
            error!("Failed to run migrations: {}", e);
            CallbackStoreError::Database(e.to_string())
        })
}

/// PostgreSQL implementation of CallbackStore
///
/// # Example
///
/// ```ignore
/// use jobguard_durable::PostgresCallbackStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// jobguard_durable::persistence::migrate(&pool).await?;
/// let store = PostgresCallbackStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresCallbackStore {
    pool: PgPool,
}

impl PostgresCallbackStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_error(context: &str) -> impl Fn(sqlx::Error) -> CallbackStoreError + '_ {
    move |e| {
        error!("Failed to {}: {}", context, e);
        CallbackStoreError::Database(e.to_string())
    }
}

#[async_trait]
impl CallbackStore for PostgresCallbackStore {
    #[instrument(skip(self, identity), fields(identity = %identity))]
    async fn find_task(
        &self,
        identity: &TaskIdentity,
    ) -> Result<Option<CallbackTask>, CallbackStoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM callback_tasks
            WHERE api_name = $1
              AND task_function = $2
              AND item_type IS NOT DISTINCT FROM $3
              AND item_id IS NOT DISTINCT FROM $4
            "#
        ))
        .bind(identity.api_name.as_str())
        .bind(identity.task_function.as_str())
        .bind(identity.item_type.map(|t| t.as_str()))
        .bind(identity.item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("find callback task"))?;

        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self, task), fields(identity = %task.identity))]
    async fn register_task(
        &self,
        task: NewCallbackTask,
    ) -> Result<CallbackTask, CallbackStoreError> {
        let retry_policy = serde_json::to_value(task.retry_policy)
            .map_err(|e| CallbackStoreError::Serialization(e.to_string()))?;

        // The no-op update makes RETURNING yield the existing row on conflict
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO callback_tasks
                (task_uuid, api_name, task_function, item_type, item_id,
                 step_name, payload_template, http_method, retry_policy)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT ON CONSTRAINT callback_tasks_identity_key
            DO UPDATE SET updated_at = callback_tasks.updated_at
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(task.identity.api_name.as_str())
        .bind(task.identity.task_function.as_str())
        .bind(task.identity.item_type.map(|t| t.as_str()))
        .bind(task.identity.item_id)
        .bind(task.step_name.map(|s| s.as_str()))
        .bind(&task.payload_template)
        .bind(task.http_method.as_str())
        .bind(&retry_policy)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("register callback task"))?;

        let registered = task_from_row(&row)?;
        debug!(task_id = registered.id, "registered callback task");
        Ok(registered)
    }

    #[instrument(skip(self))]
    async fn get_task(&self, task_id: i64) -> Result<Option<CallbackTask>, CallbackStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM callback_tasks WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get callback task"))?;

        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self, run), fields(task_id = run.task_id, status = %run.status))]
    async fn insert_run(&self, run: NewTaskRun) -> Result<CallbackTaskRun, CallbackStoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO callback_task_runs
                (run_uuid, callback_task_id, status, payload, response, attempts, next_run_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(run.task_id)
        .bind(run.status.as_str())
        .bind(&run.payload)
        .bind(&run.response)
        .bind(run.attempts as i32)
        .bind(run.next_run_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                CallbackStoreError::TaskNotFound(run.task_id)
            }
            _ => {
                error!("Failed to insert callback task run: {}", e);
                CallbackStoreError::Database(e.to_string())
            }
        })?;

        run_from_row(&row)
    }

    #[instrument(skip(self, update), fields(status = %update.status))]
    async fn update_run(
        &self,
        run_id: i64,
        update: RunUpdate,
    ) -> Result<CallbackTaskRun, CallbackStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE callback_task_runs
            SET status = $2, response = $3, attempts = $4, next_run_at = $5, updated_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(update.status.as_str())
        .bind(&update.response)
        .bind(update.attempts as i32)
        .bind(update.next_run_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("update callback task run"))?;

        match row {
            Some(row) => run_from_row(&row),
            None => match self.get_run(run_id).await? {
                Some(_) => Err(CallbackStoreError::TerminalRun(run_id)),
                None => Err(CallbackStoreError::RunNotFound(run_id)),
            },
        }
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: i64) -> Result<Option<CallbackTaskRun>, CallbackStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM callback_task_runs WHERE id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get callback task run"))?;

        row.as_ref().map(run_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn due_pending_runs(
        &self,
        now: DateTime<Utc>,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<CallbackTaskRun>, CallbackStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM callback_task_runs
            WHERE status = 'PENDING'
              AND (next_run_at IS NULL OR next_run_at <= $1)
              AND id > $2
            ORDER BY id
            LIMIT $3
            "#
        ))
        .bind(now)
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("fetch pending callback runs"))?;

        rows.iter().map(run_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn runs_for_task(
        &self,
        task_id: i64,
    ) -> Result<Vec<CallbackTaskRun>, CallbackStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM callback_task_runs WHERE callback_task_id = $1 ORDER BY id"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list callback task runs"))?;

        rows.iter().map(run_from_row).collect()
    }
}

fn parse<T>(value: &str) -> Result<T, CallbackStoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| CallbackStoreError::Serialization(e.to_string()))
}

fn parse_opt<T>(value: Option<String>) -> Result<Option<T>, CallbackStoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.as_deref().map(parse).transpose()
}

fn task_from_row(row: &PgRow) -> Result<CallbackTask, CallbackStoreError> {
    let api_name: String = row.get("api_name");
    let task_function: String = row.get("task_function");
    let http_method: String = row.get("http_method");
    let retry_policy: serde_json::Value = row.get("retry_policy");

    Ok(CallbackTask {
        id: row.get("id"),
        task_uuid: row.get("task_uuid"),
        identity: TaskIdentity {
            api_name: parse(&api_name)?,
            task_function: parse(&task_function)?,
            item_type: parse_opt(row.get("item_type"))?,
            item_id: row.get("item_id"),
        },
        step_name: parse_opt(row.get("step_name"))?,
        payload_template: row.get("payload_template"),
        http_method: parse(&http_method)?,
        active: row.get("active"),
        retry_policy: serde_json::from_value::<TaskRetryPolicy>(retry_policy)
            .map_err(|e| CallbackStoreError::Serialization(e.to_string()))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn run_from_row(row: &PgRow) -> Result<CallbackTaskRun, CallbackStoreError> {
    let status: String = row.get("status");
    let attempts: i32 = row.get("attempts");

    Ok(CallbackTaskRun {
        id: row.get("id"),
        run_uuid: row.get("run_uuid"),
        task_id: row.get("callback_task_id"),
        status: parse(&status)?,
        payload: row.get("payload"),
        response: row.get("response"),
        attempts: attempts.max(0) as u32,
        next_run_at: row.get("next_run_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
