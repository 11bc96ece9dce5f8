//! In-memory implementation of CallbackStore for testing

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::callback::{
    CallbackTask, CallbackTaskRun, NewCallbackTask, NewTaskRun, RunUpdate, TaskIdentity,
};

#[derive(Default)]
struct Tables {
    tasks: BTreeMap<i64, CallbackTask>,
    identities: HashMap<TaskIdentity, i64>,
    runs: BTreeMap<i64, CallbackTaskRun>,
    next_task_id: i64,
    next_run_id: i64,
}

/// In-memory implementation of CallbackStore
///
/// Provides the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use jobguard_durable::InMemoryCallbackStore;
///
/// let store = InMemoryCallbackStore::new();
/// assert_eq!(store.run_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryCallbackStore {
    tables: RwLock<Tables>,
}

impl InMemoryCallbackStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered tasks
    pub fn task_count(&self) -> usize {
        self.tables.read().tasks.len()
    }

    /// Number of runs across all tasks
    pub fn run_count(&self) -> usize {
        self.tables.read().runs.len()
    }

    /// Remove a task, leaving its runs orphaned
    pub fn remove_task(&self, task_id: i64) -> bool {
        let mut tables = self.tables.write();
        match tables.tasks.remove(&task_id) {
            Some(task) => {
                tables.identities.remove(&task.identity);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl CallbackStore for InMemoryCallbackStore {
    async fn find_task(
        &self,
        identity: &TaskIdentity,
    ) -> Result<Option<CallbackTask>, CallbackStoreError> {
        let tables = self.tables.read();
        Ok(tables
            .identities
            .get(identity)
            .and_then(|id| tables.tasks.get(id))
            .cloned())
    }

    async fn register_task(
        &self,
        task: NewCallbackTask,
    ) -> Result<CallbackTask, CallbackStoreError> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables
            .identities
            .get(&task.identity)
            .and_then(|id| tables.tasks.get(id))
        {
            return Ok(existing.clone());
        }

        tables.next_task_id += 1;
        let id = tables.next_task_id;
        let now = Utc::now();
        let row = CallbackTask {
            id,
            task_uuid: Uuid::now_v7(),
            identity: task.identity,
            step_name: task.step_name,
            payload_template: task.payload_template,
            http_method: task.http_method,
            active: true,
            retry_policy: task.retry_policy,
            created_at: now,
            updated_at: now,
        };
        tables.identities.insert(task.identity, id);
        tables.tasks.insert(id, row.clone());
        Ok(row)
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<CallbackTask>, CallbackStoreError> {
        Ok(self.tables.read().tasks.get(&task_id).cloned())
    }

    async fn insert_run(&self, run: NewTaskRun) -> Result<CallbackTaskRun, CallbackStoreError> {
        let mut tables = self.tables.write();
        if !tables.tasks.contains_key(&run.task_id) {
            return Err(CallbackStoreError::TaskNotFound(run.task_id));
        }

        tables.next_run_id += 1;
        let id = tables.next_run_id;
        let now = Utc::now();
        let row = CallbackTaskRun {
            id,
            run_uuid: Uuid::now_v7(),
            task_id: run.task_id,
            status: run.status,
            payload: run.payload,
            response: run.response,
            attempts: run.attempts,
            next_run_at: run.next_run_at,
            created_at: now,
            updated_at: now,
        };
        tables.runs.insert(id, row.clone());
        Ok(row)
    }

    async fn update_run(
        &self,
        run_id: i64,
        update: RunUpdate,
    ) -> Result<CallbackTaskRun, CallbackStoreError> {
        let mut tables = self.tables.write();
        let run = tables
            .runs
            .get_mut(&run_id)
            .ok_or(CallbackStoreError::RunNotFound(run_id))?;

        if run.status.is_terminal() {
            return Err(CallbackStoreError::TerminalRun(run_id));
        }

        run.status = update.status;
        run.response = update.response;
        run.attempts = update.attempts;
        run.next_run_at = update.next_run_at;
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<CallbackTaskRun>, CallbackStoreError> {
        Ok(self.tables.read().runs.get(&run_id).cloned())
    }

    async fn due_pending_runs(
        &self,
        now: DateTime<Utc>,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<CallbackTaskRun>, CallbackStoreError> {
        let tables = self.tables.read();
        Ok(tables
            .runs
            .range(after_id.saturating_add(1)..)
            .map(|(_, run)| run)
            .filter(|run| !run.status.is_terminal())
            .filter(|run| run.next_run_at.map_or(true, |at| at <= now))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn runs_for_task(
        &self,
        task_id: i64,
    ) -> Result<Vec<CallbackTaskRun>, CallbackStoreError> {
        Ok(self
            .tables
            .read()
            .runs
            .values()
            .filter(|run| run.task_id == task_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{ApiName, ItemType, RunStatus, TaskFunction};
    use chrono::Duration;
    use serde_json::json;

    fn identity() -> TaskIdentity {
        TaskIdentity::new(ApiName::Tonfest, TaskFunction::AddUserTicketFromOnton)
    }

    fn pending_run(task_id: i64, next_run_at: Option<DateTime<Utc>>) -> NewTaskRun {
        NewTaskRun {
            task_id,
            status: RunStatus::Pending,
            payload: Some(json!({"user": 1})),
            response: json!({"error": "timeout"}),
            attempts: 1,
            next_run_at,
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let store = InMemoryCallbackStore::new();

        let first = store.register_task(NewCallbackTask::new(identity())).await.unwrap();
        let second = store.register_task(NewCallbackTask::new(identity())).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.task_count(), 1);
        assert!(first.active);
    }

    #[tokio::test]
    async fn test_absent_item_fields_are_part_of_identity() {
        let store = InMemoryCallbackStore::new();

        let bare = store.register_task(NewCallbackTask::new(identity())).await.unwrap();
        let scoped = store
            .register_task(NewCallbackTask::new(
                identity().with_item(ItemType::Event, Some(7)),
            ))
            .await
            .unwrap();

        assert_ne!(bare.id, scoped.id);
        assert_eq!(
            store.find_task(&identity()).await.unwrap().map(|t| t.id),
            Some(bare.id)
        );
        assert!(store
            .find_task(&identity().with_item(ItemType::Event, None))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_terminal_runs_are_immutable() {
        let store = InMemoryCallbackStore::new();
        let task = store.register_task(NewCallbackTask::new(identity())).await.unwrap();
        let run = store.insert_run(pending_run(task.id, None)).await.unwrap();

        let done = store
            .update_run(
                run.id,
                RunUpdate {
                    status: RunStatus::Success,
                    response: json!({"ok": true}),
                    attempts: 2,
                    next_run_at: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Success);

        let result = store
            .update_run(
                run.id,
                RunUpdate {
                    status: RunStatus::Pending,
                    response: json!({}),
                    attempts: 3,
                    next_run_at: None,
                },
            )
            .await;
        assert!(matches!(result, Err(CallbackStoreError::TerminalRun(id)) if id == run.id));
    }

    #[tokio::test]
    async fn test_insert_run_requires_task() {
        let store = InMemoryCallbackStore::new();
        let result = store.insert_run(pending_run(99, None)).await;
        assert!(matches!(result, Err(CallbackStoreError::TaskNotFound(99))));
    }

    #[tokio::test]
    async fn test_due_pending_runs_pages_by_id() {
        let store = InMemoryCallbackStore::new();
        let task = store.register_task(NewCallbackTask::new(identity())).await.unwrap();
        let now = Utc::now();

        let due_a = store
            .insert_run(pending_run(task.id, Some(now - Duration::seconds(5))))
            .await
            .unwrap();
        store
            .insert_run(pending_run(task.id, Some(now + Duration::minutes(5))))
            .await
            .unwrap();
        let due_b = store.insert_run(pending_run(task.id, None)).await.unwrap();

        let page = store.due_pending_runs(now, 0, 1).await.unwrap();
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![due_a.id]);

        let page = store.due_pending_runs(now, due_a.id, 10).await.unwrap();
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![due_b.id]);

        assert!(store.due_pending_runs(now, due_b.id, 10).await.unwrap().is_empty());
    }
}
