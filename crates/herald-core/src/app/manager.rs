//! TaskManager - every storage call goes through here.
//!
//! Wraps the store with the retry policy, turns `StorageError` into
//! `EngineError`, reports failures to the event sink and keeps the task
//! metrics up to date.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::debug;

use crate::domain::{EngineError, InstanceId, Task, TaskId};
use crate::ports::metrics::{TASKS_CONFIRMED, TASKS_CREATED, TASKS_DELETED, TASKS_OUTSTANDING};
use crate::ports::{
    CollectionCursor, EventLevel, EventSink, MetricKind, MetricsBus, StorageError, TaskStore,
};
use crate::queue::RetryPolicy;

pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    retry: RetryPolicy,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsBus>,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        retry: RetryPolicy,
        events: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsBus>,
    ) -> Self {
        metrics.init(TASKS_OUTSTANDING, MetricKind::Gauge);
        metrics.init(TASKS_CREATED, MetricKind::Counter);
        metrics.init(TASKS_DELETED, MetricKind::Counter);
        metrics.init(TASKS_CONFIRMED, MetricKind::Counter);

        Self {
            store,
            retry,
            events,
            metrics,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.store.instance_id()
    }

    pub async fn up(&self) -> Result<(), EngineError> {
        self.retry
            .retry("up", || self.store.up(), StorageError::is_retryable)
            .await
            .map_err(|err| {
                self.report("schema provisioning failed", &err, json!({}));
                EngineError::SchemaFailed(err.to_string())
            })
    }

    pub async fn release_claims(&self) -> Result<u64, EngineError> {
        self.retry
            .retry(
                "release_claims",
                || self.store.release_claims(),
                StorageError::is_retryable,
            )
            .await
            .map_err(|err| {
                self.report("releasing stale claims failed", &err, json!({}));
                EngineError::GetFailed(err.to_string())
            })
    }

    /// Set the outstanding-task gauge from the store's count.
    pub async fn seed_task_count(&self) -> Result<u64, EngineError> {
        let count = self
            .retry
            .retry("count", || self.store.count(), StorageError::is_retryable)
            .await
            .map_err(|err| {
                self.report("counting tasks failed", &err, json!({}));
                EngineError::GetFailed(err.to_string())
            })?;

        self.metrics.publish(TASKS_OUTSTANDING, count as i64);
        Ok(count)
    }

    pub async fn create(&self, task: &Task, is_taken: bool) -> Result<(), EngineError> {
        let result = self
            .retry
            .retry(
                "create",
                || self.store.create(task, is_taken),
                StorageError::is_retryable,
            )
            .await;

        match result {
            Ok(()) => {
                debug!(task_id = %task.id(), exec_time = task.exec_time(), is_taken, "task created");
                self.metrics.publish(TASKS_OUTSTANDING, 1);
                self.metrics.publish(TASKS_CREATED, 1);
                Ok(())
            }
            Err(StorageError::Duplicate(id)) => Err(EngineError::DuplicateTask(id)),
            Err(err) => {
                self.report(
                    "creating task failed",
                    &err,
                    json!({ "task_id": task.id().to_string(), "exec_time": task.exec_time() }),
                );
                Err(EngineError::CreatingFailed {
                    task_id: task.id(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Claim the collections due within `lookahead`.
    ///
    /// [`EngineError::CollectionsNotFound`] means "nothing to do yet" and is
    /// not reported.
    pub async fn find_due_window(
        &self,
        lookahead: Duration,
    ) -> Result<Arc<dyn CollectionCursor>, EngineError> {
        let result = self
            .retry
            .retry(
                "find_due_window",
                || self.store.find_due_window(lookahead),
                StorageError::is_retryable,
            )
            .await;

        match result {
            Ok(cursor) => Ok(cursor),
            Err(StorageError::NotFound) => Err(EngineError::CollectionsNotFound),
            Err(err) => {
                self.report(
                    "fetching due collections failed",
                    &err,
                    json!({ "lookahead_ms": lookahead.as_millis() as u64 }),
                );
                Err(EngineError::GetFailed(err.to_string()))
            }
        }
    }

    pub async fn next_collection(
        &self,
        cursor: &dyn CollectionCursor,
    ) -> Result<Option<Vec<Task>>, EngineError> {
        self.retry
            .retry("next_collection", || cursor.next(), StorageError::is_retryable)
            .await
            .map_err(|err| {
                self.report("fetching collection tasks failed", &err, json!({}));
                EngineError::GetFailed(err.to_string())
            })
    }

    /// Delete tasks the caller no longer wants. Returns the affected count.
    pub async fn delete(&self, ids: &[TaskId]) -> Result<u64, EngineError> {
        let affected = self
            .retry
            .retry("delete", || self.store.delete(ids), StorageError::is_retryable)
            .await
            .map_err(|err| {
                self.report(
                    "deleting tasks failed",
                    &err,
                    json!({ "count": ids.len() }),
                );
                EngineError::DeletingFailed(err.to_string())
            })?;

        self.metrics.publish(TASKS_OUTSTANDING, -(affected as i64));
        self.metrics.publish(TASKS_DELETED, affected as i64);
        Ok(affected)
    }

    /// Purge a batch of delivered and confirmed tasks.
    pub async fn confirm_execution(&self, tasks: &[Task]) -> Result<u64, EngineError> {
        let ids: Vec<TaskId> = tasks.iter().map(Task::id).collect();
        let affected = self
            .retry
            .retry("confirm", || self.store.delete(&ids), StorageError::is_retryable)
            .await
            .map_err(|err| {
                self.report(
                    "confirming tasks failed",
                    &err,
                    json!({ "batch_size": ids.len() }),
                );
                EngineError::ConfirmingFailed {
                    count: ids.len(),
                    reason: err.to_string(),
                }
            })?;

        debug!(batch_size = ids.len(), affected, "batch confirmed");
        self.metrics.publish(TASKS_OUTSTANDING, -(affected as i64));
        self.metrics.publish(TASKS_CONFIRMED, affected as i64);
        Ok(affected)
    }

    fn report(&self, message: &str, err: &StorageError, mut context: serde_json::Value) {
        context["error"] = json!(err.to_string());
        context["instance_id"] = json!(self.instance_id().as_str());
        self.events.emit(EventLevel::Error, message, context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{LocalMetricsBus, MemoryEventSink};
    use crate::ports::FixedClock;
    use crate::storage::{InMemoryTaskStore, StoreOptions};
    use ulid::Ulid;

    const NOW: i64 = 1_700_000_000;

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        events: Arc<MemoryEventSink>,
        metrics: Arc<LocalMetricsBus>,
        manager: TaskManager,
    }

    fn fixture(max_retry: u32) -> Fixture {
        let store = Arc::new(InMemoryTaskStore::new(
            InstanceId::new("node-a"),
            Arc::new(FixedClock::at_secs(NOW)),
            StoreOptions::default(),
        ));
        let events = Arc::new(MemoryEventSink::new());
        let metrics = Arc::new(LocalMetricsBus::new());
        let manager = TaskManager::new(
            store.clone(),
            RetryPolicy::new(max_retry, Duration::from_millis(5)),
            events.clone(),
            metrics.clone(),
        );
        Fixture {
            store,
            events,
            metrics,
            manager,
        }
    }

    fn task_at(exec_time: i64) -> Task {
        Task::new(TaskId::from_ulid(Ulid::new()), exec_time)
    }

    #[tokio::test(start_paused = true)]
    async fn create_retries_through_lock_conflicts() {
        let f = fixture(5);
        f.store.inject_deadlocks(3).await;

        f.manager.create(&task_at(NOW), false).await.unwrap();

        assert_eq!(f.store.count().await.unwrap(), 1);
        assert_eq!(f.metrics.value(TASKS_OUTSTANDING), Some(1));
        assert_eq!(f.metrics.value(TASKS_CREATED), Some(1));
        assert!(f.events.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_creating_failed() {
        let f = fixture(2);
        f.store.inject_deadlocks(2).await;
        let task = task_at(NOW);

        let err = f.manager.create(&task, false).await.unwrap_err();

        assert!(matches!(err, EngineError::CreatingFailed { task_id, .. } if task_id == task.id()));
        assert_eq!(f.events.count(EventLevel::Error), 1);
        assert_eq!(f.metrics.value(TASKS_OUTSTANDING), Some(0));
    }

    #[tokio::test]
    async fn duplicates_are_permanent_and_silent() {
        let f = fixture(5);
        let task = task_at(NOW);
        f.manager.create(&task, false).await.unwrap();

        let err = f.manager.create(&task, false).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateTask(id) if id == task.id()));
        assert!(f.events.events().is_empty());
    }

    #[tokio::test]
    async fn empty_window_is_collections_not_found() {
        let f = fixture(5);
        let err = f.manager.find_due_window(Duration::from_secs(5)).await.err();
        assert!(matches!(err, Some(EngineError::CollectionsNotFound)));
        assert!(f.events.events().is_empty());
    }

    #[tokio::test]
    async fn confirm_and_delete_move_the_gauge() {
        let f = fixture(5);
        let tasks: Vec<Task> = (0..4).map(|_| task_at(NOW)).collect();
        for task in &tasks {
            f.manager.create(task, false).await.unwrap();
        }

        assert_eq!(f.manager.confirm_execution(&tasks[..3]).await.unwrap(), 3);
        assert_eq!(f.manager.delete(&[tasks[3].id()]).await.unwrap(), 1);
        // already gone
        assert_eq!(f.manager.delete(&[tasks[3].id()]).await.unwrap(), 0);

        assert_eq!(f.metrics.value(TASKS_OUTSTANDING), Some(0));
        assert_eq!(f.metrics.value(TASKS_CONFIRMED), Some(3));
        assert_eq!(f.metrics.value(TASKS_DELETED), Some(1));
        assert_eq!(f.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn seed_task_count_sets_the_gauge() {
        let f = fixture(5);
        for _ in 0..3 {
            f.store.create(&task_at(NOW), false).await.unwrap();
        }

        assert_eq!(f.manager.seed_task_count().await.unwrap(), 3);
        assert_eq!(f.metrics.value(TASKS_OUTSTANDING), Some(3));
    }
}
