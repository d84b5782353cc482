//! In-memory task store.
//!
//! Same collection semantics as the MySQL store, with the single state mutex
//! standing in for row locks. Several instances can share one backing state
//! through [`InMemoryTaskStore::for_instance`], which is how tests exercise
//! cross-instance claiming.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::StoreOptions;
use crate::domain::{InstanceId, Task, TaskId};
use crate::ports::{Clock, CollectionCursor, StorageError, StorageResult, TaskStore};

#[derive(Debug, Clone)]
struct Collection {
    exec_time: i64,
    taken_by: Option<InstanceId>,
    tasks: Vec<TaskId>,
}

/// Read-only view of a collection, for assertions and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSnapshot {
    pub id: u64,
    pub exec_time: i64,
    pub taken_by: Option<InstanceId>,
    pub size: usize,
}

#[derive(Default)]
struct InMemoryStoreState {
    collections: BTreeMap<u64, Collection>,

    /// task -> owning collection
    task_index: HashMap<TaskId, u64>,

    next_collection_id: u64,
    delete_calls: u64,

    /// Remaining calls that fail with a lock conflict.
    injected_deadlocks: u32,
}

impl InMemoryStoreState {
    fn take_injected_deadlock(&mut self, operation: &str) -> StorageResult<()> {
        if self.injected_deadlocks > 0 {
            self.injected_deadlocks -= 1;
            return Err(StorageError::Deadlock(format!("injected during {operation}")));
        }
        Ok(())
    }

    fn find_open_collection(
        &self,
        exec_time: i64,
        owner: Option<&InstanceId>,
        capacity: usize,
    ) -> Option<u64> {
        self.collections
            .iter()
            .find(|(_, c)| {
                c.exec_time == exec_time && c.taken_by.as_ref() == owner && c.tasks.len() < capacity
            })
            .map(|(id, _)| *id)
    }

    fn open_collection(&mut self, exec_time: i64, owner: Option<InstanceId>) -> u64 {
        self.next_collection_id += 1;
        let id = self.next_collection_id;
        self.collections.insert(
            id,
            Collection {
                exec_time,
                taken_by: owner,
                tasks: Vec::new(),
            },
        );
        id
    }

    fn prune_empty_collections(&mut self, now_secs: i64) -> usize {
        let before = self.collections.len();
        self.collections
            .retain(|_, c| !(c.tasks.is_empty() && c.exec_time < now_secs));
        before - self.collections.len()
    }
}

pub struct InMemoryTaskStore {
    instance: InstanceId,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
    state: Arc<Mutex<InMemoryStoreState>>,
}

impl InMemoryTaskStore {
    pub fn new(instance: InstanceId, clock: Arc<dyn Clock>, options: StoreOptions) -> Self {
        Self {
            instance,
            clock,
            options,
            state: Arc::new(Mutex::new(InMemoryStoreState::default())),
        }
    }

    /// Another instance's view of the same backing state.
    pub fn for_instance(&self, instance: InstanceId) -> Self {
        Self {
            instance,
            clock: Arc::clone(&self.clock),
            options: self.options.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Make the next `n` store calls fail with [`StorageError::Deadlock`].
    pub async fn inject_deadlocks(&self, n: u32) {
        self.state.lock().await.injected_deadlocks = n;
    }

    pub async fn collections(&self) -> Vec<CollectionSnapshot> {
        let state = self.state.lock().await;
        state
            .collections
            .iter()
            .map(|(id, c)| CollectionSnapshot {
                id: *id,
                exec_time: c.exec_time,
                taken_by: c.taken_by.clone(),
                size: c.tasks.len(),
            })
            .collect()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    async fn create(&self, task: &Task, is_taken: bool) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.take_injected_deadlock("create")?;

        if state.task_index.contains_key(&task.id()) {
            return Err(StorageError::Duplicate(task.id()));
        }

        let owner = is_taken.then(|| self.instance.clone());
        let collection_id = match state.find_open_collection(
            task.exec_time(),
            owner.as_ref(),
            self.options.collection_capacity,
        ) {
            Some(id) => id,
            None => state.open_collection(task.exec_time(), owner),
        };

        if let Some(collection) = state.collections.get_mut(&collection_id) {
            collection.tasks.push(task.id());
        }
        state.task_index.insert(task.id(), collection_id);
        Ok(())
    }

    async fn find_due_window(
        &self,
        lookahead: Duration,
    ) -> StorageResult<Arc<dyn CollectionCursor>> {
        let lookahead_ms = i64::try_from(lookahead.as_millis()).unwrap_or(i64::MAX);
        let deadline = self.clock.now_millis().saturating_add(lookahead_ms) / 1000;

        let mut state = self.state.lock().await;
        state.take_injected_deadlock("find_due_window")?;

        let mut due: Vec<(i64, u64)> = state
            .collections
            .iter()
            .filter(|(_, c)| c.taken_by.is_none() && c.exec_time <= deadline)
            .map(|(id, c)| (c.exec_time, *id))
            .collect();
        due.sort_unstable();
        due.truncate(self.options.search_batch_size);

        if due.is_empty() {
            return Err(StorageError::NotFound);
        }

        let ids: Vec<u64> = due.into_iter().map(|(_, id)| id).collect();
        for id in &ids {
            if let Some(collection) = state.collections.get_mut(id) {
                collection.taken_by = Some(self.instance.clone());
            }
        }

        tracing::debug!(
            instance_id = %self.instance,
            collections = ids.len(),
            "claimed due collections"
        );

        Ok(Arc::new(MemoryCursor {
            ids,
            position: AtomicUsize::new(0),
            state: Arc::clone(&self.state),
        }))
    }

    async fn delete(&self, ids: &[TaskId]) -> StorageResult<u64> {
        let now_secs = self.clock.now_secs();
        let mut state = self.state.lock().await;
        state.take_injected_deadlock("delete")?;

        let mut affected = 0u64;
        for id in ids {
            let Some(collection_id) = state.task_index.remove(id) else {
                continue;
            };
            if let Some(collection) = state.collections.get_mut(&collection_id) {
                collection.tasks.retain(|t| t != id);
            }
            affected += 1;
        }

        state.delete_calls += 1;
        if state.delete_calls % self.options.cleaning_frequency.max(1) == 0 {
            let pruned = state.prune_empty_collections(now_secs);
            tracing::debug!(pruned, "swept empty collections");
        }

        Ok(affected)
    }

    async fn count(&self) -> StorageResult<u64> {
        let mut state = self.state.lock().await;
        state.take_injected_deadlock("count")?;
        Ok(state.task_index.len() as u64)
    }

    async fn up(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn release_claims(&self) -> StorageResult<u64> {
        let mut state = self.state.lock().await;
        state.take_injected_deadlock("release_claims")?;

        let mut released = 0;
        for collection in state.collections.values_mut() {
            if collection.taken_by.as_ref() == Some(&self.instance) {
                collection.taken_by = None;
                released += 1;
            }
        }
        Ok(released)
    }
}

struct MemoryCursor {
    ids: Vec<u64>,
    position: AtomicUsize,
    state: Arc<Mutex<InMemoryStoreState>>,
}

#[async_trait]
impl CollectionCursor for MemoryCursor {
    async fn next(&self) -> StorageResult<Option<Vec<Task>>> {
        let index = self.position.fetch_add(1, Ordering::SeqCst);
        let Some(collection_id) = self.ids.get(index) else {
            return Ok(None);
        };

        let mut state = self.state.lock().await;
        state.take_injected_deadlock("next")?;

        let tasks = state
            .collections
            .get(collection_id)
            .map(|c| c.tasks.iter().map(|id| Task::new(*id, c.exec_time)).collect())
            .unwrap_or_default();
        Ok(Some(tasks))
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}
