//! TaskStore port - the durable source of truth for pending tasks.
//!
//! Tasks live in *collections*: buckets of tasks sharing an execution time
//! and a claim state. Instances claim whole collections, so a preload cycle
//! takes one row lock per collection instead of one per task.
//!
//! Each store is built once per process for a fixed [`InstanceId`] and shared
//! by `Arc` between the components that need it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{InstanceId, Task, TaskId};

/// Storage failures, classified at the storage boundary.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("task {0} already exists")]
    Duplicate(TaskId),

    /// Lock conflict reported by the store; safe to retry.
    #[error("lock conflict: {0}")]
    Deadlock(String),

    #[error("nothing found")]
    NotFound,

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Deadlock(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Lazy cursor over the collections claimed by one `find_due_window` call.
///
/// Several preload workers may pull from the same cursor concurrently; each
/// collection is handed out exactly once.
#[async_trait]
pub trait CollectionCursor: Send + Sync {
    /// Tasks of the next unconsumed collection, or `None` once exhausted.
    async fn next(&self) -> StorageResult<Option<Vec<Task>>>;

    /// Number of collections claimed by this cursor.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    fn instance_id(&self) -> &InstanceId;

    /// Insert `task`, claimed by this instance when `is_taken`.
    ///
    /// Finds an under-capacity collection for `(exec_time, claim-state)` or
    /// opens a new one, atomically with respect to concurrent creators.
    async fn create(&self, task: &Task, is_taken: bool) -> StorageResult<()>;

    /// Claim every unclaimed collection due within `lookahead` from now.
    ///
    /// Returns [`StorageError::NotFound`] when nothing is due.
    async fn find_due_window(&self, lookahead: Duration)
    -> StorageResult<Arc<dyn CollectionCursor>>;

    /// Bulk delete by id; returns the number of tasks removed.
    async fn delete(&self, ids: &[TaskId]) -> StorageResult<u64>;

    async fn count(&self) -> StorageResult<u64>;

    /// Idempotent schema provisioning.
    async fn up(&self) -> StorageResult<()>;

    /// Hand collections still claimed by this instance back to the pool.
    ///
    /// Called once at startup: anything claimed by a previous run of the same
    /// instance was only held in that run's memory.
    async fn release_claims(&self) -> StorageResult<u64>;
}
