//! MySQL task store.
//!
//! Creation runs server side in `herald_create_task`; claiming is a single
//! `SELECT ... FOR UPDATE SKIP LOCKED` + `UPDATE` transaction. Those two row
//! locks are the only cross-instance coordination in the system.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlDatabaseError, MySqlPool, MySqlPoolOptions};
use sqlx::{MySql, QueryBuilder, Row};
use tracing::{debug, info, warn};

use super::StoreOptions;
use super::schema::{self, codes};
use crate::domain::{InstanceId, Task, TaskId};
use crate::ports::{Clock, CollectionCursor, StorageError, StorageResult, TaskStore};

pub struct MySqlTaskStore {
    pool: MySqlPool,
    instance: InstanceId,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
    delete_calls: AtomicU64,
}

impl MySqlTaskStore {
    pub fn new(
        pool: MySqlPool,
        instance: InstanceId,
        clock: Arc<dyn Clock>,
        options: StoreOptions,
    ) -> Self {
        Self {
            pool,
            instance,
            clock,
            options,
            delete_calls: AtomicU64::new(0),
        }
    }

    pub async fn connect(
        url: &str,
        max_connections: u32,
        instance: InstanceId,
        clock: Arc<dyn Clock>,
        options: StoreOptions,
    ) -> StorageResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool, instance, clock, options))
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    async fn sweep_stale_collections(&self) {
        let now = self.clock.now_secs();
        match sqlx::query(schema::DELETE_STALE_COLLECTIONS)
            .bind(now)
            .execute(&self.pool)
            .await
        {
            Ok(result) => debug!(pruned = result.rows_affected(), "swept empty collections"),
            Err(err) => warn!(error = %err, "sweeping empty collections failed"),
        }
    }
}

fn mysql_error_number(err: &sqlx::Error) -> Option<u16> {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .try_downcast_ref::<MySqlDatabaseError>()
            .map(|e| e.number()),
        _ => None,
    }
}

/// Map a driver error onto the storage taxonomy. `task` names the row being
/// inserted, if any, so duplicate keys can be reported against it.
fn classify(err: sqlx::Error, task: Option<TaskId>) -> StorageError {
    match (mysql_error_number(&err), task) {
        (Some(codes::DUPLICATE_ENTRY), Some(id)) => StorageError::Duplicate(id),
        (Some(codes::DEADLOCK | codes::LOCK_WAIT_TIMEOUT), _) => {
            StorageError::Deadlock(err.to_string())
        }
        _ => StorageError::Sqlx(err),
    }
}

fn db(err: sqlx::Error) -> StorageError {
    classify(err, None)
}

#[async_trait]
impl TaskStore for MySqlTaskStore {
    fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    async fn create(&self, task: &Task, is_taken: bool) -> StorageResult<()> {
        sqlx::query(schema::CALL_CREATE_TASK)
            .bind(self.instance.as_str())
            .bind(task.id().to_key())
            .bind(task.exec_time())
            .bind(is_taken)
            .bind(self.options.collection_capacity as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, Some(task.id())))?;
        Ok(())
    }

    async fn find_due_window(
        &self,
        lookahead: Duration,
    ) -> StorageResult<Arc<dyn CollectionCursor>> {
        let lookahead_ms = i64::try_from(lookahead.as_millis()).unwrap_or(i64::MAX);
        let deadline = self.clock.now_millis().saturating_add(lookahead_ms) / 1000;

        let mut tx = self.pool.begin().await.map_err(db)?;
        let rows = sqlx::query(schema::SELECT_DUE_COLLECTIONS)
            .bind(deadline)
            .bind(self.options.search_batch_size as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(db)?;

        if rows.is_empty() {
            tx.commit().await.map_err(db)?;
            return Err(StorageError::NotFound);
        }

        let ids = rows
            .iter()
            .map(|row| row.try_get::<i64, _>("id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(db)?;

        let mut claim: QueryBuilder<MySql> =
            QueryBuilder::new("UPDATE herald_collection SET taken_by_instance = ");
        claim.push_bind(self.instance.to_string());
        claim.push(" WHERE id IN (");
        let mut separated = claim.separated(", ");
        for id in &ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        claim.build().execute(&mut *tx).await.map_err(db)?;

        tx.commit().await.map_err(db)?;

        debug!(
            instance_id = %self.instance,
            collections = ids.len(),
            "claimed due collections"
        );

        Ok(Arc::new(MySqlCursor {
            pool: self.pool.clone(),
            ids,
            position: AtomicUsize::new(0),
        }))
    }

    async fn delete(&self, ids: &[TaskId]) -> StorageResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<MySql> =
            QueryBuilder::new("DELETE FROM herald_task WHERE uuid IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.to_key());
        }
        separated.push_unseparated(")");
        let affected = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(db)?
            .rows_affected();

        let calls = self.delete_calls.fetch_add(1, Ordering::Relaxed) + 1;
        if calls % self.options.cleaning_frequency.max(1) == 0 {
            self.sweep_stale_collections().await;
        }

        Ok(affected)
    }

    async fn count(&self) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar(schema::COUNT_TASKS)
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        Ok(count.max(0) as u64)
    }

    async fn up(&self) -> StorageResult<()> {
        sqlx::raw_sql(schema::CREATE_COLLECTION_TABLE)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        sqlx::raw_sql(schema::CREATE_TASK_TABLE)
            .execute(&self.pool)
            .await
            .map_err(db)?;

        match sqlx::raw_sql(schema::CREATE_TASK_PROCEDURE)
            .execute(&self.pool)
            .await
        {
            Ok(_) => info!("created herald_create_task procedure"),
            Err(err) if mysql_error_number(&err) == Some(codes::PROCEDURE_EXISTS) => {
                debug!("herald_create_task procedure already exists");
            }
            Err(err) => return Err(db(err)),
        }
        Ok(())
    }

    async fn release_claims(&self) -> StorageResult<u64> {
        let result = sqlx::query(schema::RELEASE_CLAIMS)
            .bind(self.instance.as_str())
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected())
    }
}

struct MySqlCursor {
    pool: MySqlPool,
    ids: Vec<i64>,
    position: AtomicUsize,
}

#[async_trait]
impl CollectionCursor for MySqlCursor {
    async fn next(&self) -> StorageResult<Option<Vec<Task>>> {
        let index = self.position.fetch_add(1, Ordering::SeqCst);
        let Some(collection_id) = self.ids.get(index) else {
            return Ok(None);
        };

        let rows = sqlx::query(schema::SELECT_COLLECTION_TASKS)
            .bind(*collection_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let uuid: String = row.try_get("uuid").map_err(db)?;
            let exec_time: i64 = row.try_get("exec_time").map_err(db)?;
            let id = TaskId::parse(&uuid)
                .map_err(|e| StorageError::Storage(format!("collection {collection_id}: {e}")))?;
            tasks.push(Task::new(id, exec_time));
        }
        Ok(Some(tasks))
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}
