//! Preloader - moves due-soon tasks from storage into memory.
//!
//! New tasks close to their deadline are claimed at creation and handed to
//! the waiter directly; everything else is picked up by the poll loop one
//! lookahead window at a time.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::{TaskManager, shutdown_requested};
use crate::domain::{EngineError, Task};
use crate::ports::{Clock, CollectionCursor, EventLevel, EventSink};

pub struct Preloader {
    manager: Arc<TaskManager>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    preloaded_tx: mpsc::Sender<Task>,
    lookahead: Duration,
    safety_window: Duration,
    workers: usize,
}

impl Preloader {
    pub fn new(
        manager: Arc<TaskManager>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        preloaded_tx: mpsc::Sender<Task>,
        lookahead: Duration,
        safety_window: Duration,
        workers: usize,
    ) -> Self {
        Self {
            manager,
            clock,
            events,
            preloaded_tx,
            lookahead,
            safety_window,
            workers: workers.max(1),
        }
    }

    /// Whether a task due at `exec_time` is too close for the next poll to
    /// be relied on.
    pub fn within_safety_window(&self, exec_time: i64) -> bool {
        let relative_ms = exec_time
            .saturating_mul(1000)
            .saturating_sub(self.clock.now_millis());
        (self.safety_window.as_millis() as i64) > relative_ms
    }

    pub async fn add_new_task(&self, task: Task) -> Result<(), EngineError> {
        let taken = self.within_safety_window(task.exec_time());
        self.manager.create(&task, taken).await?;

        if taken {
            self.preloaded_tx
                .send(task)
                .await
                .map_err(|_| EngineError::Closed)?;
        }
        Ok(())
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        info!(
            instance_id = %self.manager.instance_id(),
            lookahead_ms = self.lookahead.as_millis() as u64,
            workers = self.workers,
            "preloader started"
        );

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let result = match self.manager.find_due_window(self.lookahead).await {
                Ok(cursor) => self.load(cursor).await.map(|_| ()),
                Err(EngineError::CollectionsNotFound) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.lookahead) => {}
                        _ = shutdown_requested(&mut shutdown) => return Ok(()),
                    }
                    Ok(())
                }
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => {}
                // the waiter is gone; only expected while stopping
                Err(EngineError::Closed) if *shutdown.borrow() => return Ok(()),
                Err(err) => {
                    self.events.emit(
                        EventLevel::Fatal,
                        "preloader stopped",
                        json!({ "error": err.to_string() }),
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Drain one claimed window into the preloaded queue with the worker
    /// pool. Returns the number of tasks loaded.
    async fn load(&self, cursor: Arc<dyn CollectionCursor>) -> Result<usize, EngineError> {
        let mut workers = JoinSet::new();
        for _ in 0..self.workers.min(cursor.len()).max(1) {
            let cursor = Arc::clone(&cursor);
            let manager = Arc::clone(&self.manager);
            let preloaded_tx = self.preloaded_tx.clone();

            workers.spawn(async move {
                let mut loaded = 0usize;
                while let Some(tasks) = manager.next_collection(cursor.as_ref()).await? {
                    for task in tasks {
                        preloaded_tx
                            .send(task)
                            .await
                            .map_err(|_| EngineError::Closed)?;
                        loaded += 1;
                    }
                }
                Ok::<_, EngineError>(loaded)
            });
        }

        let mut total = 0;
        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = joined
                .map_err(|e| EngineError::WorkerPanicked(format!("preload worker: {e}")))
                .and_then(|r| r);
            match outcome {
                Ok(loaded) => total += loaded,
                Err(err) if failure.is_none() => failure = Some(err),
                Err(_) => {}
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        debug!(collections = cursor.len(), tasks = total, "window preloaded");
        Ok(total)
    }
}
