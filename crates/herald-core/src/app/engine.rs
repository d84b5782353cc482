//! Engine - the public surface of the trigger pipeline.
//!
//! Built by [`EngineBuilder`](super::EngineBuilder). `run()` owns every
//! background loop; the other methods may be called concurrently from any
//! task, before or while `run()` is active.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::sender::{run_batcher, run_confirm_worker};
use super::waiter::{SharedWaitList, Waiter};
use super::{Delivery, DeliveryWorker, Preloader, Sender, TaskManager, shutdown_requested};
use crate::config::EngineConfig;
use crate::domain::{EngineError, InstanceId, Task, TaskId};
use crate::ports::{Clock, EventLevel, EventSink, IdGenerator, MetricsBus, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    /// Built, `run()` not yet through start-up.
    Idle,
    Running,
    Stopped,
}

/// Channel ends consumed by the single `run()` call.
pub(crate) struct RunParts {
    pub preloaded_rx: mpsc::Receiver<Task>,
    pub cancel_rx: mpsc::Receiver<TaskId>,
    pub ready_tx: mpsc::Sender<Task>,
    pub confirm_rx: mpsc::Receiver<Task>,
}

pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) instance: InstanceId,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) metrics: Arc<dyn MetricsBus>,
    pub(crate) manager: Arc<TaskManager>,
    pub(crate) preloader: Arc<Preloader>,
    pub(crate) sender: Arc<Sender>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) cancel_tx: mpsc::Sender<TaskId>,
    pub(crate) wait_list: SharedWaitList,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) lifecycle: watch::Sender<Lifecycle>,
    pub(crate) parts: Mutex<Option<RunParts>>,
}

impl Engine {
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Tasks held in memory waiting for their execution time, including the
    /// one the timer is armed for.
    pub fn pending(&self) -> usize {
        self.wait_list.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Register `task`. Fails with [`EngineError::DuplicateTask`] when the id
    /// is already stored.
    ///
    /// Waits until `run()` has finished start-up: claims made before the
    /// stale-claim release would otherwise be released again.
    pub async fn create(&self, task: Task) -> Result<(), EngineError> {
        self.wait_until_running().await?;
        self.preloader.add_new_task(task).await
    }

    /// Register a task with a generated id.
    pub async fn create_at(&self, exec_time: i64) -> Result<TaskId, EngineError> {
        let id = self.ids.generate_task_id();
        self.create(Task::new(id, exec_time)).await?;
        Ok(id)
    }

    /// Register a task under a caller-supplied id in text form.
    pub async fn create_with_id(&self, id: &str, exec_time: i64) -> Result<TaskId, EngineError> {
        let id = TaskId::parse(id)?;
        self.create(Task::new(id, exec_time)).await?;
        Ok(id)
    }

    /// Remove a task before it fires.
    ///
    /// Cancelling an already released task only removes it from storage;
    /// its in-flight delivery still completes.
    pub async fn delete(&self, id: TaskId) -> Result<(), EngineError> {
        if self.manager.delete(&[id]).await? == 0 {
            return Err(EngineError::TaskNotFound(id));
        }

        match self.cancel_tx.try_send(id) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(task_id = %id, "cancel queue full; task may still fire");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
        Ok(())
    }

    /// Next due task, or `None` once the engine is shutting down.
    pub async fn consume(&self) -> Option<Delivery> {
        self.sender.consume().await
    }

    /// Stop every loop. `run()` returns `Ok` once they have exited.
    pub fn shutdown(&self) {
        info!(instance_id = %self.instance, "shutdown requested");
        self.shutdown_tx.send_replace(true);
        self.lifecycle.send_replace(Lifecycle::Stopped);
    }

    /// Start-up finished and no shutdown yet.
    pub fn is_running(&self) -> bool {
        *self.lifecycle.borrow() == Lifecycle::Running
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    async fn wait_until_running(&self) -> Result<(), EngineError> {
        let mut lifecycle = self.lifecycle.subscribe();
        let state = *lifecycle
            .wait_for(|state| *state != Lifecycle::Idle)
            .await
            .map_err(|_| EngineError::Closed)?;
        match state {
            Lifecycle::Running => Ok(()),
            _ => Err(EngineError::Closed),
        }
    }

    /// Start the pipeline and block until shutdown or the first fatal error.
    pub async fn run(&self) -> Result<(), EngineError> {
        let parts = self
            .parts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(EngineError::AlreadyRunning)?;

        let result = self.run_with(parts).await;
        self.lifecycle.send_replace(Lifecycle::Stopped);
        result
    }

    async fn run_with(&self, parts: RunParts) -> Result<(), EngineError> {
        self.manager.up().await?;
        let released = self.manager.release_claims().await?;
        let outstanding = self.manager.seed_task_count().await?;
        info!(
            instance_id = %self.instance,
            released,
            outstanding,
            "engine starting"
        );

        let mut loops = self.spawn_loops(parts);
        self.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Idle {
                *state = Lifecycle::Running;
                return true;
            }
            false
        });

        let mut failure: Option<EngineError> = None;
        while let Some(joined) = loops.join_next().await {
            let (name, result) = match joined {
                Ok(finished) => finished,
                Err(join_err) => (
                    "worker",
                    Err(EngineError::WorkerPanicked(join_err.to_string())),
                ),
            };

            match result {
                Ok(()) => {}
                Err(err) if failure.is_none() => {
                    error!(loop_name = name, error = %err, "engine loop failed; stopping");
                    self.events.emit(
                        EventLevel::Fatal,
                        "engine loop failed",
                        json!({ "loop": name, "error": err.to_string() }),
                    );
                    self.shutdown_tx.send_replace(true);
                    failure = Some(err);
                }
                Err(err) => warn!(loop_name = name, error = %err, "engine loop failed during shutdown"),
            }
        }

        match failure {
            Some(err) => Err(err),
            None => {
                info!(instance_id = %self.instance, "engine stopped");
                Ok(())
            }
        }
    }

    fn spawn_loops(
        &self,
        parts: RunParts,
    ) -> JoinSet<(&'static str, Result<(), EngineError>)> {
        let RunParts {
            preloaded_rx,
            cancel_rx,
            ready_tx,
            confirm_rx,
        } = parts;
        let shutdown = self.shutdown_tx.subscribe();
        let mut loops = JoinSet::new();

        let preloader = Arc::clone(&self.preloader);
        let rx = shutdown.clone();
        loops.spawn(async move { ("preloader", preloader.run(rx).await) });

        let waiter = Waiter::new(
            Arc::clone(&self.wait_list),
            Arc::clone(&self.clock),
            preloaded_rx,
            cancel_rx,
            ready_tx,
            self.config.drain_limit,
        );
        let rx = shutdown.clone();
        loops.spawn(async move { ("waiter", waiter.run(rx).await) });

        let (batch_tx, batch_rx) = mpsc::channel(self.config.queue_capacity);
        let rx = shutdown.clone();
        let max_items = self.config.batch_max_items;
        let timeout = self.config.batch_timeout();
        loops.spawn(async move {
            (
                "batcher",
                run_batcher(confirm_rx, batch_tx, max_items, timeout, rx).await,
            )
        });

        let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));
        for worker_id in 0..self.config.confirm_workers {
            let batch_rx = Arc::clone(&batch_rx);
            let manager = Arc::clone(&self.manager);
            loops.spawn(async move {
                (
                    "confirm-worker",
                    run_confirm_worker(worker_id, batch_rx, manager).await,
                )
            });
        }

        if let Some(transport) = &self.transport {
            for worker_id in 0..self.config.delivery_workers {
                let worker = DeliveryWorker::new(
                    worker_id,
                    Arc::clone(&self.sender),
                    Arc::clone(transport),
                    self.config.redelivery_delay(),
                );
                let rx = shutdown.clone();
                loops.spawn(async move { ("delivery-worker", worker.run(rx).await) });
            }
        }

        let metrics = Arc::clone(&self.metrics);
        let period = self.config.metrics_period();
        let rx = shutdown;
        loops.spawn(async move { ("metrics", run_metrics_flush(metrics, period, rx).await) });

        loops
    }
}

async fn run_metrics_flush(
    metrics: Arc<dyn MetricsBus>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), EngineError> {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => metrics.flush(),
            _ = shutdown_requested(&mut shutdown) => {
                metrics.flush();
                return Ok(());
            }
        }
    }
}
