//! Sender - hands due tasks to consumers and batches their confirmations.
//!
//! # Flow
//! 1. `consume()` takes a task from the ready queue and wraps it in a
//!    [`Delivery`]
//! 2. `Delivery::confirm` pushes it onto the confirm queue,
//!    `Delivery::rollback` back onto the ready queue
//! 3. the batcher groups confirmations into batches
//! 4. confirm workers purge each batch from storage

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::{TaskManager, shutdown_requested};
use crate::domain::{EngineError, Task};

/// A due task handed to a consumer.
///
/// Exactly one of [`confirm`](Self::confirm) or [`rollback`](Self::rollback)
/// takes effect; the second call fails with
/// [`EngineError::AlreadyProcessed`]. Dropping a delivery without either
/// leaves the task in storage, so it is redelivered after a restart.
#[derive(Debug)]
pub struct Delivery {
    task: Task,
    processed: AtomicBool,
    ready_tx: mpsc::Sender<Task>,
    confirm_tx: mpsc::Sender<Task>,
}

impl Delivery {
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::Acquire)
    }

    /// Acknowledge the task; it is purged with the next confirm batch.
    pub async fn confirm(&self) -> Result<(), EngineError> {
        self.mark_processed()?;
        self.confirm_tx
            .send(self.task)
            .await
            .map_err(|_| EngineError::Closed)
    }

    /// Hand the task back for another delivery attempt.
    pub async fn rollback(&self) -> Result<(), EngineError> {
        self.mark_processed()?;
        debug!(task_id = %self.task.id(), "delivery rolled back");
        self.ready_tx
            .send(self.task)
            .await
            .map_err(|_| EngineError::Closed)
    }

    fn mark_processed(&self) -> Result<(), EngineError> {
        if self.processed.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyProcessed(self.task.id()));
        }
        Ok(())
    }
}

pub struct Sender {
    ready_rx: Mutex<mpsc::Receiver<Task>>,
    ready_tx: mpsc::Sender<Task>,
    confirm_tx: mpsc::Sender<Task>,
    shutdown: watch::Receiver<bool>,
}

impl Sender {
    pub fn new(
        ready_rx: mpsc::Receiver<Task>,
        ready_tx: mpsc::Sender<Task>,
        confirm_tx: mpsc::Sender<Task>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ready_rx: Mutex::new(ready_rx),
            ready_tx,
            confirm_tx,
            shutdown,
        }
    }

    /// Next due task, or `None` once the engine is shutting down.
    pub async fn consume(&self) -> Option<Delivery> {
        let mut shutdown = self.shutdown.clone();
        let task = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => return None,
            task = async { self.ready_rx.lock().await.recv().await } => task?,
        };

        Some(Delivery {
            task,
            processed: AtomicBool::new(false),
            ready_tx: self.ready_tx.clone(),
            confirm_tx: self.confirm_tx.clone(),
        })
    }
}

/// Group confirmations into batches of at most `max_items`. A batch closes
/// when full or `timeout` after its first item arrived.
///
/// On shutdown the confirm queue is closed, so later `confirm()` calls fail
/// with [`EngineError::Closed`], and everything already accepted is
/// forwarded before `batch_tx` is dropped.
pub async fn run_batcher(
    mut confirm_rx: mpsc::Receiver<Task>,
    batch_tx: mpsc::Sender<Vec<Task>>,
    max_items: usize,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), EngineError> {
    let max_items = max_items.max(1);
    let mut open = Vec::new();

    'running: loop {
        let first = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break 'running,
            task = confirm_rx.recv() => match task {
                Some(task) => task,
                None => break 'running,
            },
        };

        let deadline = Instant::now() + timeout;
        let mut batch = Vec::with_capacity(max_items.min(1024));
        batch.push(first);

        while batch.len() < max_items {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    open = batch;
                    break 'running;
                }
                task = confirm_rx.recv() => match task {
                    Some(task) => batch.push(task),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        match batch_tx.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                // still in storage; redelivered after a restart
                error!(batch_size = dropped.len(), "confirm batch queue full; dropping batch");
            }
            Err(TrySendError::Closed(_)) => return Ok(()),
        }
    }

    confirm_rx.close();
    let mut batch = open;
    while let Some(task) = confirm_rx.recv().await {
        batch.push(task);
        if batch.len() >= max_items {
            forward_final(&batch_tx, std::mem::take(&mut batch)).await;
        }
    }
    if !batch.is_empty() {
        forward_final(&batch_tx, batch).await;
    }
    Ok(())
}

async fn forward_final(batch_tx: &mpsc::Sender<Vec<Task>>, batch: Vec<Task>) {
    let batch_size = batch.len();
    debug!(batch_size, "forwarding confirm batch before shutdown");
    if batch_tx.send(batch).await.is_err() {
        error!(batch_size, "confirm workers gone; batch not purged");
    }
}

/// Purge confirmed batches from storage until the batcher drops its end.
/// Shares the batch receiver with the other confirm workers.
pub async fn run_confirm_worker(
    worker_id: usize,
    batch_rx: Arc<Mutex<mpsc::Receiver<Vec<Task>>>>,
    manager: Arc<TaskManager>,
) -> Result<(), EngineError> {
    loop {
        let Some(batch) = batch_rx.lock().await.recv().await else {
            return Ok(());
        };

        // the manager already reported the failure; the tasks stay stored
        if let Err(err) = manager.confirm_execution(&batch).await {
            warn!(worker_id, batch_size = batch.len(), error = %err, "confirm batch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;
    use ulid::Ulid;

    fn task() -> Task {
        Task::new(TaskId::from_ulid(Ulid::new()), 0)
    }

    struct Desk {
        sender: Sender,
        confirm_rx: mpsc::Receiver<Task>,
        ready_tx: mpsc::Sender<Task>,
        shutdown_tx: watch::Sender<bool>,
    }

    fn desk() -> Desk {
        let (ready_tx, ready_rx) = mpsc::channel(16);
        let (confirm_tx, confirm_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Desk {
            sender: Sender::new(ready_rx, ready_tx.clone(), confirm_tx, shutdown_rx),
            confirm_rx,
            ready_tx,
            shutdown_tx,
        }
    }

    #[tokio::test]
    async fn confirm_then_rollback_is_rejected() {
        let mut d = desk();
        let t = task();
        d.ready_tx.send(t).await.unwrap();

        let delivery = d.sender.consume().await.unwrap();
        delivery.confirm().await.unwrap();
        assert!(delivery.is_processed());

        let err = delivery.rollback().await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyProcessed(id) if id == t.id()));
        assert_eq!(d.confirm_rx.try_recv().ok(), Some(t));
    }

    #[tokio::test]
    async fn rollback_reoffers_the_task_exactly_once() {
        let mut d = desk();
        let t = task();
        d.ready_tx.send(t).await.unwrap();

        let first = d.sender.consume().await.unwrap();
        first.rollback().await.unwrap();
        assert!(matches!(
            first.confirm().await,
            Err(EngineError::AlreadyProcessed(_))
        ));

        let second = d.sender.consume().await.unwrap();
        assert_eq!(*second.task(), t);
        second.confirm().await.unwrap();

        assert_eq!(d.confirm_rx.try_recv().ok(), Some(t));
        assert!(d.confirm_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn consume_returns_none_after_shutdown() {
        let d = desk();
        d.shutdown_tx.send_replace(true);
        assert!(d.sender.consume().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn batches_close_on_size_or_timeout() {
        let (confirm_tx, confirm_rx) = mpsc::channel(10_000);
        let (batch_tx, mut batch_rx) = mpsc::channel(100);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_batcher(
            confirm_rx,
            batch_tx,
            1000,
            Duration::from_millis(50),
            shutdown_rx,
        ));

        // the second burst lands inside the first batch's timeout and joins it
        let t0 = Instant::now();
        for (at_ms, burst) in [(0, 200), (25, 200), (150, 1500), (225, 3300)] {
            tokio::time::sleep_until(t0 + Duration::from_millis(at_ms)).await;
            for _ in 0..burst {
                confirm_tx.try_send(task()).unwrap();
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut sizes = Vec::new();
        while let Ok(batch) = batch_rx.try_recv() {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![400, 1000, 500, 1000, 1000, 1000, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_forwards_accepted_confirmations() {
        let (confirm_tx, confirm_rx) = mpsc::channel(64);
        let (batch_tx, mut batch_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let batcher = tokio::spawn(run_batcher(
            confirm_rx,
            batch_tx,
            4,
            Duration::from_secs(60),
            shutdown_rx,
        ));

        for _ in 0..10 {
            confirm_tx.send(task()).await.unwrap();
        }
        shutdown_tx.send_replace(true);

        let mut sizes = Vec::new();
        while let Some(batch) = batch_rx.recv().await {
            sizes.push(batch.len());
        }
        assert_eq!(sizes.iter().sum::<usize>(), 10);
        batcher.await.unwrap().unwrap();

        // nothing is accepted once the queue is drained
        assert!(confirm_tx.send(task()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_queue_drops_the_batch() {
        let (confirm_tx, confirm_rx) = mpsc::channel(16);
        let (batch_tx, mut batch_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_batcher(
            confirm_rx,
            batch_tx,
            2,
            Duration::from_millis(10),
            shutdown_rx,
        ));

        for _ in 0..6 {
            confirm_tx.send(task()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // one batch fits, the other two were dropped
        assert_eq!(batch_rx.try_recv().map(|b| b.len()).ok(), Some(2));
        assert!(batch_rx.try_recv().is_err());
    }
}
