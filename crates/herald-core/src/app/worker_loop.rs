//! Delivery workers - consume due tasks and push them through a `Transport`.
//!
//! # Flow
//! 1. `Sender::consume()` for the next due task
//! 2. `Transport::deliver()`
//! 3. success: `confirm()`; failure: wait `redelivery_delay`, `rollback()`
//!
//! Only spawned when the engine was built with a transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use super::{Sender, shutdown_requested};
use crate::domain::EngineError;
use crate::ports::Transport;

pub struct DeliveryWorker {
    worker_id: usize,
    sender: Arc<Sender>,
    transport: Arc<dyn Transport>,
    redelivery_delay: Duration,
}

impl DeliveryWorker {
    pub fn new(
        worker_id: usize,
        sender: Arc<Sender>,
        transport: Arc<dyn Transport>,
        redelivery_delay: Duration,
    ) -> Self {
        Self {
            worker_id,
            sender,
            transport,
            redelivery_delay,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        let worker_id = self.worker_id;
        while let Some(delivery) = self.sender.consume().await {
            let task = *delivery.task();

            let result = match self.transport.deliver(&task).await {
                Ok(()) => {
                    debug!(worker_id, task_id = %task.id(), "delivered");
                    delivery.confirm().await
                }
                Err(err) => {
                    warn!(worker_id, task_id = %task.id(), error = %err, "delivery failed; rolling back");
                    tokio::select! {
                        _ = tokio::time::sleep(self.redelivery_delay) => {}
                        // leave it unconfirmed; storage still has it
                        _ = shutdown_requested(&mut shutdown) => return Ok(()),
                    }
                    delivery.rollback().await
                }
            };

            match result {
                Ok(()) => {}
                Err(EngineError::Closed) if *shutdown.borrow() => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Task, TaskId};
    use crate::ports::TransportError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use ulid::Ulid;

    /// Fails the first `failures` deliveries, records every attempt.
    struct FlakyTransport {
        failures: Mutex<u32>,
        attempts: Mutex<Vec<TaskId>>,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn deliver(&self, task: &Task) -> Result<(), TransportError> {
            self.attempts.lock().unwrap().push(task.id());
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TransportError("connection reset".into()));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_is_retried_after_the_delay() {
        let (ready_tx, ready_rx) = mpsc::channel(8);
        let (confirm_tx, mut confirm_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sender = Arc::new(Sender::new(
            ready_rx,
            ready_tx.clone(),
            confirm_tx,
            shutdown_rx.clone(),
        ));
        let transport = Arc::new(FlakyTransport {
            failures: Mutex::new(2),
            attempts: Mutex::new(Vec::new()),
        });

        let worker = DeliveryWorker::new(0, sender, transport.clone(), Duration::from_secs(1));
        let handle = tokio::spawn(worker.run(shutdown_rx));

        let task = Task::new(TaskId::from_ulid(Ulid::new()), 0);
        let start = tokio::time::Instant::now();
        ready_tx.send(task).await.unwrap();

        assert_eq!(confirm_rx.recv().await, Some(task));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(transport.attempts.lock().unwrap().len(), 3);

        shutdown_tx.send_replace(true);
        handle.await.unwrap().unwrap();
    }
}
