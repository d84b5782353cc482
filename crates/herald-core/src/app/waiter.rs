//! Waiter - holds preloaded tasks until their execution time.
//!
//! One loop owns the timer. Each iteration looks at the earliest task, arms a
//! timer for it and waits for whichever comes first: the timer, a newly
//! preloaded task, a cancellation, or shutdown. A task leaves the list only
//! once it is on the ready queue or cancelled, so the list holds every
//! pending task at all times.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use super::shutdown_requested;
use crate::domain::{EngineError, Task, TaskId};
use crate::ports::Clock;
use crate::queue::WaitList;

/// Shared view of the wait list. The lock is never held across an await.
pub type SharedWaitList = Arc<Mutex<WaitList>>;

pub struct Waiter {
    wait_list: SharedWaitList,
    clock: Arc<dyn Clock>,
    preloaded_rx: mpsc::Receiver<Task>,
    cancel_rx: mpsc::Receiver<TaskId>,
    ready_tx: mpsc::Sender<Task>,
    drain_limit: usize,
}

impl Waiter {
    pub fn new(
        wait_list: SharedWaitList,
        clock: Arc<dyn Clock>,
        preloaded_rx: mpsc::Receiver<Task>,
        cancel_rx: mpsc::Receiver<TaskId>,
        ready_tx: mpsc::Sender<Task>,
        drain_limit: usize,
    ) -> Self {
        Self {
            wait_list,
            clock,
            preloaded_rx,
            cancel_rx,
            ready_tx,
            drain_limit,
        }
    }

    fn list(&self) -> MutexGuard<'_, WaitList> {
        self.wait_list.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Time left until `task` is due; zero for past-due tasks.
    fn delay_until(&self, task: &Task) -> Duration {
        let remaining = task.exec_time_millis().saturating_sub(self.clock.now_millis());
        Duration::from_millis(remaining.max(0) as u64)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        loop {
            let earliest = self.list().peek().copied();
            let delay = earliest.as_ref().map(|t| self.delay_until(t));

            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => return Ok(()),
                _ = timer(delay) => {
                    if let Some(task) = earliest {
                        trace!(task_id = %task.id(), "task due");
                        tokio::select! {
                            sent = self.ready_tx.send(task) => sent.map_err(|_| EngineError::Closed)?,
                            _ = shutdown_requested(&mut shutdown) => return Ok(()),
                        }
                        self.list().remove(task.id());
                    }
                }
                Some(task) = self.preloaded_rx.recv() => {
                    self.list().push(task);
                    self.drain_events();
                }
                Some(id) = self.cancel_rx.recv() => {
                    self.cancel(id);
                    self.drain_cancellations();
                }
            }
        }
    }

    fn cancel(&self, id: TaskId) {
        if self.list().remove(id).is_some() {
            debug!(task_id = %id, "cancelled");
        }
    }

    /// Take up to `drain_limit` queued preloads or cancellations without
    /// re-arming the timer in between.
    fn drain_events(&mut self) {
        for _ in 0..self.drain_limit {
            if let Ok(task) = self.preloaded_rx.try_recv() {
                self.list().push(task);
            } else if let Ok(id) = self.cancel_rx.try_recv() {
                self.cancel(id);
            } else {
                break;
            }
        }
    }

    fn drain_cancellations(&mut self) {
        for _ in 0..self.drain_limit {
            match self.cancel_rx.try_recv() {
                Ok(id) => self.cancel(id),
                Err(_) => break,
            }
        }
    }
}

async fn timer(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}
