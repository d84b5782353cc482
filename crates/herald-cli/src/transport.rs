//! LoggingTransport - "delivers" a task by logging it.

use async_trait::async_trait;
use herald_core::Task;
use herald_core::ports::{Clock, SystemClock, Transport, TransportError};

#[derive(Debug, Default)]
pub struct LoggingTransport;

#[async_trait]
impl Transport for LoggingTransport {
    async fn deliver(&self, task: &Task) -> Result<(), TransportError> {
        let lag_ms = SystemClock.now_millis().saturating_sub(task.exec_time_millis());
        tracing::info!(task_id = %task.id(), exec_time = task.exec_time(), lag_ms, "task fired");
        Ok(())
    }
}
