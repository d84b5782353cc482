//! Transport port - hands a due task to whatever the caller delivers it with.
//!
//! Only used when the engine runs its own delivery workers. Callers that
//! drive delivery themselves use `Engine::consume` and never implement this.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::Task;

#[derive(Debug, Error)]
#[error("delivery failed: {0}")]
pub struct TransportError(pub String);

#[async_trait]
pub trait Transport: Send + Sync {
    /// `Ok` confirms the task; `Err` rolls it back for redelivery.
    async fn deliver(&self, task: &Task) -> Result<(), TransportError>;
}
