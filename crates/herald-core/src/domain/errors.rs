//! Domain-level errors.
//!
//! Storage errors are classified at the storage boundary (`StorageError`) and
//! re-classified here by the task manager; nothing above the manager sees a
//! storage type.

use thiserror::Error;

use super::TaskId;

/// Operational classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Returned to the caller as a typed error; the engine keeps running.
    Permanent,
    /// Terminates the owning loop and surfaces through `Engine::run`.
    Fatal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("creating task {task_id} failed: {reason}")]
    CreatingFailed { task_id: TaskId, reason: String },

    #[error("deleting tasks failed: {0}")]
    DeletingFailed(String),

    #[error("confirming {count} tasks failed: {reason}")]
    ConfirmingFailed { count: usize, reason: String },

    #[error("no due collections found")]
    CollectionsNotFound,

    #[error("fetching due tasks failed: {0}")]
    GetFailed(String),

    #[error("task {0} already exists")]
    DuplicateTask(TaskId),

    #[error("malformed task id: {0:?}")]
    MalformedId(String),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("task {0} was already confirmed or rolled back")]
    AlreadyProcessed(TaskId),

    #[error("schema provisioning failed: {0}")]
    SchemaFailed(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine queues are closed")]
    Closed,

    #[error("worker {0} panicked")]
    WorkerPanicked(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::GetFailed(_)
            | EngineError::SchemaFailed(_)
            | EngineError::WorkerPanicked(_) => ErrorKind::Fatal,
            _ => ErrorKind::Permanent,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn some_id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[rstest]
    #[case::get_failed(EngineError::GetFailed("down".into()), true)]
    #[case::schema(EngineError::SchemaFailed("denied".into()), true)]
    #[case::not_found(EngineError::CollectionsNotFound, false)]
    #[case::duplicate(EngineError::DuplicateTask(some_id()), false)]
    #[case::malformed(EngineError::MalformedId("x".into()), false)]
    #[case::deleting(EngineError::DeletingFailed("deadlock".into()), false)]
    fn fatal_classification(#[case] err: EngineError, #[case] fatal: bool) {
        assert_eq!(err.is_fatal(), fatal);
    }

    #[test]
    fn messages_mention_the_task() {
        let id = some_id();
        let err = EngineError::CreatingFailed {
            task_id: id,
            reason: "deadlock".into(),
        };
        assert!(err.to_string().contains(&id.to_string()));
    }
}
