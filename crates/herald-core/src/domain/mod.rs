//! Domain model: task identity, tasks, and domain errors.

pub mod errors;
pub mod ids;
pub mod task;

pub use self::errors::{EngineError, ErrorKind};
pub use self::ids::{InstanceId, TaskId};
pub use self::task::Task;
