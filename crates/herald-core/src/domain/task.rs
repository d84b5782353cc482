use serde::{Deserialize, Serialize};
use std::fmt;

use super::TaskId;

/// A deferred task: an identity and the second (since the Unix epoch) at
/// which it becomes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    exec_time: i64,
}

impl Task {
    pub fn new(id: TaskId, exec_time: i64) -> Self {
        Self { id, exec_time }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Execution time in seconds since the Unix epoch.
    pub fn exec_time(&self) -> i64 {
        self.exec_time
    }

    /// Execution time in milliseconds, for timer arithmetic.
    pub fn exec_time_millis(&self) -> i64 {
        self.exec_time.saturating_mul(1000)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.exec_time)
    }
}
