//! Domain identifiers (strongly-typed IDs).
//!
//! Task ids are ULIDs: sortable by creation time and generated on any node
//! without coordination. The text form stored in the database is the bare
//! 26-character ULID; `Display` adds a `task-` prefix for logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use super::errors::EngineError;

const TASK_PREFIX: &str = "task-";

/// Identifier of a deferred task.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Ulid);

impl TaskId {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Storage key: the bare ULID text, without the display prefix.
    pub fn to_key(&self) -> String {
        self.0.to_string()
    }

    /// Parse a caller-supplied id. Accepts both the bare ULID and the
    /// prefixed display form.
    pub fn parse(value: &str) -> Result<Self, EngineError> {
        let raw = value.strip_prefix(TASK_PREFIX).unwrap_or(value);
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|_| EngineError::MalformedId(value.to_string()))
    }
}

impl From<Ulid> for TaskId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl FromStr for TaskId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", TASK_PREFIX, self.0)
    }
}

/// Identifier of an engine instance, used as the claim owner of collections.
///
/// Must be stable across restarts of the same deployment slot for crash
/// recovery to hand its claims back (see `TaskStore::release_claims`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh id for instances that were not given one in configuration.
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
