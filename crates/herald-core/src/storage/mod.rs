//! Storage - `TaskStore` implementations.
//!
//! - **MySqlTaskStore**: production store (sqlx + InnoDB row locks)
//! - **InMemoryTaskStore**: same semantics behind one mutex, for tests and
//!   single-process runs

pub mod memory;
pub mod mysql;
pub mod schema;

pub use self::memory::{CollectionSnapshot, InMemoryTaskStore};
pub use self::mysql::MySqlTaskStore;

use crate::config::EngineConfig;

/// Knobs shared by every store implementation.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Maximum tasks per collection.
    pub collection_capacity: usize,
    /// Sweep empty collections every n-th delete call.
    pub cleaning_frequency: u64,
    /// Maximum collections claimed per `find_due_window`.
    pub search_batch_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for StoreOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            collection_capacity: config.collection_capacity,
            cleaning_frequency: config.cleaning_frequency,
            search_batch_size: config.search_batch_size,
        }
    }
}
