//! herald-core
//!
//! Deferred-task trigger engine: tasks registered with a future execution
//! time are stored durably, claimed by one of possibly many instances,
//! released at their time and purged once the consumer confirms them.
//!
//! # Modules
//! - **domain**: task ids, tasks, errors
//! - **ports**: TaskStore, Transport, EventSink, MetricsBus, Clock, IdGenerator
//! - **storage**: MySQL and in-memory task stores
//! - **queue**: wait list and retry policy
//! - **app**: manager, preloader, waiter, sender, engine + builder
//! - **impls**: in-process metrics bus and event sink
//! - **config**: engine configuration

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod storage;

pub use app::{BuildError, Delivery, Engine, EngineBuilder};
pub use config::{ConfigError, EngineConfig};
pub use domain::{EngineError, InstanceId, Task, TaskId};
