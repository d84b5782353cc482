//! Impls - in-process port implementations.
//!
//! # Included
//! - **LocalMetricsBus**: topic map with periodic fan-out
//! - **MemoryEventSink**: records events, for tests and embedding
//!
//! Store implementations live in `storage`.

pub mod local_metrics;
pub mod memory_sink;

pub use self::local_metrics::LocalMetricsBus;
pub use self::memory_sink::{MemoryEventSink, RecordedEvent};
