//! Ports - the seams between the pipeline and the outside world.
//!
//! The durable store is the source of truth; everything in memory (preloaded
//! tasks, the wait list, confirm batches) can be rebuilt from it.

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod metrics;
pub mod task_store;
pub mod transport;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventLevel, EventSink, TracingEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::metrics::{MetricKind, MetricListener, MetricsBus, NoopMetricsBus};
pub use self::task_store::{CollectionCursor, StorageError, StorageResult, TaskStore};
pub use self::transport::{Transport, TransportError};
