//! MetricsBus port - topic-based publish/subscribe for engine metrics.
//!
//! Publishers push deltas; the bus fans the aggregated value out to
//! listeners on every `flush`, which the engine drives periodically.

/// Outstanding tasks in durable storage.
pub const TASKS_OUTSTANDING: &str = "tasks.outstanding";
pub const TASKS_CREATED: &str = "tasks.created";
pub const TASKS_DELETED: &str = "tasks.deleted";
pub const TASKS_CONFIRMED: &str = "tasks.confirmed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Listeners receive the delta accumulated since the previous flush.
    Counter,
    /// Listeners receive the running total.
    Gauge,
}

pub type MetricListener = Box<dyn Fn(&str, i64) + Send + Sync>;

pub trait MetricsBus: Send + Sync {
    fn init(&self, topic: &str, kind: MetricKind);

    fn publish(&self, topic: &str, delta: i64);

    fn listen(&self, topic: &str, listener: MetricListener);

    /// Deliver current values to every listener.
    fn flush(&self);
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsBus;

impl MetricsBus for NoopMetricsBus {
    fn init(&self, _topic: &str, _kind: MetricKind) {}

    fn publish(&self, _topic: &str, _delta: i64) {}

    fn listen(&self, _topic: &str, _listener: MetricListener) {}

    fn flush(&self) {}
}
