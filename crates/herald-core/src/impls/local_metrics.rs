//! LocalMetricsBus - in-process metrics fan-out.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::ports::{MetricKind, MetricListener, MetricsBus};

struct Topic {
    kind: MetricKind,
    value: i64,
    listeners: Vec<MetricListener>,
}

impl Topic {
    fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            value: 0,
            listeners: Vec::new(),
        }
    }
}

/// Metrics bus that keeps every topic in a mutex-guarded map.
///
/// Publishing to a topic that was never `init`ed creates it as a counter.
#[derive(Default)]
pub struct LocalMetricsBus {
    topics: Mutex<HashMap<String, Topic>>,
}

impl LocalMetricsBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value without flushing (gauges: total, counters: pending delta).
    pub fn value(&self, topic: &str) -> Option<i64> {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.get(topic).map(|t| t.value)
    }
}

impl MetricsBus for LocalMetricsBus {
    fn init(&self, topic: &str, kind: MetricKind) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .and_modify(|t| t.kind = kind)
            .or_insert_with(|| Topic::new(kind));
    }

    fn publish(&self, topic: &str, delta: i64) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(MetricKind::Counter))
            .value += delta;
    }

    fn listen(&self, topic: &str, listener: MetricListener) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(MetricKind::Counter))
            .listeners
            .push(listener);
    }

    fn flush(&self) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        for (name, topic) in topics.iter_mut() {
            for listener in &topic.listeners {
                listener(name, topic.value);
            }
            if topic.kind == MetricKind::Counter {
                topic.value = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn recorder() -> (Arc<AtomicI64>, MetricListener) {
        let seen = Arc::new(AtomicI64::new(i64::MIN));
        let sink = Arc::clone(&seen);
        (seen, Box::new(move |_, v| sink.store(v, Ordering::SeqCst)))
    }

    #[test]
    fn gauge_keeps_running_total_across_flushes() {
        let bus = LocalMetricsBus::new();
        bus.init("g", MetricKind::Gauge);
        let (seen, listener) = recorder();
        bus.listen("g", listener);

        bus.publish("g", 5);
        bus.publish("g", -2);
        bus.flush();
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        bus.publish("g", 1);
        bus.flush();
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn counter_resets_after_flush() {
        let bus = LocalMetricsBus::new();
        bus.init("c", MetricKind::Counter);
        let (seen, listener) = recorder();
        bus.listen("c", listener);

        bus.publish("c", 7);
        bus.flush();
        assert_eq!(seen.load(Ordering::SeqCst), 7);

        bus.flush();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn publish_without_init_creates_counter() {
        let bus = LocalMetricsBus::new();
        bus.publish("adhoc", 2);
        assert_eq!(bus.value("adhoc"), Some(2));
        bus.flush();
        assert_eq!(bus.value("adhoc"), Some(0));
    }
}
