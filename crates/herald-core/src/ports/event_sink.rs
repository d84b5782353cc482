//! EventSink port - structured operational events.
//!
//! The engine reports retry exhaustion, fatal loop failures and similar
//! operational facts through this port. [`TracingEventSink`] forwards them to
//! `tracing`; deployments may plug in their own sink.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventLevel {
    Debug,
    Error,
    /// The owning loop terminates right after emitting this.
    Fatal,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, level: EventLevel, message: &str, context: Value);
}

/// Default sink: one `tracing` event per emitted event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, level: EventLevel, message: &str, context: Value) {
        match level {
            EventLevel::Debug => tracing::debug!(%context, "{message}"),
            EventLevel::Error => tracing::error!(%context, "{message}"),
            EventLevel::Fatal => tracing::error!(fatal = true, %context, "{message}"),
        }
    }
}
