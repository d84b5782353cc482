//! MemoryEventSink - keeps emitted events for inspection.

use std::sync::Mutex;

use serde_json::Value;

use crate::ports::{EventLevel, EventSink};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub level: EventLevel,
    pub message: String,
    pub context: Value,
}

#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, level: EventLevel) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.level == level)
            .count()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, level: EventLevel, message: &str, context: Value) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedEvent {
                level,
                message: message.to_string(),
                context,
            });
    }
}
