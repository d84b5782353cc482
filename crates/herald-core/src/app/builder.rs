//! EngineBuilder - wiring and start-up validation.
//!
//! Everything the engine cannot run without is checked in `build()`, which
//! returns a [`BuildError`] instead of panicking.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};

use super::engine::{Lifecycle, RunParts};
use super::{Engine, Preloader, Sender, TaskManager};
use crate::config::{ConfigError, EngineConfig};
use crate::ports::{
    Clock, EventSink, MetricsBus, NoopMetricsBus, SystemClock, TaskStore, TracingEventSink,
    Transport, UlidGenerator,
};

/// # Example
/// ```ignore
/// let engine = EngineBuilder::new(config)
///     .store(Arc::new(store))
///     .transport(Arc::new(MyTransport))
///     .build()?;
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn TaskStore>>,
    transport: Option<Arc<dyn Transport>>,
    manual_delivery: bool,
    events: Option<Arc<dyn EventSink>>,
    metrics: Option<Arc<dyn MetricsBus>>,
    clock: Option<Arc<dyn Clock>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no task store configured")]
    MissingStore,

    #[error("no delivery mode: call transport(..) or manual_delivery()")]
    MissingTransport,

    #[error("transport(..) and manual_delivery() are mutually exclusive")]
    ConflictingDelivery,

    #[error("store belongs to instance {store}, config names {config}")]
    InstanceMismatch { store: String, config: String },

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            transport: None,
            manual_delivery: false,
            events: None,
            metrics: None,
            clock: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Deliver due tasks through `transport` with the engine's own workers.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// The caller pulls due tasks with `Engine::consume` instead.
    pub fn manual_delivery(mut self) -> Self {
        self.manual_delivery = true;
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsBus>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Engine, BuildError> {
        self.config.validate()?;

        let store = self.store.ok_or(BuildError::MissingStore)?;
        match (&self.transport, self.manual_delivery) {
            (None, false) => return Err(BuildError::MissingTransport),
            (Some(_), true) => return Err(BuildError::ConflictingDelivery),
            _ => {}
        }

        let instance = store.instance_id().clone();
        if let Some(configured) = &self.config.instance_id
            && configured != instance.as_str()
        {
            return Err(BuildError::InstanceMismatch {
                store: instance.to_string(),
                config: configured.clone(),
            });
        }

        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(TracingEventSink));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetricsBus));

        let manager = Arc::new(TaskManager::new(
            store,
            config.retry_policy(),
            Arc::clone(&events),
            Arc::clone(&metrics),
        ));

        let capacity = config.queue_capacity;
        let (preloaded_tx, preloaded_rx) = mpsc::channel(capacity);
        let (cancel_tx, cancel_rx) = mpsc::channel(capacity);
        let (ready_tx, ready_rx) = mpsc::channel(capacity);
        let (confirm_tx, confirm_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let preloader = Arc::new(Preloader::new(
            Arc::clone(&manager),
            Arc::clone(&clock),
            Arc::clone(&events),
            preloaded_tx,
            config.lookahead(),
            config.safety_window(),
            config.preload_workers,
        ));
        let sender = Arc::new(Sender::new(
            ready_rx,
            ready_tx.clone(),
            confirm_tx,
            shutdown_rx,
        ));

        Ok(Engine {
            instance,
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            events,
            metrics,
            manager,
            preloader,
            sender,
            transport: self.transport,
            cancel_tx,
            wait_list: Default::default(),
            shutdown_tx,
            lifecycle: watch::Sender::new(Lifecycle::Idle),
            parts: Mutex::new(Some(RunParts {
                preloaded_rx,
                cancel_rx,
                ready_tx,
                confirm_rx,
            })),
            config,
        })
    }
}
