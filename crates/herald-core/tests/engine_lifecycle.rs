//! End-to-end engine behaviour over the in-memory store, on paused tokio
//! time with a wall clock that follows it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use herald_core::impls::LocalMetricsBus;
use herald_core::ports::metrics::{TASKS_CONFIRMED, TASKS_OUTSTANDING};
use herald_core::ports::{Clock, TaskStore, Transport, TransportError};
use herald_core::storage::{InMemoryTaskStore, StoreOptions};
use herald_core::{Engine, EngineBuilder, EngineConfig, EngineError, InstanceId, Task, TaskId};

const NOW: i64 = 1_700_000_000;

struct PausedClock {
    start: Instant,
}

impl Clock for PausedClock {
    fn now(&self) -> DateTime<Utc> {
        let base = DateTime::from_timestamp(NOW, 0).unwrap_or_default();
        base + chrono::Duration::from_std(self.start.elapsed()).unwrap_or_default()
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        instance_id: Some("node-a".into()),
        lookahead_ms: 1_000,
        safety_coefficient: 1.5,
        batch_timeout_ms: 20,
        redelivery_delay_ms: 100,
        retry_delay_ms: 1,
        queue_capacity: 1_024,
        metrics_period_ms: 100,
        ..EngineConfig::default()
    }
}

struct Harness {
    engine: Arc<Engine>,
    store: Arc<InMemoryTaskStore>,
    metrics: Arc<LocalMetricsBus>,
    runner: JoinHandle<Result<(), EngineError>>,
}

fn clock() -> Arc<dyn Clock> {
    Arc::new(PausedClock {
        start: Instant::now(),
    })
}

fn new_store(clock: &Arc<dyn Clock>) -> Arc<InMemoryTaskStore> {
    Arc::new(InMemoryTaskStore::new(
        InstanceId::new("node-a"),
        Arc::clone(clock),
        StoreOptions::from(&config()),
    ))
}

fn start(
    store: Arc<InMemoryTaskStore>,
    clock: Arc<dyn Clock>,
    transport: Option<Arc<dyn Transport>>,
) -> Harness {
    let metrics = Arc::new(LocalMetricsBus::new());
    let builder = EngineBuilder::new(config())
        .store(store.clone())
        .clock(clock)
        .metrics(metrics.clone());
    let builder = match transport {
        Some(transport) => builder.transport(transport),
        None => builder.manual_delivery(),
    };
    let engine = Arc::new(builder.build().unwrap());

    let runner = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run().await }
    });
    Harness {
        engine,
        store,
        metrics,
        runner,
    }
}

fn task_at(exec_time: i64) -> Task {
    Task::new(TaskId::from_ulid(ulid::Ulid::new()), exec_time)
}

async fn eventually(mut check: impl AsyncFnMut() -> bool) {
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

impl Harness {
    async fn stop(self) {
        self.engine.shutdown();
        self.runner.await.unwrap().unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn past_due_task_is_released_and_purged_after_confirm() {
    let clock = clock();
    let h = start(new_store(&clock), clock, None);
    let task = task_at(NOW - 10);
    let t0 = Instant::now();

    h.engine.create(task).await.unwrap();
    let delivery = h.engine.consume().await.unwrap();
    assert_eq!(*delivery.task(), task);
    assert!(t0.elapsed() < Duration::from_millis(10));

    delivery.confirm().await.unwrap();
    eventually(async || h.store.count().await.unwrap() == 0).await;
    eventually(async || h.metrics.value(TASKS_OUTSTANDING) == Some(0)).await;

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn task_beyond_the_safety_window_is_preloaded_by_polling() {
    let clock = clock();
    let h = start(new_store(&clock), clock, None);
    let task = task_at(NOW + 10);
    let t0 = Instant::now();

    h.engine.create(task).await.unwrap();
    // outside lookahead * coefficient: stored unclaimed, not in memory yet
    assert_eq!(h.engine.pending(), 0);
    assert_eq!(h.store.collections().await[0].taken_by, None);

    let delivery = h.engine.consume().await.unwrap();
    assert_eq!(*delivery.task(), task);
    let elapsed = t0.elapsed();
    assert!(elapsed >= Duration::from_secs(10), "released early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(11), "released late: {elapsed:?}");

    delivery.confirm().await.unwrap();
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn deleted_task_never_fires() {
    let clock = clock();
    let h = start(new_store(&clock), clock, None);
    // both inside the safety window, so claimed and preloaded at creation
    let doomed = task_at(NOW + 1);
    let kept = task_at(NOW + 1);
    h.engine.create(doomed).await.unwrap();
    h.engine.create(kept).await.unwrap();
    eventually(async || h.engine.pending() == 2).await;

    h.engine.delete(doomed.id()).await.unwrap();
    assert!(matches!(
        h.engine.delete(doomed.id()).await,
        Err(EngineError::TaskNotFound(id)) if id == doomed.id()
    ));

    let delivery = h.engine.consume().await.unwrap();
    assert_eq!(*delivery.task(), kept);
    delivery.confirm().await.unwrap();
    assert_eq!(h.engine.pending(), 0);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn rollback_reoffers_once_and_blocks_double_processing() {
    let clock = clock();
    let h = start(new_store(&clock), clock, None);
    let task = task_at(NOW);
    h.engine.create(task).await.unwrap();

    let first = h.engine.consume().await.unwrap();
    first.rollback().await.unwrap();
    assert!(matches!(
        first.rollback().await,
        Err(EngineError::AlreadyProcessed(_))
    ));

    let second = h.engine.consume().await.unwrap();
    assert_eq!(*second.task(), task);
    second.confirm().await.unwrap();
    assert!(matches!(
        second.confirm().await,
        Err(EngineError::AlreadyProcessed(_))
    ));

    eventually(async || h.metrics.value(TASKS_OUTSTANDING) == Some(0)).await;
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_and_malformed_ids_are_rejected() {
    let clock = clock();
    let h = start(new_store(&clock), clock, None);

    let id = h.engine.create_at(NOW + 100).await.unwrap();
    assert!(matches!(
        h.engine.create(Task::new(id, NOW + 200)).await,
        Err(EngineError::DuplicateTask(dup)) if dup == id
    ));
    assert!(matches!(
        h.engine.create_with_id("not-a-ulid", NOW).await,
        Err(EngineError::MalformedId(_))
    ));
    assert_eq!(
        h.engine.create_with_id(&id.to_string(), NOW).await.err().map(|e| e.to_string()),
        Some(EngineError::DuplicateTask(id).to_string())
    );

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn second_run_is_rejected() {
    let clock = clock();
    let h = start(new_store(&clock), clock, None);
    eventually(async || h.engine.is_running()).await;

    assert!(matches!(h.engine.run().await, Err(EngineError::AlreadyRunning)));
    h.stop().await;
}

struct RecordingTransport {
    delivered: Mutex<Vec<TaskId>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(&self, task: &Task) -> Result<(), TransportError> {
        self.delivered.lock().unwrap().push(task.id());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn transport_mode_delivers_and_confirms_everything() {
    let clock = clock();
    let transport = Arc::new(RecordingTransport {
        delivered: Mutex::new(Vec::new()),
    });
    let h = start(new_store(&clock), clock, Some(transport.clone()));

    for i in 0..50 {
        h.engine.create(task_at(NOW + (i % 4))).await.unwrap();
    }

    eventually(async || h.store.count().await.unwrap() == 0).await;
    assert_eq!(transport.delivered.lock().unwrap().len(), 50);
    eventually(async || h.metrics.value(TASKS_OUTSTANDING) == Some(0)).await;
    assert!(h.metrics.value(TASKS_CONFIRMED).is_some());

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn restarted_instance_recovers_its_claims() {
    let clock = clock();
    let store = new_store(&clock);

    // first run claims the task at creation, then dies before delivery
    let first = start(store.clone(), Arc::clone(&clock), None);
    let task = task_at(NOW + 1);
    first.engine.create(task).await.unwrap();
    assert_eq!(
        store.collections().await[0].taken_by,
        Some(InstanceId::new("node-a"))
    );
    first.runner.abort();
    assert!(first.runner.await.unwrap_err().is_cancelled());
    drop(first.engine);

    let second = start(store.for_instance(InstanceId::new("node-a")).into(), clock, None);
    let delivery = second.engine.consume().await.unwrap();
    assert_eq!(*delivery.task(), task);
    delivery.confirm().await.unwrap();
    eventually(async || second.store.count().await.unwrap() == 0).await;

    second.stop().await;
}

#[tokio::test(start_paused = true)]
async fn confirmation_survives_a_graceful_shutdown() {
    for _ in 0..5 {
        let clock = clock();
        let h = start(new_store(&clock), clock, None);
        h.engine.create(task_at(NOW - 1)).await.unwrap();

        let delivery = h.engine.consume().await.unwrap();
        delivery.confirm().await.unwrap();
        h.engine.shutdown();
        h.runner.await.unwrap().unwrap();

        assert_eq!(h.store.count().await.unwrap(), 0);
        assert!(matches!(delivery.confirm().await, Err(EngineError::AlreadyProcessed(_))));
    }
}

#[tokio::test(start_paused = true)]
async fn deleting_a_released_task_is_harmless() {
    let clock = clock();
    let h = start(new_store(&clock), clock, None);
    let task = task_at(NOW - 1);
    h.engine.create(task).await.unwrap();

    let delivery = h.engine.consume().await.unwrap();
    h.engine.delete(task.id()).await.unwrap();
    delivery.confirm().await.unwrap();
    assert_eq!(h.engine.pending(), 0);

    h.engine.shutdown();
    h.runner.await.unwrap().unwrap();
    // counted once, by the delete; the confirm found nothing left to purge
    assert_eq!(h.store.count().await.unwrap(), 0);
    assert_eq!(h.metrics.value(TASKS_OUTSTANDING), Some(0));
}

#[tokio::test(start_paused = true)]
async fn earliest_representable_exec_time_fires_immediately() {
    let clock = clock();
    let h = start(new_store(&clock), clock, None);
    let task = task_at(i64::MIN);

    h.engine.create(task).await.unwrap();
    let delivery = h.engine.consume().await.unwrap();
    assert_eq!(*delivery.task(), task);
    delivery.confirm().await.unwrap();

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn pending_includes_the_task_whose_timer_is_armed() {
    let clock = clock();
    let h = start(new_store(&clock), clock, None);
    h.engine.create(task_at(NOW + 1)).await.unwrap();

    eventually(async || h.engine.pending() == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.engine.pending(), 1);

    let delivery = h.engine.consume().await.unwrap();
    assert_eq!(h.engine.pending(), 0);
    delivery.confirm().await.unwrap();
    h.stop().await;
}
