//! herald - runs one trigger-engine instance and logs every fired task.

mod cli;
mod config;
mod logging;
mod transport;

use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use herald_core::impls::LocalMetricsBus;
use herald_core::ports::metrics::{
    TASKS_CONFIRMED, TASKS_CREATED, TASKS_DELETED, TASKS_OUTSTANDING,
};
use herald_core::ports::{Clock, MetricsBus, SystemClock, TaskStore};
use herald_core::storage::{InMemoryTaskStore, MySqlTaskStore, StoreOptions};
use herald_core::{Engine, EngineBuilder};
use tracing::{error, info, warn};

use crate::config::ConfigFile;
use crate::transport::LoggingTransport;

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("herald error: {err:#}");
        process::exit(1);
    }
}

async fn run_main() -> Result<()> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;

    let mut file = config::load_and_validate(&args.config, args.memory)?;
    if file.lacks_stable_instance_id(args.memory) {
        warn!(
            "no [engine] instance_id configured; collections this run claims are not \
             recovered if it crashes"
        );
    }
    let instance = file.engine.resolve_instance_id();
    file.engine.instance_id = Some(instance.to_string());
    info!(instance_id = %instance, memory = args.memory, "starting herald");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = open_store(&file, args.memory, instance, Arc::clone(&clock)).await?;

    let metrics = Arc::new(LocalMetricsBus::new());
    for topic in [TASKS_OUTSTANDING, TASKS_CREATED, TASKS_DELETED, TASKS_CONFIRMED] {
        metrics.listen(
            topic,
            Box::new(|name: &str, value: i64| tracing::debug!(metric = name, value, "metric")),
        );
    }

    let engine = Arc::new(
        EngineBuilder::new(file.engine)
            .store(store)
            .transport(Arc::new(LoggingTransport))
            .metrics(metrics)
            .clock(Arc::clone(&clock))
            .build()
            .context("building engine")?,
    );

    let runner = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run().await }
    });

    if args.demo_tasks > 0 {
        let engine = Arc::clone(&engine);
        let (count, spread) = (args.demo_tasks, args.demo_spread);
        tokio::spawn(async move {
            if let Err(err) = seed_demo_tasks(&engine, clock.as_ref(), count, spread).await {
                error!(error = %format!("{err:#}"), "demo seeding stopped");
            }
        });
    }

    tokio::spawn({
        let engine = Arc::clone(&engine);
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("ctrl-c received"),
                Err(err) => error!(error = %err, "cannot listen for ctrl-c; stopping"),
            }
            engine.shutdown();
        }
    });

    runner
        .await
        .context("engine task panicked")?
        .context("engine stopped with an error")?;
    Ok(())
}

async fn open_store(
    file: &ConfigFile,
    memory: bool,
    instance: herald_core::InstanceId,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn TaskStore>> {
    let options = StoreOptions::from(&file.engine);
    if memory {
        return Ok(Arc::new(InMemoryTaskStore::new(instance, clock, options)));
    }

    let database = file
        .database
        .as_ref()
        .context("no [database] section")?;
    let store = MySqlTaskStore::connect(
        &database.url,
        database.max_connections,
        instance,
        clock,
        options,
    )
    .await
    .context("connecting to MySQL")?;
    Ok(Arc::new(store))
}

async fn seed_demo_tasks(
    engine: &Engine,
    clock: &dyn Clock,
    count: usize,
    spread_secs: i64,
) -> Result<()> {
    let now = clock.now_secs();
    let spread = spread_secs.max(1);
    for i in 0..count {
        let offset = i64::try_from(i).unwrap_or(i64::MAX) % spread;
        let id = engine
            .create_at(now + offset)
            .await
            .context("registering demo task")?;
        tracing::debug!(task_id = %id, exec_time = now + offset, "demo task registered");
    }
    info!(count, spread_secs = spread, "demo tasks registered");
    Ok(())
}
