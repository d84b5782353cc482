//! App - the trigger pipeline.
//!
//! # Components
//! - **TaskManager**: storage calls with retry, error mapping and metrics
//! - **Preloader**: creation-time claims and the due-window poll loop
//! - **Waiter**: wait list + timer, releases tasks at their execution time
//! - **Sender**: `Delivery` handles, confirm batcher and confirm workers
//! - **DeliveryWorker**: optional transport-driven consumers
//! - **Engine** / **EngineBuilder**: wiring and lifecycle

pub mod builder;
pub mod engine;
pub mod manager;
pub mod preloader;
pub mod sender;
pub mod waiter;
pub mod worker_loop;

pub use self::builder::{BuildError, EngineBuilder};
pub use self::engine::Engine;
pub use self::manager::TaskManager;
pub use self::preloader::Preloader;
pub use self::sender::{Delivery, Sender};
pub use self::waiter::Waiter;
pub use self::worker_loop::DeliveryWorker;

use tokio::sync::watch;

/// Resolves once shutdown was requested or the engine was dropped.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // a closed channel means the engine is gone: stop as well
    let _ = shutdown.wait_for(|stop| *stop).await;
}
