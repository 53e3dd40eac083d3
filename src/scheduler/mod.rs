//! Scheduling core: the director loop, workers and dynamic scaling.
//!
//! - **Director**: owns the worker pool and runs the periodic fetch,
//!   prepare, partition and dispatch cycle
//! - **Worker**: drains its private queue by running the work function over
//!   each item concurrently, isolating per-item failures
//! - **ScalingPolicy**: the pure partitioning arithmetic
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  QueueStore  │
//!                      │ (Redis / mem)│
//!                      └──────┬───────┘
//!                             │ fetch_keys + fetch_payloads
//!                      ┌──────▼───────┐
//!                      │   Director   │  timer → tick
//!                      │    queue     │
//!                      └──────┬───────┘
//!                             │ partition (may grow pool)
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use queue_director::scheduler::{Director, DirectorConfig};
//! use queue_director::store::{QueueKeys, RedisStore};
//! use std::sync::Arc;
//!
//! let store = RedisStore::connect("redis://localhost:6379", QueueKeys::new("writer_keys")?).await?;
//! let director = Director::builder()
//!     .config(DirectorConfig::from_env()?.with_dynamic_threads(8))
//!     .store(Arc::new(store))
//!     .work_function(|worker, item| async move {
//!         worker.director().remove_from_store(item.key.clone());
//!         Ok(serde_json::Value::Bool(true))
//!     })
//!     .on_work_success(|_director, worker, report| {
//!         tracing::info!(worker_id = worker.id(), ok = report.succeeded(), "done");
//!     })
//!     .build()?;
//!
//! director.run()?;
//! ```

pub mod config;
pub mod director;
pub mod extensions;
pub mod logger;
pub mod partition;
pub mod worker;

// Re-export main types for convenience
pub use config::{ConfigError, DirectorConfig, DynamicThreads};
pub use director::{
    Director, DirectorBuilder, DirectorHandle, FillOutcome, ItemFilter, PrepareQueue, TickReport,
    TickState, WorkErrorHandler, WorkSuccessHandler, DIRECTOR_RESERVED_NAMES,
};
pub use extensions::{ExtensionMethod, Extensions, ExtensionsBuilder};
pub use logger::{LogLevel, Logger, MemoryLogger, TracingLogger};
pub use partition::{PartitionPlan, ScalingPolicy};
pub use worker::{
    FnWork, ItemErrorHandler, WorkFunction, WorkReport, Worker, WorkerOptions,
    WORKER_RESERVED_NAMES,
};
