//! queue-director: periodic distribution of store-backed work items across
//! a dynamically sized pool of concurrent workers.
//!
//! A [`Director`] fetches pending items from a [`QueueStore`], splits them
//! evenly over its workers (adding temporary workers while the per-worker
//! share exceeds its limit) and reports per-item outcomes back to the
//! caller, who decides what to remove from the store.

// Core modules
pub mod cli;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use error::{DirectorError, ExtensionError, WorkerError};
pub use scheduler::{
    ConfigError, Director, DirectorBuilder, DirectorConfig, DirectorHandle, Extensions, Logger,
    PrepareQueue, TickReport, TickState, WorkReport, Worker, WorkerOptions,
};
pub use store::{FetchOrder, InMemoryStore, QueueKeys, QueueStore, RedisStore, StoreError, WorkItem};
