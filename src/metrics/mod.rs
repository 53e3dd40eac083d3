//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks queue depth, pool size, busy workers, tick outcomes, timer
//! restarts, dynamic scaling and item outcomes.
//!
//! # Example
//!
//! ```ignore
//! use queue_director::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_item(true);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    BUSY_WORKERS, ITEMS_TOTAL, POOL_SIZE, QUEUE_DEPTH, REGISTRY, TEMPORARY_WORKERS, TICKS_TOTAL,
    TICK_DURATION, TIMER_RESTARTS,
};
