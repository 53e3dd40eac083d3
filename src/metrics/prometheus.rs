//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by queue-director and
//! provides functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all queue-director metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Number of items waiting in the director queue.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of workers in the persistent pool.
pub static POOL_SIZE: OnceLock<Gauge> = OnceLock::new();

/// Number of workers currently inside `work()`.
pub static BUSY_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Total ticks, labeled by outcome (ok/error).
pub static TICKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Tick duration in seconds, dispatch excluded.
pub static TICK_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Total timer restarts after failed ticks.
pub static TIMER_RESTARTS: OnceLock<Counter> = OnceLock::new();

/// Total temporary workers created by dynamic scaling.
pub static TEMPORARY_WORKERS: OnceLock<Counter> = OnceLock::new();

/// Total processed items, labeled by outcome (success/failure).
pub static ITEMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Recording
/// through [`MetricsCollector`](super::MetricsCollector) is a no-op until it
/// has run.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Queue and pool metrics
    let queue_depth = Gauge::new(
        "queue_director_queue_depth",
        "Number of items waiting in the director queue",
    )?;

    let pool_size = Gauge::new(
        "queue_director_pool_size",
        "Number of workers in the persistent pool",
    )?;

    let busy_workers = Gauge::new(
        "queue_director_busy_workers",
        "Number of workers currently processing items",
    )?;

    let temporary_workers = Counter::new(
        "queue_director_temporary_workers_total",
        "Total temporary workers created by dynamic scaling",
    )?;

    // Tick metrics
    let ticks_total = CounterVec::new(
        Opts::new("queue_director_ticks_total", "Total scheduling ticks"),
        &["outcome"],
    )?;

    let tick_duration = Histogram::with_opts(
        HistogramOpts::new(
            "queue_director_tick_duration_seconds",
            "Duration of the fetch, prepare and partition stages",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
    )?;

    let timer_restarts = Counter::new(
        "queue_director_timer_restarts_total",
        "Total timer restarts after failed ticks",
    )?;

    // Item metrics
    let items_total = CounterVec::new(
        Opts::new("queue_director_items_total", "Total processed items"),
        &["outcome"],
    )?;

    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(pool_size.clone()))?;
    registry.register(Box::new(busy_workers.clone()))?;
    registry.register(Box::new(temporary_workers.clone()))?;
    registry.register(Box::new(ticks_total.clone()))?;
    registry.register(Box::new(tick_duration.clone()))?;
    registry.register(Box::new(timer_restarts.clone()))?;
    registry.register(Box::new(items_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = POOL_SIZE.set(pool_size);
    let _ = BUSY_WORKERS.set(busy_workers);
    let _ = TEMPORARY_WORKERS.set(temporary_workers);
    let _ = TICKS_TOTAL.set(ticks_total);
    let _ = TICK_DURATION.set(tick_duration);
    let _ = TIMER_RESTARTS.set(timer_restarts);
    let _ = ITEMS_TOTAL.set(items_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
