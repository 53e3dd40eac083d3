//! Metric recording for director and worker operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics. Every method is a
//! no-op until `init_metrics()` has populated the registry, so library users
//! that never export metrics pay nothing beyond a `OnceLock` read.

use super::prometheus::{
    BUSY_WORKERS, ITEMS_TOTAL, POOL_SIZE, QUEUE_DEPTH, TEMPORARY_WORKERS, TICKS_TOTAL,
    TICK_DURATION, TIMER_RESTARTS,
};

/// Metrics collector for recording director operational metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a finished tick.
    ///
    /// # Arguments
    ///
    /// * `success` - Whether the tick completed without an infrastructure error
    /// * `duration_secs` - Time spent in fetch, prepare and partition
    pub fn record_tick(&self, success: bool, duration_secs: f64) {
        let outcome = if success { "ok" } else { "error" };

        if let Some(ticks_total) = TICKS_TOTAL.get() {
            ticks_total.with_label_values(&[outcome]).inc();
        }

        if let Some(tick_duration) = TICK_DURATION.get() {
            tick_duration.observe(duration_secs);
        }

        tracing::trace!(
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded tick metric"
        );
    }

    /// Record a timer restart.
    pub fn record_timer_restart(&self) {
        if let Some(restarts) = TIMER_RESTARTS.get() {
            restarts.inc();
        }
    }

    /// Record a temporary worker created by dynamic scaling.
    pub fn record_temporary_worker(&self) {
        if let Some(temporary) = TEMPORARY_WORKERS.get() {
            temporary.inc();
        }
    }

    /// Record one processed item.
    pub fn record_item(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };

        if let Some(items_total) = ITEMS_TOTAL.get() {
            items_total.with_label_values(&[outcome]).inc();
        }
    }

    /// Update the director queue depth.
    pub fn update_queue_depth(&self, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.set(depth as f64);
        }

        tracing::trace!(depth = depth, "Updated queue depth metric");
    }

    /// Update the persistent pool size.
    pub fn update_pool_size(&self, size: usize) {
        if let Some(pool_size) = POOL_SIZE.get() {
            pool_size.set(size as f64);
        }
    }

    /// Increment the count of busy workers by 1.
    pub fn worker_busy(&self) {
        if let Some(busy) = BUSY_WORKERS.get() {
            busy.inc();
        }
    }

    /// Decrement the count of busy workers by 1.
    pub fn worker_idle(&self) {
        if let Some(busy) = BUSY_WORKERS.get() {
            busy.dec();
        }
    }
}
