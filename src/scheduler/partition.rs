//! Load partitioning and dynamic scaling arithmetic.
//!
//! Each tick the director splits its queue evenly across the pool:
//! `items_per_worker = ceil(queue_len / workers)`. With dynamic scaling the
//! pool grows one worker at a time while that share exceeds the per-worker
//! limit and the ceiling has not been reached. The share is finally clamped
//! to the limit; whatever does not fit stays queued for the next tick.

/// Scaling and partitioning rules derived from the director configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingPolicy {
    /// Maximum number of items handed to one worker per tick.
    pub per_worker_limit: usize,
    /// Pool size ceiling; `None` disables dynamic scaling.
    pub workers_limit: Option<usize>,
}

/// Outcome of planning one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPlan {
    /// Number of temporary workers to add.
    pub extra_workers: usize,
    /// Clamped number of items per worker.
    pub items_per_worker: usize,
}

impl ScalingPolicy {
    /// Creates a policy.
    pub fn new(per_worker_limit: usize, workers_limit: Option<usize>) -> Self {
        Self {
            per_worker_limit,
            workers_limit,
        }
    }

    /// Even share of `queue_len` items across `workers`, rounded up.
    pub fn items_per_worker(queue_len: usize, workers: usize) -> usize {
        if workers == 0 {
            return 0;
        }
        queue_len.div_ceil(workers)
    }

    /// Whether another worker should be added to a pool of `workers`.
    pub fn should_grow(&self, queue_len: usize, workers: usize) -> bool {
        match self.workers_limit {
            Some(limit) => {
                workers < limit
                    && Self::items_per_worker(queue_len, workers) > self.per_worker_limit
            }
            None => false,
        }
    }

    /// Clamps a share to the per-worker limit.
    pub fn clamp(&self, items_per_worker: usize) -> usize {
        items_per_worker.min(self.per_worker_limit)
    }

    /// Plans the partition of `queue_len` items over a pool of `workers`.
    pub fn plan(&self, queue_len: usize, workers: usize) -> PartitionPlan {
        let mut pool = workers;
        while self.should_grow(queue_len, pool) {
            pool += 1;
        }

        PartitionPlan {
            extra_workers: pool - workers,
            items_per_worker: self.clamp(Self::items_per_worker(queue_len, pool)),
        }
    }
}
