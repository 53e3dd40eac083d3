//! Director: the periodic scheduling loop.
//!
//! Every tick runs four stages in order:
//!
//! 1. **Fetch**: refill the local queue from the store (skipped while more
//!    than one item is still queued)
//! 2. **Prepare**: pass the queue through the optional prepare hook
//! 3. **Partition**: split the queue evenly over a snapshot of the pool,
//!    growing the snapshot with temporary workers when dynamic scaling is on
//! 4. **Dispatch**: hand each empty worker its slice and start idle workers
//!
//! A failure in stages 1 to 3 is logged, the tick enters
//! [`TickState::Error`] and the timer is torn down and re-armed. Item
//! failures never reach this level.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::config::{ConfigError, DirectorConfig};
use super::extensions::Extensions;
use super::logger::{Logger, TracingLogger};
use super::partition::ScalingPolicy;
use super::worker::{WorkFunction, Worker, WorkerOptions, WorkReport};
use crate::error::{DirectorError, WorkerError};
use crate::metrics::MetricsCollector;
use crate::store::{FetchOrder, QueueStore, StoreError, WorkItem};

/// Member names a director extension may not use.
pub const DIRECTOR_RESERVED_NAMES: &[&str] = &[
    "config",
    "store",
    "logger",
    "queue",
    "workers",
    "extensions",
    "state",
    "run",
    "start_work",
    "stop_work",
    "work_loop",
    "tick",
    "fill_queue",
    "prepare",
    "partition",
    "dispatch",
    "remove_from_store",
];

/// Synchronous per-item filter applied while filling the queue.
///
/// Returning `None` drops the item for this tick.
pub type ItemFilter = Arc<dyn Fn(WorkItem) -> Option<WorkItem> + Send + Sync>;

/// Callback invoked when a worker's `work()` call completes.
pub type WorkSuccessHandler = Arc<dyn Fn(&Director, &Worker, &WorkReport) + Send + Sync>;

/// Callback invoked when a worker's `work()` call fails as a whole.
pub type WorkErrorHandler = Arc<dyn Fn(&Director, &Worker, &WorkerError) + Send + Sync>;

/// Asynchronous transform applied to the queue before partitioning.
#[async_trait]
pub trait PrepareQueue: Send + Sync {
    /// Returns a replacement queue, or `None` to keep `queue` as is.
    async fn prepare(&self, queue: &[WorkItem]) -> anyhow::Result<Option<Vec<WorkItem>>>;
}

/// Shared context given to every worker.
///
/// Cloning is cheap; everything is reference counted.
#[derive(Clone)]
pub struct DirectorHandle {
    store: Arc<dyn QueueStore>,
    order: FetchOrder,
    logger: Arc<dyn Logger>,
    detail_log: bool,
    extensions: Arc<Extensions>,
    metrics: MetricsCollector,
}

impl fmt::Debug for DirectorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectorHandle")
            .field("order", &self.order)
            .field("detail_log", &self.detail_log)
            .field("extensions", &self.extensions)
            .finish()
    }
}

impl DirectorHandle {
    pub fn new(
        store: Arc<dyn QueueStore>,
        order: FetchOrder,
        logger: Arc<dyn Logger>,
        detail_log: bool,
        extensions: Arc<Extensions>,
    ) -> Self {
        Self {
            store,
            order,
            logger,
            detail_log,
            extensions,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn fetch_order(&self) -> FetchOrder {
        self.order
    }

    pub fn logger(&self) -> &dyn Logger {
        self.logger.as_ref()
    }

    pub fn detail_log(&self) -> bool {
        self.detail_log
    }

    /// The director's extensions.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Removes a delivered key from the store without waiting.
    ///
    /// The removal runs on a spawned task. A failure is logged and never
    /// retried.
    pub fn remove_from_store(&self, key: impl Into<String>) {
        let key = key.into();
        if self.detail_log {
            self.logger.info(&format!("DELETING - {}", key));
        }

        let Ok(runtime) = Handle::try_current() else {
            self.logger.error(&format!(
                "Cannot remove {} from store outside of a Tokio runtime",
                key
            ));
            return;
        };

        let store = Arc::clone(&self.store);
        let logger = Arc::clone(&self.logger);
        let order = self.order;
        runtime.spawn(async move {
            if let Err(e) = store.remove(order, &key).await {
                logger.error(&format!("Failed to remove {} from store: {}", key, e));
            }
        });
    }
}

/// Stage the scheduling loop is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TickState {
    #[default]
    Idle,
    Fetching,
    Preparing,
    Partitioning,
    Dispatching,
    Error,
}

impl TickState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickState::Idle => "idle",
            TickState::Fetching => "fetching",
            TickState::Preparing => "preparing",
            TickState::Partitioning => "partitioning",
            TickState::Dispatching => "dispatching",
            TickState::Error => "error",
        }
    }
}

/// What the fetch stage did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// More than one item was still queued; the store was not called.
    Skipped,
    /// The store returned nothing; the queue was left untouched.
    Empty,
    /// The queue was replaced with this many items.
    Fetched(usize),
}

/// Summary of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub fill: FillOutcome,
    /// Queue length after the prepare stage.
    pub queue_len: usize,
    /// Clamped share handed to each worker.
    pub items_per_worker: usize,
    /// Ids of temporary workers created by this tick.
    pub spawned: Vec<u32>,
    /// `(worker id, slice size)` in dispatch order.
    pub assignments: Vec<(u32, usize)>,
    /// Ids of idle workers holding items whose `work()` was started.
    pub started: Vec<u32>,
    /// Items left in the director queue.
    pub remaining: usize,
}

impl TickReport {
    /// Total items handed to workers.
    pub fn assigned(&self) -> usize {
        self.assignments.iter().map(|(_, n)| n).sum()
    }
}

/// Builder for [`Director`].
#[derive(Default)]
pub struct DirectorBuilder {
    config: DirectorConfig,
    store: Option<Arc<dyn QueueStore>>,
    worker_options: WorkerOptions,
    logger: Option<Arc<dyn Logger>>,
    extensions: Extensions,
    item_filter: Option<ItemFilter>,
    prepare_hook: Option<Arc<dyn PrepareQueue>>,
    on_work_success: Option<WorkSuccessHandler>,
    on_work_error: Option<WorkErrorHandler>,
}

impl DirectorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: DirectorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn worker_options(mut self, options: WorkerOptions) -> Self {
        self.worker_options = options;
        self
    }

    /// Sets the workers' work function from an async closure.
    pub fn work_function<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Worker>, WorkItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.worker_options = std::mem::take(&mut self.worker_options).work_function(f);
        self
    }

    /// Sets the workers' work function from a trait object.
    pub fn with_work_function(mut self, work_function: Arc<dyn WorkFunction>) -> Self {
        self.worker_options =
            std::mem::take(&mut self.worker_options).with_work_function(work_function);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn item_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(WorkItem) -> Option<WorkItem> + Send + Sync + 'static,
    {
        self.item_filter = Some(Arc::new(filter));
        self
    }

    pub fn prepare_queue(mut self, hook: Arc<dyn PrepareQueue>) -> Self {
        self.prepare_hook = Some(hook);
        self
    }

    pub fn on_work_success<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Director, &Worker, &WorkReport) + Send + Sync + 'static,
    {
        self.on_work_success = Some(Arc::new(handler));
        self
    }

    pub fn on_work_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Director, &Worker, &WorkerError) + Send + Sync + 'static,
    {
        self.on_work_error = Some(Arc::new(handler));
        self
    }

    /// Validates everything and builds the director. No timer is armed.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for invalid limits, a missing store or work
    /// function, or a reserved extension name.
    pub fn build(self) -> Result<Arc<Director>, ConfigError> {
        self.config.validate()?;
        let store = self.store.ok_or(ConfigError::MissingStore)?;
        self.worker_options.validate()?;
        self.extensions
            .ensure_available("director", DIRECTOR_RESERVED_NAMES)?;

        let logger = self
            .logger
            .unwrap_or_else(|| Arc::new(TracingLogger) as Arc<dyn Logger>);
        let handle = DirectorHandle::new(
            store,
            self.config.fetch_order(),
            logger,
            self.config.detail_log,
            Arc::new(self.extensions),
        );
        let policy = ScalingPolicy::new(self.config.per_worker_limit, self.config.workers_limit());
        let config = self.config;
        let worker_options = self.worker_options;
        let item_filter = self.item_filter;
        let prepare_hook = self.prepare_hook;
        let on_work_success = self.on_work_success;
        let on_work_error = self.on_work_error;

        Ok(Arc::new_cyclic(|self_ref| Director {
            config,
            policy,
            handle,
            worker_options,
            item_filter,
            prepare_hook,
            on_work_success,
            on_work_error,
            queue: Mutex::new(VecDeque::new()),
            workers: Mutex::new(BTreeMap::new()),
            state: Mutex::new(TickState::Idle),
            timer: Mutex::new(None),
            self_ref: self_ref.clone(),
        }))
    }
}

/// Owns the worker pool and runs the fetch, partition and dispatch cycle.
pub struct Director {
    config: DirectorConfig,
    policy: ScalingPolicy,
    handle: DirectorHandle,
    worker_options: WorkerOptions,
    item_filter: Option<ItemFilter>,
    prepare_hook: Option<Arc<dyn PrepareQueue>>,
    on_work_success: Option<WorkSuccessHandler>,
    on_work_error: Option<WorkErrorHandler>,
    queue: Mutex<VecDeque<WorkItem>>,
    workers: Mutex<BTreeMap<u32, Arc<Worker>>>,
    state: Mutex<TickState>,
    timer: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<Director>,
}

impl fmt::Debug for Director {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Director")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("queue_len", &self.queue_len())
            .field("workers", &self.worker_count())
            .field("armed", &self.is_armed())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Director {
    pub fn builder() -> DirectorBuilder {
        DirectorBuilder::new()
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<WorkItem>> {
        lock(&self.queue)
    }

    fn pool(&self) -> MutexGuard<'_, BTreeMap<u32, Arc<Worker>>> {
        lock(&self.workers)
    }

    fn set_state(&self, state: TickState) {
        *lock(&self.state) = state;
    }

    pub fn config(&self) -> &DirectorConfig {
        &self.config
    }

    pub fn extensions(&self) -> &Extensions {
        self.handle.extensions()
    }

    /// Context shared with every worker.
    pub fn handle(&self) -> &DirectorHandle {
        &self.handle
    }

    pub fn state(&self) -> TickState {
        *lock(&self.state)
    }

    pub fn queue_len(&self) -> usize {
        self.queue().len()
    }

    /// Number of workers in the persistent pool.
    pub fn worker_count(&self) -> usize {
        self.pool().len()
    }

    pub fn worker(&self, id: u32) -> Option<Arc<Worker>> {
        self.pool().get(&id).cloned()
    }

    pub fn worker_ids(&self) -> Vec<u32> {
        self.pool().keys().copied().collect()
    }

    /// Whether the work loop timer is running.
    pub fn is_armed(&self) -> bool {
        lock(&self.timer)
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// See [`DirectorHandle::remove_from_store`].
    pub fn remove_from_store(&self, key: impl Into<String>) {
        self.handle.remove_from_store(key);
    }

    /// Creates the base workers and arms the work loop.
    ///
    /// # Errors
    ///
    /// Returns `DirectorError::AlreadyRunning` if base workers already exist.
    pub fn run(&self) -> Result<(), DirectorError> {
        {
            let mut workers = self.pool();
            if !workers.is_empty() {
                return Err(DirectorError::AlreadyRunning);
            }

            for id in 1..=self.config.threads as u32 {
                let worker = Worker::new(id, false, &self.worker_options, self.handle.clone())?;
                workers.insert(id, Arc::new(worker));
            }
            self.handle.metrics().update_pool_size(workers.len());
        }

        info!(
            threads = self.config.threads,
            workers_limit = ?self.config.workers_limit(),
            interval_ms = self.config.work_loop_interval.as_millis() as u64,
            "Director started"
        );

        self.start_work();
        Ok(())
    }

    /// Arms the recurring timer. Returns `false` if it was already armed.
    ///
    /// The first tick fires one interval after arming. Each fire spawns its
    /// own tick, so a slow tick may overlap the next one.
    pub fn start_work(&self) -> bool {
        let mut timer = lock(&self.timer);
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }

        let Ok(runtime) = Handle::try_current() else {
            self.handle
                .logger()
                .error("Cannot arm the work loop outside of a Tokio runtime");
            return false;
        };

        let director = self.self_ref.clone();
        let period = self.config.work_loop_interval;
        *timer = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let Some(director) = director.upgrade() else {
                    break;
                };
                tokio::spawn(async move { director.work_loop().await });
            }
        }));

        debug!(interval_ms = period.as_millis() as u64, "Work loop armed");
        true
    }

    /// Disarms the timer. In-flight ticks and workers run to completion.
    ///
    /// Returns `false` if the timer was not armed.
    pub fn stop_work(&self) -> bool {
        match lock(&self.timer).take() {
            Some(timer) => {
                let armed = !timer.is_finished();
                timer.abort();
                debug!("Work loop disarmed");
                armed
            }
            None => false,
        }
    }

    /// Tears the timer down and arms it again.
    pub fn restart(&self) -> bool {
        self.stop_work();
        self.handle.metrics().record_timer_restart();
        warn!("Restarting work loop timer");
        self.start_work()
    }

    /// One timer-driven tick with the restart policy applied.
    pub async fn work_loop(&self) {
        match self.tick().await {
            Ok(report) => {
                debug!(
                    queue_len = report.queue_len,
                    assigned = report.assigned(),
                    remaining = report.remaining,
                    spawned = report.spawned.len(),
                    "Tick complete"
                );
            }
            Err(e) => {
                self.handle
                    .logger()
                    .error(&format!("Work loop tick failed: {}", e));
                self.restart();
                self.set_state(TickState::Idle);
            }
        }
    }

    /// Runs the tick stages once, without the restart policy.
    ///
    /// On failure the state is left at [`TickState::Error`].
    ///
    /// # Errors
    ///
    /// Returns `DirectorError` if fetching, preparing or partitioning fails.
    pub async fn tick(&self) -> Result<TickReport, DirectorError> {
        let started = std::time::Instant::now();
        let result = self.run_stages().await;
        self.handle
            .metrics()
            .record_tick(result.is_ok(), started.elapsed().as_secs_f64());

        match &result {
            Ok(_) => self.set_state(TickState::Idle),
            Err(_) => self.set_state(TickState::Error),
        }
        result
    }

    async fn run_stages(&self) -> Result<TickReport, DirectorError> {
        self.set_state(TickState::Fetching);
        let fill = self.fill_queue().await?;

        self.set_state(TickState::Preparing);
        self.prepare().await?;

        let queue_len = self.queue_len();
        if self.handle.detail_log() && queue_len > 0 {
            self.handle
                .logger()
                .info(&format!("Queue length: {}", queue_len));
        }

        self.set_state(TickState::Partitioning);
        let (snapshot, items_per_worker, spawned) = self.partition(queue_len)?;

        self.set_state(TickState::Dispatching);
        let (assignments, started) = self.dispatch(&snapshot, items_per_worker);
        self.promote(&snapshot);

        let remaining = self.queue_len();
        self.handle.metrics().update_queue_depth(remaining);

        Ok(TickReport {
            fill,
            queue_len,
            items_per_worker,
            spawned,
            assignments,
            started,
            remaining,
        })
    }

    /// Refills the local queue from the store.
    ///
    /// # Errors
    ///
    /// Returns `DirectorError::Store` if the store is not connected or a
    /// store call fails.
    pub async fn fill_queue(&self) -> Result<FillOutcome, DirectorError> {
        let store = self.handle.store();
        if !store.is_connected() {
            return Err(StoreError::NotConnected.into());
        }

        if self.queue_len() > 1 {
            return Ok(FillOutcome::Skipped);
        }

        let keys = store
            .fetch_keys(self.handle.fetch_order(), self.config.queue_limit)
            .await?;
        if keys.is_empty() {
            return Ok(FillOutcome::Empty);
        }

        let payloads = store.fetch_payloads(&keys).await?;
        if payloads.is_empty() {
            return Ok(FillOutcome::Empty);
        }

        let items: VecDeque<WorkItem> = keys
            .into_iter()
            .zip(payloads)
            .filter_map(|(key, payload)| payload.map(|payload| WorkItem::new(key, payload)))
            .filter_map(|item| match &self.item_filter {
                Some(filter) => filter(item),
                None => Some(item),
            })
            .collect();

        let fetched = items.len();
        *self.queue() = items;
        self.handle.metrics().update_queue_depth(fetched);

        Ok(FillOutcome::Fetched(fetched))
    }

    async fn prepare(&self) -> Result<(), DirectorError> {
        let Some(hook) = &self.prepare_hook else {
            return Ok(());
        };

        let queue: Vec<WorkItem> = std::mem::take(&mut *self.queue()).into();
        match hook.prepare(&queue).await {
            Ok(Some(prepared)) => {
                *self.queue() = prepared.into();
                Ok(())
            }
            Ok(None) => {
                *self.queue() = queue.into();
                Ok(())
            }
            Err(e) => {
                *self.queue() = queue.into();
                Err(DirectorError::Prepare(format!("{:#}", e)))
            }
        }
    }

    /// Takes a pool snapshot and grows it until the share fits.
    fn partition(
        &self,
        queue_len: usize,
    ) -> Result<(Vec<Arc<Worker>>, usize, Vec<u32>), DirectorError> {
        let mut snapshot: Vec<Arc<Worker>> = self.pool().values().cloned().collect();
        let base = snapshot.len();
        let plan = self.policy.plan(queue_len, base);
        let mut spawned = Vec::with_capacity(plan.extra_workers);

        for _ in 0..plan.extra_workers {
            let Some(worker) = self.create_worker(&snapshot)? else {
                break;
            };
            spawned.push(worker.id());
            snapshot.push(worker);
        }

        let items_per_worker = if snapshot.len() == base + plan.extra_workers {
            plan.items_per_worker
        } else {
            self.policy
                .clamp(ScalingPolicy::items_per_worker(queue_len, snapshot.len()))
        };

        Ok((snapshot, items_per_worker, spawned))
    }

    /// Creates the next temporary worker for `snapshot`.
    ///
    /// Returns `Ok(None)` once the id would exceed the ceiling.
    fn create_worker(&self, snapshot: &[Arc<Worker>]) -> Result<Option<Arc<Worker>>, DirectorError> {
        let id = snapshot.len() as u32 + 1;
        if let Some(limit) = self.policy.workers_limit {
            if id as usize > limit {
                return Ok(None);
            }
        }

        if snapshot.iter().any(|w| w.id() == id) || self.pool().contains_key(&id) {
            return Err(DirectorError::WorkerIdConflict(id));
        }

        let worker = Worker::new(id, true, &self.worker_options, self.handle.clone())?;
        self.handle.metrics().record_temporary_worker();
        debug!(worker_id = id, "Created temporary worker");

        Ok(Some(Arc::new(worker)))
    }

    fn dispatch(
        &self,
        snapshot: &[Arc<Worker>],
        items_per_worker: usize,
    ) -> (Vec<(u32, usize)>, Vec<u32>) {
        let mut assignments = Vec::new();
        let mut started = Vec::new();

        for worker in snapshot {
            if worker.queue_len() == 0 {
                let slice: Vec<WorkItem> = {
                    let mut queue = self.queue();
                    let take = items_per_worker.min(queue.len());
                    queue.drain(..take).collect()
                };
                if !slice.is_empty() {
                    assignments.push((worker.id(), slice.len()));
                    worker.fill_queue(slice);
                }
            }

            // also restarts idle workers left holding items by an earlier tick
            if !worker.is_busy() && worker.queue_len() > 0 {
                self.spawn_work(worker);
                started.push(worker.id());
            }
        }

        (assignments, started)
    }

    fn spawn_work(&self, worker: &Arc<Worker>) {
        let worker = Arc::clone(worker);
        let director = self.self_ref.clone();

        tokio::spawn(async move {
            let outcome = worker.work().await;
            if let Some(director) = director.upgrade() {
                director.work_finished(&worker, outcome);
            }
        });
    }

    fn work_finished(&self, worker: &Worker, outcome: Result<WorkReport, WorkerError>) {
        match outcome {
            Ok(report) => {
                debug!(
                    worker_id = worker.id(),
                    succeeded = report.succeeded(),
                    failed = report.failed(),
                    duration_ms = report.duration().as_millis() as u64,
                    "Worker finished"
                );
                if let Some(handler) = &self.on_work_success {
                    handler(self, worker, &report);
                }
            }
            Err(error) => {
                if self.handle.detail_log() {
                    self.handle
                        .logger()
                        .error(&format!("Worker {} error: {}", worker.id(), error));
                }
                if let Some(handler) = &self.on_work_error {
                    handler(self, worker, &error);
                }
            }
        }
    }

    /// Moves workers created during this tick into the persistent pool.
    fn promote(&self, snapshot: &[Arc<Worker>]) {
        let mut workers = self.pool();
        for worker in snapshot {
            workers
                .entry(worker.id())
                .or_insert_with(|| Arc::clone(worker));
        }
        self.handle.metrics().update_pool_size(workers.len());
    }
}

impl Drop for Director {
    fn drop(&mut self) {
        let timer = self
            .timer
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(timer) = timer {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::logger::{LogLevel, MemoryLogger};
    use crate::store::InMemoryStore;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn ok_work() -> WorkerOptions {
        WorkerOptions::new().work_function(|_worker: Arc<Worker>, item: WorkItem| async move {
            Ok::<_, anyhow::Error>(json!(item.key))
        })
    }

    fn store_with(count: usize) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store.extend((1..=count).map(|i| WorkItem::new(format!("k{}", i), "{}")));
        store
    }

    fn builder(store: Arc<InMemoryStore>, config: DirectorConfig) -> DirectorBuilder {
        Director::builder()
            .config(config)
            .store(store)
            .worker_options(ok_work())
            .logger(Arc::new(MemoryLogger::new()))
    }

    fn slow_config() -> DirectorConfig {
        // long interval so the timer never fires during a test
        DirectorConfig::new().with_work_loop_interval(Duration::from_secs(3600))
    }

    struct Reverse;

    #[async_trait]
    impl PrepareQueue for Reverse {
        async fn prepare(&self, queue: &[WorkItem]) -> anyhow::Result<Option<Vec<WorkItem>>> {
            Ok(Some(queue.iter().rev().cloned().collect()))
        }
    }

    struct Untouched;

    #[async_trait]
    impl PrepareQueue for Untouched {
        async fn prepare(&self, _queue: &[WorkItem]) -> anyhow::Result<Option<Vec<WorkItem>>> {
            Ok(None)
        }
    }

    struct Failing;

    #[async_trait]
    impl PrepareQueue for Failing {
        async fn prepare(&self, _queue: &[WorkItem]) -> anyhow::Result<Option<Vec<WorkItem>>> {
            Err(anyhow::anyhow!("prepare exploded"))
        }
    }

    #[test]
    fn test_build_requires_store() {
        let err = Director::builder().worker_options(ok_work()).build().unwrap_err();
        assert!(matches!(err, ConfigError::MissingStore));
    }

    #[test]
    fn test_build_requires_work_function() {
        let err = Director::builder()
            .store(store_with(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingWorkFunction));
    }

    #[test]
    fn test_build_rejects_reserved_extension() {
        let ext = Extensions::builder()
            .param("workers", json!(3))
            .build()
            .unwrap();
        let err = builder(store_with(0), DirectorConfig::new())
            .extensions(ext)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ExtensionNameCollision { .. }));
    }

    #[test]
    fn test_build_rejects_invalid_limits() {
        let config = DirectorConfig::new().with_threads(4).with_dynamic_threads(2);
        let err = builder(store_with(0), config).build().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_build_does_not_arm_timer() {
        let director = builder(store_with(0), DirectorConfig::new()).build().unwrap();
        assert!(!director.is_armed());
        assert_eq!(director.worker_count(), 0);
        assert_eq!(director.state(), TickState::Idle);
    }

    #[tokio::test]
    async fn test_run_creates_base_workers_once() {
        let director = builder(store_with(0), slow_config().with_threads(3))
            .build()
            .unwrap();

        director.run().unwrap();
        assert_eq!(director.worker_ids(), vec![1, 2, 3]);
        assert!(director.is_armed());

        let err = director.run().unwrap_err();
        assert!(matches!(err, DirectorError::AlreadyRunning));
    }

    #[tokio::test]
    async fn test_start_work_is_idempotent() {
        let director = builder(store_with(0), slow_config()).build().unwrap();

        assert!(director.start_work());
        assert!(!director.start_work());
        assert!(director.stop_work());
        assert!(!director.is_armed());
        assert!(!director.stop_work());
    }

    #[tokio::test]
    async fn test_fill_queue_skips_store_with_backlog() {
        let store = store_with(4);
        let director = builder(Arc::clone(&store), DirectorConfig::new()).build().unwrap();

        assert_eq!(director.fill_queue().await.unwrap(), FillOutcome::Fetched(4));
        let accesses = store.accesses();

        assert_eq!(director.fill_queue().await.unwrap(), FillOutcome::Skipped);
        assert_eq!(store.accesses(), accesses);
        assert_eq!(director.queue_len(), 4);
    }

    #[tokio::test]
    async fn test_fill_queue_refetches_with_single_item() {
        let store = store_with(1);
        let director = builder(Arc::clone(&store), DirectorConfig::new()).build().unwrap();

        director.fill_queue().await.unwrap();
        assert_eq!(director.queue_len(), 1);

        assert_eq!(director.fill_queue().await.unwrap(), FillOutcome::Fetched(1));
        assert_eq!(store.key_fetches(), 2);
    }

    #[tokio::test]
    async fn test_fill_queue_drops_missing_payloads_and_filters() {
        let store = store_with(3);
        store.push_key_only("orphan", 0.0);
        let director = builder(Arc::clone(&store), DirectorConfig::new())
            .item_filter(|item| (item.key != "k2").then(|| item.with_payload("filtered")))
            .build()
            .unwrap();

        assert_eq!(director.fill_queue().await.unwrap(), FillOutcome::Fetched(2));
        let report = director.tick().await.unwrap();
        assert_eq!(report.fill, FillOutcome::Skipped);
        assert_eq!(report.queue_len, 2);
    }

    #[tokio::test]
    async fn test_fill_queue_empty_store_leaves_queue() {
        let director = builder(store_with(0), DirectorConfig::new()).build().unwrap();
        assert_eq!(director.fill_queue().await.unwrap(), FillOutcome::Empty);
        assert_eq!(director.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_fill_queue_fails_without_connection() {
        let store = store_with(2);
        store.set_connected(false);
        let director = builder(Arc::clone(&store), DirectorConfig::new()).build().unwrap();

        let err = director.fill_queue().await.unwrap_err();
        assert!(matches!(err, DirectorError::Store(StoreError::NotConnected)));
        assert_eq!(store.accesses(), 0);
    }

    #[tokio::test]
    async fn test_prepare_replaces_or_keeps_queue() {
        let director = builder(store_with(3), slow_config())
            .prepare_queue(Arc::new(Reverse))
            .build()
            .unwrap();
        director.fill_queue().await.unwrap();
        let first = director.queue().front().map(|i| i.key.clone());
        director.prepare().await.unwrap();
        let reversed = director.queue().front().map(|i| i.key.clone());
        assert_ne!(first, reversed);

        let director = builder(store_with(3), slow_config())
            .prepare_queue(Arc::new(Untouched))
            .build()
            .unwrap();
        director.fill_queue().await.unwrap();
        director.prepare().await.unwrap();
        assert_eq!(director.queue_len(), 3);
    }

    #[tokio::test]
    async fn test_prepare_failure_restores_queue_and_fails_tick() {
        let director = builder(store_with(3), slow_config())
            .prepare_queue(Arc::new(Failing))
            .build()
            .unwrap();

        let err = director.tick().await.unwrap_err();
        assert!(matches!(err, DirectorError::Prepare(ref m) if m.contains("exploded")));
        assert_eq!(director.queue_len(), 3);
        assert_eq!(director.state(), TickState::Error);
    }

    #[tokio::test]
    async fn test_tick_without_scaling_clamps_and_keeps_remainder() {
        let config = slow_config().with_per_worker_limit(2).with_threads(1);
        let director = builder(store_with(5), config).build().unwrap();
        director.run().unwrap();

        let report = director.tick().await.unwrap();

        assert_eq!(report.items_per_worker, 2);
        assert!(report.spawned.is_empty());
        assert_eq!(report.assigned(), 2);
        assert_eq!(report.remaining, 3);
        assert_eq!(director.queue_len(), 3);
    }

    #[tokio::test]
    async fn test_tick_grows_pool_and_promotes_workers() {
        let config = slow_config()
            .with_per_worker_limit(2)
            .with_threads(1)
            .with_dynamic_threads(3);
        let director = builder(store_with(10), config).build().unwrap();
        director.run().unwrap();

        let report = director.tick().await.unwrap();

        assert_eq!(report.spawned, vec![2, 3]);
        assert_eq!(report.items_per_worker, 2);
        assert_eq!(report.assignments, vec![(1, 2), (2, 2), (3, 2)]);
        assert_eq!(report.remaining, 4);
        assert_eq!(director.worker_ids(), vec![1, 2, 3]);
        assert!(director.worker(2).is_some_and(|w| w.is_temporary()));
    }

    #[tokio::test]
    async fn test_idle_worker_with_pending_queue_is_started_without_slice() {
        let config = slow_config().with_per_worker_limit(2).with_threads(1);
        let director = builder(store_with(6), config).build().unwrap();
        director.run().unwrap();

        let worker = director.worker(1).unwrap();
        worker.fill_queue(vec![WorkItem::new("held", "{}")]);

        let report = director.tick().await.unwrap();
        assert!(report.assignments.is_empty());
        assert_eq!(report.started, vec![1]);
        assert_eq!(director.queue_len(), 6);

        for _ in 0..100 {
            if worker.queue_len() == 0 && !worker.is_busy() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(worker.queue_len(), 0);
        assert!(!worker.is_busy());

        // emptied worker takes a slice on the next tick
        let report = director.tick().await.unwrap();
        assert_eq!(report.assignments, vec![(1, 2)]);
    }

    #[tokio::test]
    async fn test_callbacks_receive_reports() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let config = slow_config().with_threads(2);
        let director = builder(store_with(4), config)
            .on_work_success(move |director, worker, report| {
                assert!(director.worker(worker.id()).is_some());
                let _ = tx.send((worker.id(), report.succeeded()));
            })
            .build()
            .unwrap();
        director.run().unwrap();
        director.tick().await.unwrap();

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort();
        assert_eq!(seen, vec![(1, 2), (2, 2)]);
    }

    #[tokio::test]
    async fn test_detail_log_reports_queue_length() {
        let logger = Arc::new(MemoryLogger::new());
        let director = builder(store_with(3), slow_config().with_detail_log(true))
            .logger(logger.clone())
            .build()
            .unwrap();
        director.run().unwrap();
        director.tick().await.unwrap();

        assert!(logger.contains(LogLevel::Info, "Created worker with id 1"));
        assert!(logger.contains(LogLevel::Info, "Queue length: 3"));
    }

    #[tokio::test]
    async fn test_work_loop_restarts_timer_after_failure() {
        let store = store_with(2);
        store.set_fail_fetches(true);
        let logger = Arc::new(MemoryLogger::new());
        let director = builder(Arc::clone(&store), slow_config())
            .logger(logger.clone())
            .build()
            .unwrap();
        director.run().unwrap();

        director.work_loop().await;

        assert!(logger.contains(LogLevel::Error, "Work loop tick failed"));
        assert!(director.is_armed());
        assert_eq!(director.state(), TickState::Idle);
    }

    #[tokio::test]
    async fn test_extensions_are_reachable_from_workers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let ext = Extensions::builder()
            .param("factor", json!(3))
            .method("scaled", |ext, args| {
                let factor = ext.param("factor").and_then(Value::as_i64).unwrap_or(1);
                let value = args.first().and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(factor * value))
            })
            .build()
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let director = Director::builder()
            .config(slow_config())
            .store(store_with(1))
            .extensions(ext)
            .logger(Arc::new(MemoryLogger::new()))
            .work_function(move |worker: Arc<Worker>, _item: WorkItem| {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(worker.director().extensions().call("scaled", &[json!(2)])?)
                }
            })
            .on_work_success(move |_director, _worker, report| {
                let _ = tx.send(report.results.clone());
            })
            .build()
            .unwrap();
        director.run().unwrap();
        director.tick().await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), vec![Some(json!(6))]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn tick_once(
        queue_len: usize,
        threads: usize,
        limit: usize,
        ceiling: Option<usize>,
    ) -> TickReport {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let mut config = slow_config()
                .with_per_worker_limit(limit)
                .with_threads(threads);
            if let Some(ceiling) = ceiling {
                config = config.with_dynamic_threads(ceiling);
            }
            let director = builder(store_with(queue_len), config).build().unwrap();
            director.run().unwrap();
            director.tick().await.unwrap()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_tick_assigns_at_most_pool_share(
            queue_len in 0usize..300,
            threads in 1usize..5,
            limit in 1usize..40,
            ceiling in proptest::option::of(1usize..10),
        ) {
            let ceiling = ceiling.map(|c| c.max(threads));
            let report = tick_once(queue_len, threads, limit, ceiling);
            let pool = threads + report.spawned.len();

            prop_assert!(report.items_per_worker <= limit);
            prop_assert_eq!(report.assigned(), queue_len.min(pool * report.items_per_worker));
            prop_assert_eq!(report.remaining, queue_len - report.assigned());

            match ceiling {
                Some(ceiling) => {
                    let highest = report.spawned.iter().copied().max().unwrap_or(0) as usize;
                    prop_assert!(highest <= ceiling);
                    prop_assert!(pool <= ceiling);
                }
                None => prop_assert!(report.spawned.is_empty()),
            }
        }
    }

    #[test]
    fn test_tick_state_names() {
        assert_eq!(TickState::default(), TickState::Idle);
        assert_eq!(TickState::Partitioning.as_str(), "partitioning");
    }
}
