//! Worker execution unit.
//!
//! A worker owns a private item queue filled by the director. `work()` drains
//! that queue batch by batch, running the caller's work function for every
//! item of a batch concurrently on the calling task. Each item is isolated:
//! an error or panic is reported to the item error handler and leaves an
//! empty slot in the results, while its siblings carry on.
//!
//! The busy flag is a single-flight guard: a second `work()` while one is in
//! flight fails with `WorkerError::Busy` and leaves the queue alone.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use tracing::debug;

use super::config::ConfigError;
use super::director::DirectorHandle;
use super::extensions::Extensions;
use crate::error::WorkerError;
use crate::store::WorkItem;

/// Member names a worker extension may not use.
pub const WORKER_RESERVED_NAMES: &[&str] = &[
    "director",
    "queue",
    "id",
    "is_busy",
    "is_temporary",
    "fill_queue",
    "work",
    "extensions",
];

/// Asynchronous function applied to every item a worker receives.
#[async_trait]
pub trait WorkFunction: Send + Sync {
    /// Processes one item.
    async fn call(&self, worker: Arc<Worker>, item: WorkItem) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`WorkFunction`].
pub struct FnWork<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnWork<F, Fut>
where
    F: Fn(Arc<Worker>, WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> WorkFunction for FnWork<F, Fut>
where
    F: Fn(Arc<Worker>, WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, worker: Arc<Worker>, item: WorkItem) -> anyhow::Result<Value> {
        (self.f)(worker, item).await
    }
}

/// Handler invoked for every failed item.
pub type ItemErrorHandler = Arc<dyn Fn(&Worker, &WorkItem, &anyhow::Error) + Send + Sync>;

/// Options used to construct every worker of a director.
#[derive(Clone, Default)]
pub struct WorkerOptions {
    work_function: Option<Arc<dyn WorkFunction>>,
    on_work_error: Option<ItemErrorHandler>,
    extensions: Extensions,
}

impl fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("work_function", &self.work_function.is_some())
            .field("on_work_error", &self.on_work_error.is_some())
            .field("extensions", &self.extensions)
            .finish()
    }
}

impl WorkerOptions {
    /// Creates empty options. A work function must be set before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the work function from an async closure.
    pub fn work_function<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Arc<Worker>, WorkItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.with_work_function(Arc::new(FnWork::new(f)))
    }

    /// Sets the work function from a trait object.
    pub fn with_work_function(mut self, work_function: Arc<dyn WorkFunction>) -> Self {
        self.work_function = Some(work_function);
        self
    }

    /// Sets the per-item error handler.
    pub fn on_work_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Worker, &WorkItem, &anyhow::Error) + Send + Sync + 'static,
    {
        self.on_work_error = Some(Arc::new(handler));
        self
    }

    /// Sets the worker extensions.
    pub fn extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    /// Checks that the options can build a worker.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingWorkFunction` without a work function,
    /// or `ConfigError::ExtensionNameCollision` if an extension name is
    /// reserved.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.work_function.is_none() {
            return Err(ConfigError::MissingWorkFunction);
        }
        self.extensions
            .ensure_available("worker", WORKER_RESERVED_NAMES)
    }
}

/// Results of one `work()` call.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkReport {
    /// Worker that produced the results.
    pub worker_id: u32,
    /// One slot per processed item; `None` marks a failed item.
    pub results: Vec<Option<Value>>,
    /// When processing started.
    pub started_at: DateTime<Utc>,
    /// When processing finished.
    pub finished_at: DateTime<Utc>,
}

impl WorkReport {
    /// Number of items that succeeded.
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }

    /// Number of items that failed.
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.is_none()).count()
    }

    /// Total number of processed items.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether no item was processed.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Wall-clock processing time.
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Clears the busy flag when dropped, including on unwind.
struct BusyGuard<'a> {
    busy: &'a AtomicBool,
    director: &'a DirectorHandle,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
        self.director.metrics().worker_idle();
    }
}

/// A concurrent execution unit owned by a director.
pub struct Worker {
    id: u32,
    temporary: bool,
    queue: Mutex<VecDeque<WorkItem>>,
    busy: AtomicBool,
    work_function: Arc<dyn WorkFunction>,
    on_work_error: Option<ItemErrorHandler>,
    extensions: Arc<Extensions>,
    director: DirectorHandle,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("temporary", &self.temporary)
            .field("queue_len", &self.queue_len())
            .field("busy", &self.is_busy())
            .finish()
    }
}

impl Worker {
    /// Creates a worker.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `options` has no work function or uses a
    /// reserved extension name.
    pub fn new(
        id: u32,
        temporary: bool,
        options: &WorkerOptions,
        director: DirectorHandle,
    ) -> Result<Self, ConfigError> {
        options.validate()?;
        let work_function = options
            .work_function
            .clone()
            .ok_or(ConfigError::MissingWorkFunction)?;

        if director.detail_log() {
            director
                .logger()
                .info(&format!("Created worker with id {}", id));
        }

        Ok(Self {
            id,
            temporary,
            queue: Mutex::new(VecDeque::new()),
            busy: AtomicBool::new(false),
            work_function,
            on_work_error: options.on_work_error.clone(),
            extensions: Arc::new(options.extensions.clone()),
            director,
        })
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<WorkItem>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Worker id, unique within its director.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether the worker was created by dynamic scaling.
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Whether a `work()` call is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Number of items waiting in the worker's queue.
    pub fn queue_len(&self) -> usize {
        self.queue().len()
    }

    /// Replaces the worker's queue with `items`.
    pub fn fill_queue(&self, items: impl IntoIterator<Item = WorkItem>) {
        *self.queue() = items.into_iter().collect();
    }

    /// The worker's extensions.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Handle to the owning director.
    pub fn director(&self) -> &DirectorHandle {
        &self.director
    }

    /// Processes the queue until it is empty.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Busy` if another `work()` call is in flight.
    pub async fn work(self: &Arc<Self>) -> Result<WorkReport, WorkerError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(WorkerError::Busy(self.id));
        }
        self.director.metrics().worker_busy();
        let _guard = BusyGuard {
            busy: &self.busy,
            director: &self.director,
        };

        let started_at = Utc::now();
        let mut results = Vec::new();

        loop {
            let batch: Vec<WorkItem> = self.queue().drain(..).collect();
            if batch.is_empty() {
                break;
            }

            debug!(worker_id = self.id, batch = batch.len(), "Processing batch");
            let outcomes = join_all(batch.into_iter().map(|item| self.run_item(item))).await;
            results.extend(outcomes);
        }

        Ok(WorkReport {
            worker_id: self.id,
            results,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn run_item(self: &Arc<Self>, item: WorkItem) -> Option<Value> {
        let retained = item.clone();
        let call = AssertUnwindSafe(self.work_function.call(Arc::clone(self), item));

        match call.catch_unwind().await {
            Ok(Ok(value)) => {
                self.director.metrics().record_item(true);
                Some(value)
            }
            Ok(Err(error)) => {
                self.item_failed(&retained, error);
                None
            }
            Err(panic) => {
                let error = anyhow::anyhow!("work function panicked: {}", panic_message(&*panic));
                self.item_failed(&retained, error);
                None
            }
        }
    }

    fn item_failed(&self, item: &WorkItem, error: anyhow::Error) {
        self.director.metrics().record_item(false);

        if self.director.detail_log() {
            self.director.logger().error(&format!(
                "Worker {} failed item {}: {:#}",
                self.id, item.key, error
            ));
        }

        if let Some(handler) = &self.on_work_error {
            handler(self, item, &error);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::logger::{LogLevel, MemoryLogger};
    use crate::store::{FetchOrder, InMemoryStore};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn handle_with(logger: Arc<MemoryLogger>, detail_log: bool) -> DirectorHandle {
        DirectorHandle::new(
            Arc::new(InMemoryStore::new()),
            FetchOrder::Random,
            logger,
            detail_log,
            Arc::new(Extensions::empty()),
        )
    }

    fn handle() -> DirectorHandle {
        handle_with(Arc::new(MemoryLogger::new()), false)
    }

    fn echo_options() -> WorkerOptions {
        WorkerOptions::new().work_function(|_worker: Arc<Worker>, item: WorkItem| async move {
            if item.payload == "fail" {
                Err(anyhow::anyhow!("ACTION IS FALSE"))
            } else {
                Ok(json!(item.key))
            }
        })
    }

    fn items(payloads: &[&str]) -> Vec<WorkItem> {
        payloads
            .iter()
            .enumerate()
            .map(|(i, p)| WorkItem::new(format!("k{}", i + 1), *p))
            .collect()
    }

    #[test]
    fn test_missing_work_function_fails() {
        let err = Worker::new(1, false, &WorkerOptions::new(), handle()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingWorkFunction));
    }

    #[test]
    fn test_reserved_extension_name_fails() {
        let ext = Extensions::builder()
            .param("queue", json!("taken"))
            .build()
            .unwrap();
        let options = echo_options().extensions(ext);

        let err = Worker::new(1, false, &options, handle()).unwrap_err();
        assert!(matches!(err, ConfigError::ExtensionNameCollision { .. }));
    }

    #[test]
    fn test_creation_is_logged_with_detail_log() {
        let logger = Arc::new(MemoryLogger::new());
        let worker = Worker::new(3, true, &echo_options(), handle_with(logger.clone(), true))
            .expect("worker should build");

        assert_eq!(worker.id(), 3);
        assert!(worker.is_temporary());
        assert!(logger.contains(LogLevel::Info, "Created worker with id 3"));
    }

    #[tokio::test]
    async fn test_work_processes_whole_queue() {
        let worker = Arc::new(Worker::new(1, false, &echo_options(), handle()).unwrap());
        worker.fill_queue(items(&["a", "b", "c", "d"]));

        let report = worker.work().await.expect("worker is idle");

        assert_eq!(report.worker_id, 1);
        assert_eq!(report.len(), 4);
        assert_eq!(report.succeeded(), 4);
        assert_eq!(worker.queue_len(), 0);
        assert!(!worker.is_busy());
    }

    #[tokio::test]
    async fn test_failing_item_leaves_hole_and_spares_siblings() {
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failures);
        let options = echo_options().on_work_error(move |worker, item, err| {
            assert_eq!(worker.id(), 1);
            assert_eq!(item.key, "k2");
            assert!(err.to_string().contains("ACTION IS FALSE"));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let worker = Arc::new(Worker::new(1, false, &options, handle()).unwrap());
        worker.fill_queue(items(&["a", "fail", "c"]));

        let report = worker.work().await.unwrap();

        assert_eq!(report.results.len(), 3);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert!(report.results.contains(&None));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_item_is_isolated() {
        let options =
            WorkerOptions::new().work_function(|_worker: Arc<Worker>, item: WorkItem| async move {
                if item.payload == "panic" {
                    panic!("bad item");
                }
                Ok::<_, anyhow::Error>(Value::Bool(true))
            });
        let logger = Arc::new(MemoryLogger::new());
        let worker = Arc::new(Worker::new(1, false, &options, handle_with(logger.clone(), true)).unwrap());
        worker.fill_queue(items(&["ok", "panic", "ok"]));

        let report = worker.work().await.unwrap();

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert!(!worker.is_busy());
        assert!(logger.contains(LogLevel::Error, "bad item"));
    }

    #[tokio::test]
    async fn test_work_is_single_flight() {
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        let options = WorkerOptions::new().work_function(move |_worker: Arc<Worker>, item: WorkItem| {
            let gate = Arc::clone(&gate);
            async move {
                if item.payload == "a" {
                    gate.notified().await;
                }
                Ok::<_, anyhow::Error>(Value::Null)
            }
        });

        let worker = Arc::new(Worker::new(1, false, &options, handle()).unwrap());
        worker.fill_queue(items(&["a"]));

        let running = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.work().await })
        };
        while !worker.is_busy() {
            tokio::task::yield_now().await;
        }

        worker.fill_queue(items(&["b"]));
        let err = worker.work().await.unwrap_err();
        assert!(matches!(err, WorkerError::Busy(1)));
        // the rejected call must not drain the queue
        assert_eq!(worker.queue_len(), 1);

        release.notify_one();
        let report = running.await.unwrap().unwrap();
        assert!(!worker.is_busy());
        // the in-flight call picks up the refilled queue in its next batch
        assert_eq!(report.len(), 2);
    }

    #[tokio::test]
    async fn test_work_function_can_refill_its_queue() {
        let options =
            WorkerOptions::new().work_function(|worker: Arc<Worker>, item: WorkItem| async move {
                if item.payload == "seed" {
                    worker.fill_queue(vec![WorkItem::new("child", "leaf")]);
                }
                Ok::<_, anyhow::Error>(json!(item.key))
            });

        let worker = Arc::new(Worker::new(1, false, &options, handle()).unwrap());
        worker.fill_queue(vec![WorkItem::new("root", "seed")]);

        let report = worker.work().await.unwrap();
        assert_eq!(report.results, vec![Some(json!("root")), Some(json!("child"))]);
    }

    #[tokio::test]
    async fn test_work_on_empty_queue() {
        let worker = Arc::new(Worker::new(1, false, &echo_options(), handle()).unwrap());
        let report = worker.work().await.unwrap();

        assert!(report.is_empty());
        assert!(!worker.is_busy());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*payload), "static");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*payload), "owned");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }
}
