//! swiftdl Core - Download Engine
//!
//! This crate provides the concurrent download engine for swiftdl.
//! It handles priority dispatch, retries, streaming writes, completion
//! hand-offs and the artifact optimizer.

pub mod config;
mod engine;
mod error;
mod optimizer;

pub use engine::{
    CompletionListener, DownloadHandle, ListenerId, PriorityDispatcher, RateLimiter, RetryPolicy,
};
pub use error::*;
pub use optimizer::*;

use engine::{remove_partial, spawn_workers, CompletionRegistry, TransferExecutor, WorkerContext};
use reqwest::Client;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swiftdl_types::{
    part_path_for, ActiveTaskInfo, CoreEvent, DownloadRequest, DownloadResult, DownloadTask,
    EngineConfig, FailureKind, MetricsSnapshot, TransferOptions, MAX_CHUNK_SIZE,
};
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long shutdown waits for workers before aborting them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// The main swiftdl engine instance
#[derive(Clone)]
pub struct DownloadEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    dispatcher: Arc<PriorityDispatcher<Arc<DownloadTask>>>,
    registry: Arc<CompletionRegistry>,
    policy: RetryPolicy,
    event_tx: broadcast::Sender<CoreEvent>,
    /// Present between `start` and `shutdown`
    pool: Mutex<Option<WorkerPool>>,
    running: AtomicBool,
}

struct WorkerPool {
    cancel: CancellationToken,
    workers: JoinSet<()>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.get_mut() {
            pool.cancel.cancel();
        }
    }
}

impl DownloadEngine {
    /// Create an engine; no workers run until [`start`](Self::start)
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config::validate(&config)?;

        let (event_tx, _) = broadcast::channel(1000);
        let dispatcher = Arc::new(PriorityDispatcher::new(
            config.band_waits(),
            config.idle_wait(),
            config.fairness_interval,
        ));

        Ok(Self {
            inner: Arc::new(EngineInner {
                policy: RetryPolicy::from_config(&config),
                registry: Arc::new(CompletionRegistry::new(event_tx.clone())),
                dispatcher,
                event_tx,
                pool: Mutex::new(None),
                running: AtomicBool::new(false),
                config,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.inner.event_tx.subscribe()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Build the HTTP client and spawn the worker pool. Starting a running
    /// engine is a no-op.
    pub async fn start(&self) -> Result<(), DownloadError> {
        let mut pool = self.inner.pool.lock().await;
        if pool.is_some() {
            debug!("Engine already running");
            return Ok(());
        }

        let config = &self.inner.config;
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout())
            .tcp_keepalive(TCP_KEEPALIVE)
            .build()?;

        let rate_limiter = RateLimiter::new(config.speed_limit);
        if !rate_limiter.is_unlimited() {
            info!("Speed limit: {:?} bytes/sec", config.speed_limit);
        }

        let cancel = CancellationToken::new();
        let ctx = Arc::new(WorkerContext {
            dispatcher: self.inner.dispatcher.clone(),
            registry: self.inner.registry.clone(),
            executor: Arc::new(TransferExecutor::new(
                client,
                config.io_workers,
                rate_limiter,
                self.inner.event_tx.clone(),
            )),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            policy: self.inner.policy.clone(),
            event_tx: self.inner.event_tx.clone(),
            cancel: cancel.clone(),
        });

        self.inner.dispatcher.reopen();
        let mut workers = JoinSet::new();
        spawn_workers(config.workers, ctx, &mut workers);

        *pool = Some(WorkerPool { cancel, workers });
        self.inner.running.store(true, Ordering::SeqCst);

        info!(
            "Engine started: {} workers, {} concurrent transfers",
            config.workers, config.max_concurrent
        );
        Ok(())
    }

    /// Stop every worker and resolve all pending hand-offs with a
    /// shutdown failure. Shutting down a stopped engine is a no-op.
    pub async fn shutdown(&self) {
        let Some(mut pool) = self.inner.pool.lock().await.take() else {
            return;
        };

        info!("Shutting down engine");
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.dispatcher.close();
        pool.cancel.cancel();

        let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while pool.workers.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            warn!("Workers did not stop within {:?}, aborting", SHUTDOWN_GRACE);
            pool.workers.abort_all();
            while pool.workers.join_next().await.is_some() {}
        }

        self.resolve_queued();

        let leftover = self.inner.registry.active();
        for info in &leftover {
            remove_partial(&part_path_for(&info.destination)).await;
        }
        if !leftover.is_empty() {
            self.inner.registry.resolve_all("Engine shut down");
        }

        info!("Engine stopped");
    }

    fn resolve_queued(&self) {
        for task in self.inner.dispatcher.drain() {
            debug!("Dropping queued task {} on shutdown", task.id);
            self.inner.registry.resolve(DownloadResult::failed(
                task.clone(),
                FailureKind::Shutdown,
                "Engine shut down before the task was dispatched",
                task.age(),
                0,
                0,
            ));
        }
    }

    // ========================================================================
    // Download Operations
    // ========================================================================

    /// Queue a transfer and return its hand-off without waiting
    pub fn submit(&self, request: DownloadRequest) -> Result<DownloadHandle, DownloadError> {
        if !self.is_running() {
            return Err(DownloadError::NotInitialized);
        }
        validate_url(&request.url)?;
        if request.destination.file_name().is_none() {
            return Err(DownloadError::InvalidOperation(format!(
                "destination {:?} has no file name",
                request.destination
            )));
        }

        let task = Arc::new(self.build_task(request));
        let rx = self.inner.registry.register(&task);
        let budget = self.wait_budget(&task);
        let band = task.band();

        self.inner.dispatcher.push(band, task.clone());
        let _ = self.inner.event_tx.send(CoreEvent::TaskQueued {
            id: task.id,
            url: task.url.clone(),
            band,
        });
        debug!("Queued task {} ({}) in {} band", task.id, task.url, band);

        // Lost a race with shutdown
        if self.inner.dispatcher.is_closed() {
            self.resolve_queued();
        }

        Ok(DownloadHandle::new(task, rx, budget))
    }

    /// Submit one transfer and wait for its result
    pub async fn download(&self, request: DownloadRequest) -> Result<DownloadResult, DownloadError> {
        Ok(self.submit(request)?.wait().await)
    }

    /// Submit every pair first, then collect results in submission order.
    ///
    /// Rejected entries become failed results in their slot; an engine
    /// that is not running fails the whole batch.
    pub async fn download_batch(
        &self,
        items: Vec<(String, PathBuf)>,
        options: TransferOptions,
    ) -> Result<Vec<DownloadResult>, DownloadError> {
        let mut pending = Vec::with_capacity(items.len());

        for (url, destination) in items {
            let request = DownloadRequest::new(url, destination).with_options(options.clone());
            match self.submit(request.clone()) {
                Ok(handle) => pending.push(Ok(handle)),
                Err(e @ (DownloadError::InvalidUrl(_) | DownloadError::InvalidOperation(_))) => {
                    warn!("Skipping batch entry: {}", e);
                    let task = Arc::new(self.build_task(request));
                    pending.push(Err(DownloadResult::failed(
                        task,
                        FailureKind::Transfer,
                        e.to_string(),
                        Duration::ZERO,
                        0,
                        0,
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        let results = futures::future::join_all(pending.into_iter().map(|entry| async move {
            match entry {
                Ok(handle) => handle.wait().await,
                Err(rejected) => rejected,
            }
        }))
        .await;

        Ok(results)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            metrics: self.inner.registry.metrics(),
            queue_depth: self.inner.dispatcher.depths(),
            active_tasks: self.inner.registry.active_count(),
        }
    }

    /// Tasks submitted but not yet completed, oldest first
    pub fn active_tasks(&self) -> Vec<ActiveTaskInfo> {
        self.inner.registry.active()
    }

    pub fn add_completion_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DownloadResult) + Send + Sync + 'static,
    {
        self.inner.registry.add_listener(Arc::new(listener))
    }

    pub fn remove_completion_listener(&self, id: ListenerId) -> bool {
        self.inner.registry.remove_listener(id)
    }

    fn build_task(&self, request: DownloadRequest) -> DownloadTask {
        let config = &self.inner.config;
        let options = request.options;

        let mut task = DownloadTask::new(request.url, request.destination);
        task.priority = options.priority.unwrap_or(config.default_priority);
        task.timeout = options.timeout.unwrap_or_else(|| config.default_timeout());
        task.max_retries = options.max_retries.unwrap_or(config.default_max_retries);
        task.chunk_size = options
            .chunk_size
            .unwrap_or(config.default_chunk_size)
            .clamp(1, MAX_CHUNK_SIZE);
        task.headers = options.headers;
        task.progress = options.progress;
        task.metadata = options.metadata;
        task
    }

    /// `timeout * (max_retries + 1) + total backoff + wait_buffer`
    fn wait_budget(&self, task: &DownloadTask) -> Duration {
        task.timeout
            .saturating_mul(task.max_retries.saturating_add(1))
            .saturating_add(self.inner.policy.total_backoff(task.max_retries))
            .saturating_add(self.inner.config.wait_buffer())
    }
}

fn validate_url(raw: &str) -> Result<(), DownloadError> {
    let parsed = url::Url::parse(raw).map_err(|_| DownloadError::InvalidUrl(raw.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        _ => Err(DownloadError::InvalidUrl(raw.to_string())),
    }
}
