//! Completion registry - the hand-off between workers and callers
//!
//! Holds, under one lock, the active-task map, a one-shot sender per
//! waiting caller, the metrics counters and the completion listeners.
//! Every result goes through [`CompletionRegistry::complete`] or
//! [`CompletionRegistry::resolve`] exactly once.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use swiftdl_types::{
    ActiveTaskInfo, CoreEvent, DownloadMetrics, DownloadResult, DownloadTask, FailureKind, TaskId,
};
use tokio::sync::{broadcast, oneshot, OwnedSemaphorePermit};
use tracing::{debug, warn};

/// Callback run after every task completion
pub type CompletionListener = Arc<dyn Fn(&DownloadResult) + Send + Sync>;

/// Token returned by listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct RegistryState {
    active: HashMap<TaskId, ActiveTaskInfo>,
    waiters: HashMap<TaskId, oneshot::Sender<DownloadResult>>,
    metrics: DownloadMetrics,
    listeners: Vec<(ListenerId, CompletionListener)>,
    next_listener: u64,
}

pub struct CompletionRegistry {
    state: Mutex<RegistryState>,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl CompletionRegistry {
    pub fn new(event_tx: broadcast::Sender<CoreEvent>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            event_tx,
        }
    }

    /// Track a newly submitted task and open its hand-off
    pub fn register(&self, task: &DownloadTask) -> oneshot::Receiver<DownloadResult> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.active.insert(task.id, ActiveTaskInfo::from_task(task));
        state.waiters.insert(task.id, tx);
        rx
    }

    pub fn mark_running(&self, id: TaskId) {
        if let Some(info) = self.state.lock().active.get_mut(&id) {
            info.running = true;
        }
    }

    pub fn transfer_started(&self) {
        self.state.lock().metrics.transfer_started();
    }

    pub fn transfer_released(&self) {
        self.state.lock().metrics.transfer_released();
    }

    /// Publish a worker-produced result and fold it into the metrics.
    ///
    /// The result is recorded first, then `permit` is returned and the
    /// concurrency counter drops, then the task leaves the active set.
    /// Callers are woken only after all three.
    pub fn complete(
        &self,
        result: DownloadResult,
        failed_attempts: u32,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        self.publish(result, Some(failed_attempts), permit);
    }

    /// Publish a result that never ran to completion (shutdown, panic).
    /// A task that already has its result is left alone.
    pub fn resolve(&self, result: DownloadResult) {
        self.publish(result, None, None);
    }

    fn publish(
        &self,
        result: DownloadResult,
        failed_attempts: Option<u32>,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let id = result.id();
        let (waiter, listeners) = {
            let mut state = self.state.lock();
            match failed_attempts {
                Some(failed) => state.metrics.record(&result, failed),
                None if !state.active.contains_key(&id) => {
                    debug!("Task {} already has a result", id);
                    return;
                }
                None => {}
            }
            if let Some(permit) = permit {
                state.metrics.transfer_released();
                drop(permit);
            }
            state.active.remove(&id);
            let listeners: Vec<CompletionListener> =
                state.listeners.iter().map(|(_, l)| l.clone()).collect();
            (state.waiters.remove(&id), listeners)
        };

        let _ = self.event_tx.send(CoreEvent::TaskCompleted {
            id,
            success: result.success,
            file_size: result.file_size,
            error: result.error.clone(),
        });

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&result))).is_err() {
                warn!("Completion listener panicked for task {}", id);
            }
        }

        match waiter {
            Some(tx) => {
                if tx.send(result).is_err() {
                    debug!("Caller stopped waiting for task {}", id);
                }
            }
            None => debug!("Task {} completed with no registered waiter", id),
        }
    }

    /// Fail every in-flight hand-off with a shutdown result
    pub fn resolve_all(&self, reason: &str) {
        let pending: Vec<ActiveTaskInfo> = self.state.lock().active.values().cloned().collect();
        for info in pending {
            let mut task = DownloadTask::new(info.url, info.destination);
            task.id = info.id;
            task.priority = info.priority;
            task.metadata = info.metadata;
            self.resolve(DownloadResult::failed(
                Arc::new(task),
                FailureKind::Shutdown,
                reason,
                Duration::ZERO,
                0,
                0,
            ));
        }
    }

    pub fn metrics(&self) -> DownloadMetrics {
        self.state.lock().metrics.clone()
    }

    pub fn active(&self) -> Vec<ActiveTaskInfo> {
        let mut active: Vec<ActiveTaskInfo> = self.state.lock().active.values().cloned().collect();
        active.sort_by_key(|info| info.submitted_at);
        active
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn add_listener(&self, listener: CompletionListener) -> ListenerId {
        let mut state = self.state.lock();
        state.next_listener += 1;
        let id = ListenerId(state.next_listener);
        state.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        state.listeners.len() != before
    }
}

/// Caller side of a submitted task
pub struct DownloadHandle {
    task: Arc<DownloadTask>,
    rx: oneshot::Receiver<DownloadResult>,
    budget: Duration,
    submitted: Instant,
}

impl fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("id", &self.task.id)
            .field("url", &self.task.url)
            .field("budget", &self.budget)
            .finish()
    }
}

impl DownloadHandle {
    pub(crate) fn new(task: Arc<DownloadTask>, rx: oneshot::Receiver<DownloadResult>, budget: Duration) -> Self {
        Self {
            task,
            rx,
            budget,
            submitted: Instant::now(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }

    pub fn task(&self) -> &Arc<DownloadTask> {
        &self.task
    }

    /// Longest [`wait`](Self::wait) holds on before giving up
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Wait for the task's result.
    ///
    /// Running out of budget yields a `WaitTimedOut` failure but leaves the
    /// task itself running.
    pub async fn wait(self) -> DownloadResult {
        match tokio::time::timeout(self.budget, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                warn!("Task {} finished without publishing a result", self.task.id);
                DownloadResult::failed(
                    self.task,
                    FailureKind::Lost,
                    "Task left the engine without a result",
                    self.submitted.elapsed(),
                    0,
                    0,
                )
            }
            Err(_) => {
                warn!("Gave up waiting for task {} after {:?}", self.task.id, self.budget);
                DownloadResult::failed(
                    self.task,
                    FailureKind::WaitTimedOut,
                    format!("Wait timed out after {:?}", self.budget),
                    self.submitted.elapsed(),
                    0,
                    0,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> CompletionRegistry {
        let (tx, _) = broadcast::channel(16);
        CompletionRegistry::new(tx)
    }

    fn task() -> Arc<DownloadTask> {
        Arc::new(DownloadTask::new("http://example.com/a".into(), "/tmp/a".into()))
    }

    #[tokio::test]
    async fn test_complete_hands_off_and_clears_active() {
        let registry = registry();
        let task = task();
        let rx = registry.register(&task);
        assert_eq!(registry.active_count(), 1);

        registry.mark_running(task.id);
        assert!(registry.active()[0].running);

        let result = DownloadResult::succeeded(
            task.clone(),
            "/tmp/a".into(),
            42,
            Duration::from_secs(1),
            1,
            200,
        );
        registry.complete(result, 1, None);

        let handle = DownloadHandle::new(task, rx, Duration::from_secs(1));
        let received = handle.wait().await;
        assert!(received.success);
        assert_eq!(received.file_size, 42);
        assert_eq!(registry.active_count(), 0);

        let metrics = registry.metrics();
        assert_eq!(metrics.total_downloads, 1);
        assert_eq!(metrics.retry_count, 1);
    }

    #[tokio::test]
    async fn test_resolve_skips_metrics() {
        let registry = registry();
        let task = task();
        let rx = registry.register(&task);
        registry.resolve_all("Engine shut down");

        let result = DownloadHandle::new(task, rx, Duration::from_secs(1)).wait().await;
        assert_eq!(result.failure, Some(FailureKind::Shutdown));
        assert_eq!(registry.metrics().total_downloads, 0);
    }

    #[tokio::test]
    async fn test_complete_releases_permit_before_hand_off() {
        let (tx, mut events) = broadcast::channel(16);
        let registry = CompletionRegistry::new(tx);
        let permits = Arc::new(tokio::sync::Semaphore::new(1));
        let permit = permits.clone().acquire_owned().await.unwrap();
        registry.transfer_started();

        let task = task();
        let rx = registry.register(&task);
        registry.complete(
            DownloadResult::failed(task.clone(), FailureKind::Transfer, "x", Duration::ZERO, 0, 0),
            1,
            Some(permit),
        );
        assert_eq!(permits.available_permits(), 1);
        assert_eq!(registry.metrics().current_concurrent, 0);
        assert_eq!(registry.active_count(), 0);

        let result = DownloadHandle::new(task.clone(), rx, Duration::from_secs(1)).wait().await;
        assert_eq!(result.failure, Some(FailureKind::Transfer));

        // A late shutdown resolution does not publish a second result
        registry.resolve(DownloadResult::failed(
            task,
            FailureKind::Shutdown,
            "late",
            Duration::ZERO,
            0,
            0,
        ));
        let mut completed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CoreEvent::TaskCompleted { .. }) {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(registry.metrics().total_downloads, 1);
    }

    #[test]
    fn test_handle_debug_names_task() {
        let task = task();
        let (_tx, rx) = oneshot::channel();
        let handle = DownloadHandle::new(task.clone(), rx, Duration::from_secs(2));
        let rendered = format!("{:?}", handle);
        assert!(rendered.contains(&task.id.to_string()));
        assert!(rendered.contains("budget"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let registry = registry();
        let task = task();
        let rx = registry.register(&task);

        let result = DownloadHandle::new(task, rx, Duration::from_secs(3)).wait().await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::WaitTimedOut));
        assert!(result.error.unwrap().contains("Wait timed out"));
        // Still owned by the engine
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_sender_reports_lost() {
        let (tx, rx) = oneshot::channel::<DownloadResult>();
        drop(tx);
        let result = DownloadHandle::new(task(), rx, Duration::from_secs(1)).wait().await;
        assert_eq!(result.failure, Some(FailureKind::Lost));
    }

    #[test]
    fn test_listeners_run_and_unregister() {
        let registry = registry();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = {
            let hits = hits.clone();
            registry.add_listener(Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }))
        };
        registry.add_listener(Arc::new(|_| panic!("listener failure")));

        let t = task();
        let _rx = registry.register(&t);
        registry.complete(
            DownloadResult::failed(t.clone(), FailureKind::Transfer, "x", Duration::ZERO, 0, 0),
            1,
            None,
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(registry.remove_listener(id));
        assert!(!registry.remove_listener(id));
        let _rx = registry.register(&t);
        registry.complete(
            DownloadResult::failed(t, FailureKind::Transfer, "x", Duration::ZERO, 0, 0),
            1,
            None,
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
