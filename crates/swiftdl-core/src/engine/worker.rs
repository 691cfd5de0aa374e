//! Worker pool - routines that drain the dispatcher
//!
//! Each worker loops: dequeue, take a concurrency permit, run the retry
//! controller around the executor, publish the result, release the permit.

use crate::engine::{
    remove_partial, CompletionRegistry, PriorityDispatcher, RetryPolicy, TransferExecutor,
};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use swiftdl_types::{CoreEvent, DownloadResult, DownloadTask, FailureKind};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// State shared by every worker of one engine run
pub struct WorkerContext {
    pub dispatcher: Arc<PriorityDispatcher<Arc<DownloadTask>>>,
    pub registry: Arc<CompletionRegistry>,
    pub executor: Arc<TransferExecutor>,
    /// Global connection budget
    pub permits: Arc<Semaphore>,
    pub policy: RetryPolicy,
    pub event_tx: broadcast::Sender<CoreEvent>,
    pub cancel: CancellationToken,
}

/// Holds a concurrency permit and keeps `current_concurrent` in step with it
struct TransferSlot {
    registry: Arc<CompletionRegistry>,
    permit: Option<OwnedSemaphorePermit>,
}

impl TransferSlot {
    fn new(registry: Arc<CompletionRegistry>, permit: OwnedSemaphorePermit) -> Self {
        registry.transfer_started();
        Self {
            registry,
            permit: Some(permit),
        }
    }

    /// Give the permit to the registry, which releases it after storing the result
    fn into_permit(mut self) -> Option<OwnedSemaphorePermit> {
        self.permit.take()
    }
}

impl Drop for TransferSlot {
    fn drop(&mut self) {
        // Counter goes down before the permit is returned
        if self.permit.is_some() {
            self.registry.transfer_released();
        }
    }
}

/// Spawn `count` workers onto `set`
pub fn spawn_workers(count: usize, ctx: Arc<WorkerContext>, set: &mut JoinSet<()>) {
    for index in 0..count {
        set.spawn(run_worker(index, ctx.clone()));
    }
}

async fn run_worker(index: usize, ctx: Arc<WorkerContext>) {
    debug!("Worker {} started", index);

    loop {
        let task = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            next = ctx.dispatcher.next() => match next {
                Some(task) => task,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                info!("Worker {} abandoning task {} on shutdown", index, task.id);
                remove_partial(&task.part_path()).await;
                ctx.registry.resolve(DownloadResult::failed(
                    task.clone(),
                    FailureKind::Shutdown,
                    "Engine shut down before the transfer finished",
                    task.age(),
                    0,
                    0,
                ));
                break;
            }
            _ = supervise(&ctx, &task, process(&ctx, task.clone())) => {}
        }
    }

    debug!("Worker {} stopped", index);
}

/// Run `work` for `task`, turning a panic into a `Lost` result so the
/// caller still hears back and the worker keeps going
async fn supervise<F>(ctx: &WorkerContext, task: &Arc<DownloadTask>, work: F)
where
    F: Future<Output = ()>,
{
    if AssertUnwindSafe(work).catch_unwind().await.is_err() {
        error!("Task {} panicked before publishing a result", task.id);
        remove_partial(&task.part_path()).await;
        ctx.registry.resolve(DownloadResult::failed(
            task.clone(),
            FailureKind::Lost,
            "Transfer panicked before publishing a result",
            task.age(),
            0,
            0,
        ));
    }
}

async fn process(ctx: &WorkerContext, task: Arc<DownloadTask>) {
    ctx.registry.mark_running(task.id);

    let permit = match ctx.permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            ctx.registry.resolve(DownloadResult::failed(
                task.clone(),
                FailureKind::Shutdown,
                "Concurrency budget closed",
                std::time::Duration::ZERO,
                0,
                0,
            ));
            return;
        }
    };
    let slot = TransferSlot::new(ctx.registry.clone(), permit);

    let started = Instant::now();
    let executor = ctx.executor.as_ref();
    let task_ref = task.as_ref();
    let event_tx = &ctx.event_tx;

    let outcome = ctx
        .policy
        .run(
            task.max_retries,
            |attempt, delay, err| {
                let _ = event_tx.send(CoreEvent::TaskRetrying {
                    id: task_ref.id,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error: err.to_string(),
                });
            },
            |attempt| {
                let _ = event_tx.send(CoreEvent::TaskStarted {
                    id: task_ref.id,
                    attempt,
                });
                executor.execute(task_ref, attempt)
            },
        )
        .await;

    // Wall time from permit acquisition, retries and backoff included
    let duration = started.elapsed();
    let result = match outcome.result {
        Ok(transfer) => {
            debug!(
                "Task {} succeeded on attempt {} in {:?} at {:.0} B/s",
                task.id, transfer.attempt, transfer.elapsed, transfer.speed
            );
            DownloadResult::succeeded(
                task.clone(),
                transfer.path,
                transfer.bytes,
                duration,
                outcome.retries_used,
                transfer.status,
            )
        }
        Err(e) => {
            error!(
                "Task {} failed after {} attempt(s): {}",
                task.id, outcome.failed_attempts, e
            );
            DownloadResult::failed(
                task.clone(),
                FailureKind::Transfer,
                e.to_string(),
                duration,
                outcome.retries_used,
                e.status_code(),
            )
        }
    };

    ctx.registry
        .complete(result, outcome.failed_attempts, slot.into_permit());
}
