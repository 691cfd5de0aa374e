//! Transfer executor - one HTTP GET streamed to disk
//!
//! The body is cut into `chunk_size` pieces and written to
//! `<destination>.part` as it arrives. Only a complete body is renamed
//! onto the destination; a failed attempt removes its partial file.

use crate::engine::RateLimiter;
use crate::error::DownloadError;
use futures::StreamExt;
use reqwest::Client;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use swiftdl_types::{throughput, CoreEvent, DownloadTask, MAX_CHUNK_SIZE};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, warn};

/// Minimum spacing of progress events on the broadcast channel
const EVENT_INTERVAL: Duration = Duration::from_millis(250);

/// Result of one successful attempt
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub path: PathBuf,
    pub bytes: u64,
    pub elapsed: Duration,
    pub speed: f64,
    pub attempt: u32,
    pub status: u16,
}

pub struct TransferExecutor {
    client: Client,
    /// Bounds concurrent disk writes
    io_permits: Arc<Semaphore>,
    rate_limiter: RateLimiter,
    event_tx: broadcast::Sender<CoreEvent>,
}

/// Running byte count and throttling state for one attempt
struct Progress<'a> {
    task: &'a DownloadTask,
    event_tx: &'a broadcast::Sender<CoreEvent>,
    downloaded: u64,
    total: u64,
    last_event: Instant,
}

impl Progress<'_> {
    fn advance(&mut self, bytes: usize) {
        self.downloaded += bytes as u64;

        if let Some(callback) = &self.task.progress {
            let (downloaded, total) = (self.downloaded, self.total);
            if catch_unwind(AssertUnwindSafe(|| callback(downloaded, total))).is_err() {
                warn!("Progress callback for task {} panicked", self.task.id);
            }
        }

        if self.last_event.elapsed() >= EVENT_INTERVAL {
            self.emit();
        }
    }

    fn emit(&mut self) {
        let _ = self.event_tx.send(CoreEvent::TaskProgress {
            id: self.task.id,
            downloaded: self.downloaded,
            total: self.total,
        });
        self.last_event = Instant::now();
    }
}

impl TransferExecutor {
    pub fn new(
        client: Client,
        io_workers: usize,
        rate_limiter: RateLimiter,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            client,
            io_permits: Arc::new(Semaphore::new(io_workers.max(1))),
            rate_limiter,
            event_tx,
        }
    }

    /// Run one attempt bounded by the task's timeout
    pub async fn execute(&self, task: &DownloadTask, attempt: u32) -> Result<TransferOutcome, DownloadError> {
        let part_path = task.part_path();

        let result = match tokio::time::timeout(task.timeout, self.transfer(task, &part_path, attempt)).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Timeout(task.timeout)),
        };

        if result.is_err() {
            remove_partial(&part_path).await;
        }
        result
    }

    async fn transfer(
        &self,
        task: &DownloadTask,
        part_path: &Path,
        attempt: u32,
    ) -> Result<TransferOutcome, DownloadError> {
        let started = Instant::now();

        if let Some(parent) = task.destination.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut request = self.client.get(&task.url);
        for (name, value) in &task.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        debug!("Task {} attempt {}: GET {}", task.id, attempt, task.url);
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Http {
                status: status.as_u16(),
            });
        }

        let mut progress = Progress {
            task,
            event_tx: &self.event_tx,
            downloaded: 0,
            total: response.content_length().unwrap_or(0),
            last_event: Instant::now(),
        };

        let chunk_size = task.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        let mut file = File::create(part_path).await?;
        let mut buffer: Vec<u8> = Vec::with_capacity(chunk_size);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let mut rest: &[u8] = &chunk;

            while !rest.is_empty() {
                let take = (chunk_size - buffer.len()).min(rest.len());
                buffer.extend_from_slice(&rest[..take]);
                rest = &rest[take..];

                if buffer.len() == chunk_size {
                    self.write_chunk(&mut file, &buffer).await?;
                    progress.advance(buffer.len());
                    buffer.clear();
                }
            }
        }

        if !buffer.is_empty() {
            self.write_chunk(&mut file, &buffer).await?;
            progress.advance(buffer.len());
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(part_path, &task.destination).await?;
        progress.emit();

        let elapsed = started.elapsed();
        let bytes = progress.downloaded;
        info!(
            "Task {} finished: {} bytes in {:?} ({})",
            task.id,
            bytes,
            elapsed,
            status.as_u16()
        );

        Ok(TransferOutcome {
            path: task.destination.clone(),
            bytes,
            elapsed,
            speed: throughput(bytes, elapsed),
            attempt,
            status: status.as_u16(),
        })
    }

    async fn write_chunk(&self, file: &mut File, chunk: &[u8]) -> Result<(), DownloadError> {
        self.rate_limiter.acquire(chunk.len() as u64).await;

        let _permit = self
            .io_permits
            .acquire()
            .await
            .map_err(|_| DownloadError::ShutDown)?;
        file.write_all(chunk).await?;
        Ok(())
    }
}

/// Best-effort removal of an attempt's partial output
pub async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial file {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial file {:?}: {}", path, e),
    }
}
