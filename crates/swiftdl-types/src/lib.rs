//! Shared types for swiftdl
//!
//! This crate contains the data-only records shared by the engine
//! and the CLI: tasks, results, metrics, events and configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier of a submitted task
pub type TaskId = Uuid;

/// Per-task progress callback: `(bytes_downloaded, total_bytes_or_zero)`
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

// ============================================================================
// Priority
// ============================================================================

/// Dispatch band a task is queued into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityBand {
    High,
    Normal,
    Low,
}

impl PriorityBand {
    /// Bands in preference order
    pub const ALL: [PriorityBand; 3] = [PriorityBand::High, PriorityBand::Normal, PriorityBand::Low];

    /// Map an integer priority to its band: >5 high, 1..=5 normal, <=0 low
    pub fn from_priority(priority: i32) -> Self {
        if priority > 5 {
            PriorityBand::High
        } else if priority >= 1 {
            PriorityBand::Normal
        } else {
            PriorityBand::Low
        }
    }

    pub fn index(self) -> usize {
        match self {
            PriorityBand::High => 0,
            PriorityBand::Normal => 1,
            PriorityBand::Low => 2,
        }
    }
}

impl fmt::Display for PriorityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PriorityBand::High => "high",
            PriorityBand::Normal => "normal",
            PriorityBand::Low => "low",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Task Types
// ============================================================================

/// Per-transfer options; unset fields fall back to the engine configuration
#[derive(Clone, Default)]
pub struct TransferOptions {
    pub priority: Option<i32>,
    pub headers: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub chunk_size: Option<usize>,
    pub progress: Option<ProgressCallback>,
    pub metadata: HashMap<String, String>,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("priority", &self.priority)
            .field("headers", &self.headers)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("chunk_size", &self.chunk_size)
            .field("progress", &self.progress.is_some())
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// A transfer request as handed to the engine
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,
    pub options: TransferOptions,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            options: TransferOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }
}

/// Largest write buffer a transfer may ask for
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// One submitted transfer. Read-only once it reaches the engine.
#[derive(Clone, Serialize)]
pub struct DownloadTask {
    pub id: TaskId,
    pub url: String,
    pub destination: PathBuf,
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub chunk_size: usize,
    pub priority: i32,
    #[serde(skip)]
    pub progress: Option<ProgressCallback>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl DownloadTask {
    pub fn new(url: String, destination: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            destination,
            headers: HashMap::new(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            chunk_size: 8192,
            priority: 1,
            progress: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn band(&self) -> PriorityBand {
        PriorityBand::from_priority(self.priority)
    }

    /// Time since the task was created
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }

    /// Temporary path the body is streamed into before the final rename
    pub fn part_path(&self) -> PathBuf {
        part_path_for(&self.destination)
    }
}

/// `<destination>.part`
pub fn part_path_for(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "download".into());
    name.push(".part");
    destination.with_file_name(name)
}

impl fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("destination", &self.destination)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

/// Last path segment of a URL, if it looks like a file name
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let name = Path::new(segment).file_name()?.to_str()?.to_string();
    if name.contains('.') {
        Some(name)
    } else {
        None
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Why a task did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// All attempts failed, or the failure was not retryable
    Transfer,
    /// The caller's wait budget ran out; the task may still complete
    WaitTimedOut,
    /// The task left the engine without publishing a result
    Lost,
    /// The engine shut down before the task finished
    Shutdown,
}

/// Outcome of exactly one task
#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub task: Arc<DownloadTask>,
    pub success: bool,
    pub file_path: Option<PathBuf>,
    pub file_size: u64,
    pub duration: Duration,
    /// Bytes per second
    pub speed: f64,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub retries_used: u32,
    /// Last HTTP status seen, 0 if no response arrived
    pub status_code: u16,
    pub from_cache: bool,
}

impl DownloadResult {
    pub fn succeeded(
        task: Arc<DownloadTask>,
        file_path: PathBuf,
        file_size: u64,
        duration: Duration,
        retries_used: u32,
        status_code: u16,
    ) -> Self {
        Self {
            task,
            success: true,
            file_path: Some(file_path),
            file_size,
            duration,
            speed: throughput(file_size, duration),
            error: None,
            failure: None,
            retries_used,
            status_code,
            from_cache: false,
        }
    }

    pub fn failed(
        task: Arc<DownloadTask>,
        kind: FailureKind,
        error: impl Into<String>,
        duration: Duration,
        retries_used: u32,
        status_code: u16,
    ) -> Self {
        Self {
            task,
            success: false,
            file_path: None,
            file_size: 0,
            duration,
            speed: 0.0,
            error: Some(error.into()),
            failure: Some(kind),
            retries_used,
            status_code,
            from_cache: false,
        }
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }
}

/// Bytes per second over a duration, 0 for an empty interval
pub fn throughput(bytes: u64, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}

// ============================================================================
// Metrics Types
// ============================================================================

/// Process-lifetime counters for one engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadMetrics {
    pub total_downloads: u64,
    pub successful_downloads: u64,
    pub failed_downloads: u64,
    pub total_bytes: u64,
    pub total_time: Duration,
    pub avg_speed: f64,
    pub peak_concurrent: usize,
    pub current_concurrent: usize,
    /// Failed attempts summed over all tasks
    pub retry_count: u64,
}

impl DownloadMetrics {
    /// A transfer took a concurrency permit
    pub fn transfer_started(&mut self) {
        self.current_concurrent += 1;
        self.peak_concurrent = self.peak_concurrent.max(self.current_concurrent);
    }

    /// A transfer gave its concurrency permit back
    pub fn transfer_released(&mut self) {
        self.current_concurrent = self.current_concurrent.saturating_sub(1);
    }

    /// Fold one finished task into the totals
    pub fn record(&mut self, result: &DownloadResult, failed_attempts: u32) {
        self.total_downloads += 1;
        if result.success {
            self.successful_downloads += 1;
            self.total_bytes += result.file_size;
        } else {
            self.failed_downloads += 1;
        }
        self.total_time += result.duration;
        self.retry_count += u64::from(failed_attempts);
        self.avg_speed = throughput(self.total_bytes, self.total_time);
    }
}

/// Queue length per band
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.high + self.normal + self.low
    }
}

/// Read-only view of the engine counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(flatten)]
    pub metrics: DownloadMetrics,
    pub queue_depth: QueueDepth,
    pub active_tasks: usize,
}

/// Read-only view of a task the engine still owns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTaskInfo {
    pub id: TaskId,
    pub url: String,
    pub destination: PathBuf,
    pub priority: i32,
    pub metadata: HashMap<String, String>,
    /// Whether a worker has picked the task up
    pub running: bool,
    pub submitted_at: DateTime<Utc>,
}

impl ActiveTaskInfo {
    pub fn from_task(task: &DownloadTask) -> Self {
        Self {
            id: task.id,
            url: task.url.clone(),
            destination: task.destination.clone(),
            priority: task.priority,
            metadata: task.metadata.clone(),
            running: false,
            submitted_at: task.created_at,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events broadcast by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    TaskQueued {
        id: TaskId,
        url: String,
        band: PriorityBand,
    },
    TaskStarted {
        id: TaskId,
        attempt: u32,
    },
    TaskProgress {
        id: TaskId,
        downloaded: u64,
        /// 0 when the server did not declare a length
        total: u64,
    },
    TaskRetrying {
        id: TaskId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    TaskCompleted {
        id: TaskId,
        success: bool,
        file_size: u64,
        error: Option<String>,
    },
}

// ============================================================================
// Artifact Types
// ============================================================================

/// Class of artifact fetched through the optimizer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Image,
    Video,
    Audio,
    Archive,
    #[default]
    Binary,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Image => "image",
            ArtifactKind::Video => "video",
            ArtifactKind::Audio => "audio",
            ArtifactKind::Archive => "archive",
            ArtifactKind::Binary => "binary",
        }
    }

    /// Extension used when the URL gives no usable file name
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Image => "jpg",
            ArtifactKind::Video => "mp4",
            ArtifactKind::Audio => "mp3",
            ArtifactKind::Archive => "zip",
            ArtifactKind::Binary => "bin",
        }
    }

    /// `Accept` header sent for this kind
    pub fn accept(self) -> &'static str {
        match self {
            ArtifactKind::Image => "image/avif,image/webp,image/apng,image/*,*/*;q=0.8",
            ArtifactKind::Video => "video/webm,video/mp4,video/*;q=0.9,*/*;q=0.5",
            ArtifactKind::Audio => "audio/webm,audio/mpeg,audio/*;q=0.9,*/*;q=0.5",
            ArtifactKind::Archive | ArtifactKind::Binary => "*/*",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "image" => Ok(ArtifactKind::Image),
            "video" => Ok(ArtifactKind::Video),
            "audio" => Ok(ArtifactKind::Audio),
            "archive" => Ok(ArtifactKind::Archive),
            "binary" => Ok(ArtifactKind::Binary),
            other => Err(format!("unknown artifact kind: {}", other)),
        }
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Engine-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Transfers allowed to hold a connection at once
    pub max_concurrent: usize,
    /// Dispatch routines pulling from the queue
    pub workers: usize,
    /// Concurrent disk writes
    pub io_workers: usize,
    pub default_timeout_ms: u64,
    pub default_max_retries: u32,
    pub default_chunk_size: usize,
    pub default_priority: i32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Retry 4xx responses like any other failure
    pub retry_client_errors: bool,
    /// Slack added to a caller's wait budget
    pub wait_buffer_ms: u64,
    /// Dequeue wait per band, high to low
    pub band_wait_ms: [u64; 3],
    pub idle_wait_ms: u64,
    /// Every n-th dequeue scans bands low to high
    pub fairness_interval: u32,
    pub connect_timeout_ms: u64,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout_ms: u64,
    pub user_agent: String,
    /// Aggregate body throughput cap in bytes/sec
    pub speed_limit: Option<u64>,
    /// Where the artifact optimizer stores files
    pub artifact_dir: PathBuf,
}

impl EngineConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn wait_buffer(&self) -> Duration {
        Duration::from_millis(self.wait_buffer_ms)
    }

    pub fn band_waits(&self) -> [Duration; 3] {
        self.band_wait_ms.map(Duration::from_millis)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_idle_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            workers: 10,
            io_workers: 5,
            default_timeout_ms: 30_000,
            default_max_retries: 3,
            default_chunk_size: 8192,
            default_priority: 1,
            initial_retry_delay_ms: 1_000,
            max_retry_delay_ms: 60_000,
            retry_client_errors: false,
            wait_buffer_ms: 30_000,
            band_wait_ms: [50, 100, 200],
            idle_wait_ms: 1_000,
            fairness_interval: 8,
            connect_timeout_ms: 10_000,
            pool_max_idle_per_host: 10,
            pool_idle_timeout_ms: 90_000,
            user_agent: concat!("swiftdl/", env!("CARGO_PKG_VERSION")).to_string(),
            speed_limit: None,
            artifact_dir: dirs::download_dir()
                .map(|p| p.join("swiftdl"))
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_bands() {
        assert_eq!(PriorityBand::from_priority(10), PriorityBand::High);
        assert_eq!(PriorityBand::from_priority(6), PriorityBand::High);
        assert_eq!(PriorityBand::from_priority(5), PriorityBand::Normal);
        assert_eq!(PriorityBand::from_priority(1), PriorityBand::Normal);
        assert_eq!(PriorityBand::from_priority(0), PriorityBand::Low);
        assert_eq!(PriorityBand::from_priority(-3), PriorityBand::Low);
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = DownloadTask::new("http://x/a".into(), "/tmp/a".into());
        let b = DownloadTask::new("http://x/a".into(), "/tmp/a".into());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_part_path() {
        let task = DownloadTask::new("http://x/a".into(), "/tmp/out/file.bin".into());
        assert_eq!(task.part_path(), PathBuf::from("/tmp/out/file.bin.part"));
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://cdn.example.com/media/cover.png?size=large"),
            Some("cover.png".to_string())
        );
        assert_eq!(file_name_from_url("https://example.com/watch"), None);
        assert_eq!(file_name_from_url("https://example.com/"), None);
        assert_eq!(file_name_from_url("not a url"), None);
    }

    #[test]
    fn test_metrics_average_speed() {
        let mut metrics = DownloadMetrics::default();
        let task = Arc::new(DownloadTask::new("http://x/a".into(), "/tmp/a".into()));

        for size in [100u64, 300, 600] {
            let result = DownloadResult::succeeded(
                task.clone(),
                "/tmp/a".into(),
                size,
                Duration::from_millis(500),
                0,
                200,
            );
            metrics.record(&result, 0);
        }
        let failed = DownloadResult::failed(
            task,
            FailureKind::Transfer,
            "boom",
            Duration::from_millis(500),
            2,
            500,
        );
        metrics.record(&failed, 3);

        assert_eq!(metrics.total_downloads, 4);
        assert_eq!(metrics.successful_downloads, 3);
        assert_eq!(metrics.failed_downloads, 1);
        assert_eq!(metrics.total_bytes, 1000);
        assert_eq!(metrics.retry_count, 3);
        let expected = 1000.0 / metrics.total_time.as_secs_f64();
        assert!((metrics.avg_speed - expected).abs() < 1e-9);
    }

    #[test]
    fn test_peak_concurrency() {
        let mut metrics = DownloadMetrics::default();
        metrics.transfer_started();
        metrics.transfer_started();
        metrics.transfer_released();
        metrics.transfer_started();
        assert_eq!(metrics.current_concurrent, 2);
        assert_eq!(metrics.peak_concurrent, 2);
        metrics.transfer_released();
        metrics.transfer_released();
        metrics.transfer_released();
        assert_eq!(metrics.current_concurrent, 0);
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_concurrent": 3}"#).unwrap();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.workers, EngineConfig::default().workers);
        assert_eq!(config.band_waits()[2], Duration::from_millis(200));
    }

    #[test]
    fn test_artifact_kind_parse() {
        assert_eq!("Video".parse::<ArtifactKind>(), Ok(ArtifactKind::Video));
        assert!("spreadsheet".parse::<ArtifactKind>().is_err());
    }
}
