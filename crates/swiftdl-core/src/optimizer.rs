//! Artifact download optimizer
//!
//! A policy layer over [`DownloadEngine`]: artifacts always go out at high
//! priority with browser-like headers, land in one directory, and repeat
//! requests for a URL are served from an in-memory cache while the file
//! still exists.

use crate::{DownloadEngine, DownloadError};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use swiftdl_types::{
    file_name_from_url, ArtifactKind, DownloadRequest, DownloadResult, DownloadTask,
    TransferOptions,
};
use tracing::{debug, info};
use uuid::Uuid;

/// Priority every artifact is submitted with
pub const ARTIFACT_PRIORITY: i32 = 10;

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

pub struct ArtifactDownloader {
    engine: DownloadEngine,
    dir: PathBuf,
    cache: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    /// URL key -> completed file
    entries: HashMap<Uuid, PathBuf>,
    /// File -> URL key it was handed out to; outlives `forget`
    owners: HashMap<PathBuf, Uuid>,
}

impl ArtifactDownloader {
    pub fn new(engine: DownloadEngine, dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            dir: dir.into(),
            cache: Mutex::new(CacheState::default()),
        }
    }

    /// Store artifacts in the engine's configured `artifact_dir`
    pub fn from_engine(engine: DownloadEngine) -> Self {
        let dir = engine.config().artifact_dir.clone();
        Self::new(engine, dir)
    }

    pub fn engine(&self) -> &DownloadEngine {
        &self.engine
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Fetch `url`, or return the file from an earlier successful fetch
    pub async fn download(&self, url: &str, kind: ArtifactKind) -> Result<DownloadResult, DownloadError> {
        let key = cache_key(url);

        if let Some(result) = self.cache_hit(key, url).await {
            return Ok(result);
        }

        let destination = self.claim_destination(key, url, kind).await;
        let mut options = TransferOptions::new()
            .priority(ARTIFACT_PRIORITY)
            .metadata("artifact_kind", kind.as_str());
        for (name, value) in browser_headers(kind) {
            options = options.header(name, value);
        }

        let result = self
            .engine
            .download(DownloadRequest::new(url, destination).with_options(options))
            .await?;

        if result.success {
            if let Some(path) = &result.file_path {
                debug!("Caching artifact {} at {:?}", url, path);
                self.cache.lock().entries.insert(key, path.clone());
            }
        }
        Ok(result)
    }

    /// Path of a cached artifact whose file still exists
    pub async fn cached(&self, url: &str) -> Option<PathBuf> {
        let key = cache_key(url);
        let path = self.cache.lock().entries.get(&key).cloned()?;

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(path),
            _ => {
                debug!("Cached artifact {:?} is gone", path);
                self.cache.lock().entries.remove(&key);
                None
            }
        }
    }

    /// Drop the cache entry for `url`; the file stays on disk
    pub fn forget(&self, url: &str) -> bool {
        self.cache.lock().entries.remove(&cache_key(url)).is_some()
    }

    pub fn clear(&self) {
        self.cache.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().entries.is_empty()
    }

    /// Pick the file `url` is written to.
    ///
    /// A URL keeps the name it was first given. A derived name already held
    /// by another URL, or by a file this downloader did not write, gets the
    /// URL hash appended.
    async fn claim_destination(&self, key: Uuid, url: &str, kind: ArtifactKind) -> PathBuf {
        let name = artifact_file_name(url, kind);
        let preferred = self.dir.join(&name);
        let on_disk = tokio::fs::try_exists(&preferred).await.unwrap_or(false);

        let mut cache = self.cache.lock();
        let path = match cache.owners.get(&preferred) {
            Some(owner) if *owner == key => preferred,
            None if !on_disk => preferred,
            _ => {
                let path = self.dir.join(disambiguate(&name, key));
                debug!("{:?} is taken, writing {} to {:?}", preferred, url, path);
                path
            }
        };
        cache.owners.insert(path.clone(), key);
        path
    }

    async fn cache_hit(&self, key: Uuid, url: &str) -> Option<DownloadResult> {
        let path = self.cache.lock().entries.get(&key).cloned()?;

        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                self.cache.lock().entries.remove(&key);
                return None;
            }
        };

        info!("Artifact cache hit for {}", url);
        let mut task = DownloadTask::new(url.to_string(), path.clone());
        task.priority = ARTIFACT_PRIORITY;
        task.metadata.insert("cache_hit".into(), "true".into());

        let mut result = DownloadResult::succeeded(Arc::new(task), path, size, Duration::ZERO, 0, 0);
        result.from_cache = true;
        Some(result)
    }
}

/// Cache key for a URL: UUID v5 in the URL namespace
pub fn cache_key(url: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes())
}

/// File name from the URL path, else `<kind>_<hash>.<ext>`
pub fn artifact_file_name(url: &str, kind: ArtifactKind) -> String {
    if let Some(name) = file_name_from_url(url) {
        return name;
    }

    let seed = format!("{}#{}", url, Utc::now().timestamp_nanos_opt().unwrap_or_default());
    let hash = Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes()).simple().to_string();
    format!("{}_{}.{}", kind, &hash[..16], kind.extension())
}

/// `logo.png` -> `logo_<hash16>.png`
fn disambiguate(name: &str, key: Uuid) -> String {
    let hash = key.simple().to_string();
    let path = Path::new(name);
    match (
        path.file_stem().and_then(|s| s.to_str()),
        path.extension().and_then(|e| e.to_str()),
    ) {
        (Some(stem), Some(ext)) => format!("{}_{}.{}", stem, &hash[..16], ext),
        _ => format!("{}_{}", name, &hash[..16]),
    }
}

fn browser_headers(kind: ArtifactKind) -> [(&'static str, &'static str); 3] {
    [
        ("User-Agent", BROWSER_USER_AGENT),
        ("Accept", kind.accept()),
        ("Accept-Language", "en-US,en;q=0.9"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use swiftdl_types::EngineConfig;

    fn downloader(dir: &std::path::Path) -> ArtifactDownloader {
        let engine = DownloadEngine::new(EngineConfig::default()).unwrap();
        ArtifactDownloader::new(engine, dir)
    }

    #[test]
    fn test_file_name_prefers_url_path() {
        assert_eq!(
            artifact_file_name("https://cdn.example.com/img/logo.png", ArtifactKind::Image),
            "logo.png"
        );
    }

    #[test]
    fn test_file_name_falls_back_to_kind_and_hash() {
        let name = artifact_file_name("https://example.com/stream", ArtifactKind::Video);
        assert!(name.starts_with("video_"));
        assert!(name.ends_with(".mp4"));
        assert_eq!(name.len(), "video_".len() + 16 + ".mp4".len());
    }

    #[test]
    fn test_cache_key_is_stable_per_url() {
        assert_eq!(cache_key("https://a/x"), cache_key("https://a/x"));
        assert_ne!(cache_key("https://a/x"), cache_key("https://a/y"));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_engine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logo.png");
        tokio::fs::write(&path, b"png-bytes").await.unwrap();

        let downloader = downloader(dir.path());
        downloader
            .cache
            .lock()
            .entries
            .insert(cache_key("https://example.com/logo.png"), path.clone());

        // Engine was never started, so only the cache can answer
        let result = downloader
            .download("https://example.com/logo.png", ArtifactKind::Image)
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.from_cache);
        assert_eq!(result.file_size, 9);
        assert_eq!(result.file_path, Some(path));
        assert_eq!(result.task.priority, ARTIFACT_PRIORITY);
    }

    #[tokio::test]
    async fn test_missing_file_invalidates_entry() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = downloader(dir.path());
        downloader
            .cache
            .lock()
            .entries
            .insert(cache_key("https://example.com/gone.zip"), dir.path().join("gone.zip"));

        assert!(downloader.cached("https://example.com/gone.zip").await.is_none());
        assert!(downloader.is_empty());
    }

    #[tokio::test]
    async fn test_shared_file_names_get_the_url_hash() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = downloader(dir.path());
        let a = "https://cdn.example.com/a/logo.png";
        let b = "https://cdn.example.com/b/logo.png";

        let first = downloader
            .claim_destination(cache_key(a), a, ArtifactKind::Image)
            .await;
        let second = downloader
            .claim_destination(cache_key(b), b, ArtifactKind::Image)
            .await;
        assert_eq!(first, dir.path().join("logo.png"));
        assert_ne!(first, second);

        let name = second.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("logo_"));
        assert!(name.ends_with(".png"));
        assert_eq!(name.len(), "logo_".len() + 16 + ".png".len());

        // Both URLs keep their names
        assert_eq!(
            downloader.claim_destination(cache_key(a), a, ArtifactKind::Image).await,
            first
        );
        assert_eq!(
            downloader.claim_destination(cache_key(b), b, ArtifactKind::Image).await,
            second
        );
    }

    #[tokio::test]
    async fn test_foreign_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("report.pdf"), b"mine").await.unwrap();
        let downloader = downloader(dir.path());

        let url = "https://example.com/docs/report.pdf";
        let path = downloader
            .claim_destination(cache_key(url), url, ArtifactKind::Binary)
            .await;
        assert_ne!(path, dir.path().join("report.pdf"));
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("pdf"));
    }

    #[test]
    fn test_forget_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = downloader(dir.path());
        {
            let mut cache = downloader.cache.lock();
            cache.entries.insert(cache_key("https://a/1"), dir.path().join("1"));
            cache.entries.insert(cache_key("https://a/2"), dir.path().join("2"));
        }

        assert!(downloader.forget("https://a/1"));
        assert!(!downloader.forget("https://a/1"));
        assert_eq!(downloader.len(), 1);

        downloader.clear();
        assert!(downloader.is_empty());
    }
}
