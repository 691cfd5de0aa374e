//! CLI command implementations

use crate::output;
use crate::progress::DownloadProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Context, Result};
use console::style;
use std::path::{Path, PathBuf};
use std::time::Duration;
use swiftdl_core::{ArtifactDownloader, DownloadEngine};
use swiftdl_types::{
    file_name_from_url, ArtifactKind, DownloadRequest, DownloadResult, EngineConfig,
    TransferOptions,
};

// ============================================================================
// Download Commands
// ============================================================================

/// Build per-transfer options from command-line flags
pub fn transfer_options(
    priority: Option<i32>,
    retries: Option<u32>,
    timeout_secs: Option<u64>,
    headers: &[String],
) -> Result<TransferOptions> {
    let mut options = TransferOptions::new();
    options.priority = priority;
    options.max_retries = retries;
    options.timeout = timeout_secs.map(Duration::from_secs);

    for raw in headers {
        let (name, value) = parse_header(raw)?;
        options = options.header(name, value);
    }
    Ok(options)
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("Header must look like `name:value`, got `{}`", raw))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("Header name is empty in `{}`", raw);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Destination for a URL when none was given
fn default_destination(dir: &Path, url: &str, fallback: &str) -> PathBuf {
    dir.join(file_name_from_url(url).unwrap_or_else(|| fallback.to_string()))
}

pub async fn get(
    engine: &DownloadEngine,
    url: &str,
    output: Option<PathBuf>,
    options: TransferOptions,
    format: OutputFormat,
) -> Result<()> {
    let destination = match output {
        Some(path) => path,
        None => {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            default_destination(&cwd, url, "download")
        }
    };

    let progress = (format == OutputFormat::Human).then(|| DownloadProgress::attach(engine));
    let result = engine
        .download(DownloadRequest::new(url, destination).with_options(options))
        .await;
    if let Some(progress) = progress {
        progress.finish().await;
    }

    let result = result?;
    output::print_result(&result, format)?;
    ensure_success(std::slice::from_ref(&result))
}

pub async fn batch(
    engine: &DownloadEngine,
    file: &Path,
    dir: &Path,
    options: TransferOptions,
    format: OutputFormat,
) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read batch file {}", file.display()))?;
    let items = parse_batch(&content, dir);

    if items.is_empty() {
        println!("{}", style("No URLs found in batch file").dim());
        return Ok(());
    }

    let progress = (format == OutputFormat::Human).then(|| DownloadProgress::attach(engine));
    let results = engine.download_batch(items, options).await;
    if let Some(progress) = progress {
        progress.finish().await;
    }

    let results = results?;
    output::print_results(&results, format)?;
    ensure_success(&results)
}

/// One `url [destination]` per line; blank lines and `#` comments are skipped
fn parse_batch(content: &str, dir: &Path) -> Vec<(String, PathBuf)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .enumerate()
        .map(|(index, line)| {
            let mut parts = line.split_whitespace();
            let url = parts.next().unwrap_or_default().to_string();
            let destination = match parts.next() {
                Some(dest) => dir.join(dest),
                None => default_destination(dir, &url, &format!("download_{}", index + 1)),
            };
            (url, destination)
        })
        .collect()
}

pub async fn artifact(
    engine: &DownloadEngine,
    url: &str,
    kind: ArtifactKind,
    dir: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let downloader = match dir {
        Some(dir) => ArtifactDownloader::new(engine.clone(), dir),
        None => ArtifactDownloader::from_engine(engine.clone()),
    };

    let progress = (format == OutputFormat::Human).then(|| DownloadProgress::attach(engine));
    let result = downloader.download(url, kind).await;
    if let Some(progress) = progress {
        progress.finish().await;
    }

    let result = result?;
    output::print_result(&result, format)?;
    ensure_success(std::slice::from_ref(&result))
}

fn ensure_success(results: &[DownloadResult]) -> Result<()> {
    let failed = results.iter().filter(|r| !r.success).count();
    if failed > 0 {
        bail!("{} of {} download(s) failed", failed, results.len());
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub fn config_action(
    config: &EngineConfig,
    path: Option<&Path>,
    action: ConfigAction,
    format: OutputFormat,
) -> Result<()> {
    match action {
        ConfigAction::Show => output::print_config(config, format),
        ConfigAction::Path => {
            let path = path.ok_or_else(|| anyhow!("No configuration directory on this platform"))?;
            match format {
                OutputFormat::Json => {
                    let value = serde_json::json!({
                        "path": path,
                        "exists": path.exists(),
                    });
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                OutputFormat::Human | OutputFormat::Table => {
                    let note = if path.exists() { "" } else { " (not created yet)" };
                    println!("{}{}", path.display(), style(note).dim());
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Authorization: Bearer abc").unwrap(),
            ("Authorization".to_string(), "Bearer abc".to_string())
        );
        assert_eq!(
            parse_header("X-Url:http://a/b").unwrap(),
            ("X-Url".to_string(), "http://a/b".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_parse_batch() {
        let content = "\n# mirrors\nhttps://a.example/one.zip\nhttps://b.example/get two.bin\nhttps://c.example/\n";
        let items = parse_batch(content, Path::new("/out"));

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].1, PathBuf::from("/out/one.zip"));
        assert_eq!(items[1].0, "https://b.example/get");
        assert_eq!(items[1].1, PathBuf::from("/out/two.bin"));
        assert_eq!(items[2].1, PathBuf::from("/out/download_3"));
    }

    #[test]
    fn test_transfer_options_from_flags() {
        let options =
            transfer_options(Some(7), Some(1), Some(5), &["Accept: */*".to_string()]).unwrap();
        assert_eq!(options.priority, Some(7));
        assert_eq!(options.max_retries, Some(1));
        assert_eq!(options.timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.headers.get("Accept").map(String::as_str), Some("*/*"));
    }
}
