//! Output formatting utilities

use crate::OutputFormat;
use console::style;
use serde::Serialize;
use std::time::Duration;
use swiftdl_types::{DownloadResult, EngineConfig, MetricsSnapshot};
use tabled::{Table, Tabled};

/// Print a value as pretty JSON
fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Tabled)]
struct ResultRow {
    url: String,
    status: String,
    size: String,
    speed: String,
    retries: u32,
    path: String,
}

impl From<&DownloadResult> for ResultRow {
    fn from(result: &DownloadResult) -> Self {
        Self {
            url: truncate(&result.task.url, 48),
            status: if result.from_cache {
                "cached".to_string()
            } else if result.success {
                "ok".to_string()
            } else {
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| "failed".to_string())
            },
            size: format_bytes(result.file_size),
            speed: format_speed(result.speed),
            retries: result.retries_used,
            path: result
                .file_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Two-column `name | value` row
#[derive(Tabled)]
struct SettingRow {
    name: String,
    value: String,
}

impl SettingRow {
    fn new(name: impl Into<String>, value: impl std::fmt::Display) -> Self {
        Self {
            name: name.into(),
            value: value.to_string(),
        }
    }
}

pub fn print_result(result: &DownloadResult, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(result),
        OutputFormat::Table => {
            println!("{}", Table::new([ResultRow::from(result)]));
            Ok(())
        }
        OutputFormat::Human => {
            print_result_line(result);
            Ok(())
        }
    }
}

pub fn print_results(results: &[DownloadResult], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(results),
        OutputFormat::Table => {
            println!("{}", Table::new(results.iter().map(ResultRow::from)));
            Ok(())
        }
        OutputFormat::Human => {
            for result in results {
                print_result_line(result);
            }
            let ok = results.iter().filter(|r| r.success).count();
            println!();
            println!("{}/{} download(s) succeeded", style(ok).bold(), results.len());
            Ok(())
        }
    }
}

fn print_result_line(result: &DownloadResult) {
    if result.success {
        let path = result
            .file_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        if result.from_cache {
            println!(
                "{} {} (cached, {})",
                style("✓").green().bold(),
                style(path).cyan(),
                format_bytes(result.file_size)
            );
        } else {
            println!(
                "{} {} ({} in {}, {}, {} retr{})",
                style("✓").green().bold(),
                style(path).cyan(),
                format_bytes(result.file_size),
                format_duration(result.duration),
                format_speed(result.speed),
                result.retries_used,
                if result.retries_used == 1 { "y" } else { "ies" }
            );
        }
    } else {
        println!(
            "{} {}: {}",
            style("✗").red().bold(),
            result.task.url,
            result.error.as_deref().unwrap_or("Unknown error")
        );
    }
}

pub fn print_metrics(snapshot: &MetricsSnapshot, format: OutputFormat) -> anyhow::Result<()> {
    let metrics = &snapshot.metrics;
    match format {
        // Results already went to stdout; keep it a single JSON document
        OutputFormat::Json => Ok(()),
        OutputFormat::Table => {
            let rows = [
                SettingRow::new("downloads", metrics.total_downloads),
                SettingRow::new("successful", metrics.successful_downloads),
                SettingRow::new("failed", metrics.failed_downloads),
                SettingRow::new("bytes", format_bytes(metrics.total_bytes)),
                SettingRow::new("time", format_duration(metrics.total_time)),
                SettingRow::new("avg speed", format_speed(metrics.avg_speed)),
                SettingRow::new("peak concurrent", metrics.peak_concurrent),
                SettingRow::new("failed attempts", metrics.retry_count),
                SettingRow::new("queued", snapshot.queue_depth.total()),
            ];
            eprintln!("{}", Table::new(rows));
            Ok(())
        }
        OutputFormat::Human => {
            if metrics.total_downloads == 0 {
                return Ok(());
            }
            eprintln!(
                "{} {} downloaded, {} ok / {} failed, avg {}, peak {} concurrent, {} failed attempt(s)",
                style("Σ").dim(),
                format_bytes(metrics.total_bytes),
                metrics.successful_downloads,
                metrics.failed_downloads,
                format_speed(metrics.avg_speed),
                metrics.peak_concurrent,
                metrics.retry_count
            );
            Ok(())
        }
    }
}

pub fn print_config(config: &EngineConfig, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json | OutputFormat::Human => print_json(config),
        OutputFormat::Table => {
            let value = serde_json::to_value(config)?;
            let rows: Vec<SettingRow> = value
                .as_object()
                .map(|map| map.iter().map(|(k, v)| SettingRow::new(k, v)).collect())
                .unwrap_or_default();
            println!("{}", Table::new(rows));
            Ok(())
        }
    }
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format speed as human-readable
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec))
}

/// Format duration as human-readable
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    if seconds == 0 {
        return format!("{}ms", duration.as_millis());
    }

    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() > max {
        let head: String = value.chars().take(max - 3).collect();
        format!("{}...", head)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }
}
