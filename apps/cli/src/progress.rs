//! Progress bar utilities for CLI downloads

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use swiftdl_core::DownloadEngine;
use swiftdl_types::{file_name_from_url, CoreEvent, TaskId};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

/// Renders engine events as one progress bar per task
pub struct DownloadProgress {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl DownloadProgress {
    /// Start following the engine's event bus
    pub fn attach(engine: &DownloadEngine) -> Self {
        let rx = engine.subscribe();
        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(render(rx, stop_rx));
        Self { stop, handle }
    }

    /// Render events that are already queued, then stop
    pub async fn finish(self) {
        let _ = self.stop.send(());
        let _ = self.handle.await;
    }
}

async fn render(mut rx: broadcast::Receiver<CoreEvent>, mut stop: oneshot::Receiver<()>) {
    let mut bars = Bars::new();

    loop {
        tokio::select! {
            biased;
            event = rx.recv() => match event {
                Ok(event) => bars.handle_event(&event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            _ = &mut stop => {
                while let Ok(event) = rx.try_recv() {
                    bars.handle_event(&event);
                }
                break;
            }
        }
    }

    bars.clear();
}

struct Bars {
    multi: MultiProgress,
    bars: HashMap<TaskId, ProgressBar>,
}

impl Bars {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    fn handle_event(&mut self, event: &CoreEvent) {
        match event {
            CoreEvent::TaskQueued { id, url, .. } => {
                let pb = self.multi.add(ProgressBar::new(0));
                pb.set_style(bar_style());
                pb.set_message(file_name_from_url(url).unwrap_or_else(|| url.clone()));
                self.bars.insert(*id, pb);
            }

            CoreEvent::TaskProgress {
                id,
                downloaded,
                total,
            } => {
                if let Some(pb) = self.bars.get(id) {
                    if *total > 0 {
                        pb.set_length(*total);
                    }
                    pb.set_position(*downloaded);
                }
            }

            CoreEvent::TaskRetrying {
                id,
                attempt,
                delay_ms,
                error,
            } => {
                if let Some(pb) = self.bars.get(id) {
                    pb.set_position(0);
                    pb.println(format!(
                        "{} attempt {} in {}ms: {}",
                        style("↻").yellow(),
                        attempt + 1,
                        delay_ms,
                        error
                    ));
                }
            }

            CoreEvent::TaskCompleted { id, success, error, .. } => {
                if let Some(pb) = self.bars.remove(id) {
                    if *success {
                        pb.finish_with_message(format!("{} Download complete", style("✓").green().bold()));
                    } else {
                        pb.abandon_with_message(format!(
                            "{} Failed: {}",
                            style("✗").red().bold(),
                            error.as_deref().unwrap_or("Unknown error")
                        ));
                    }
                }
            }

            CoreEvent::TaskStarted { .. } => {}
        }
    }

    fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            pb.finish_and_clear();
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
        .map(|style| style.progress_chars("█▓▒░  "))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}
