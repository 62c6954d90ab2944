//! Console rendering of pipeline events
//!
//! Subscribes to the orchestrator's broadcast channel and prints one line per
//! meaningful event. Repeated progress percentages are collapsed.

use std::time::Instant;

use console::style;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use super::ui::describe;
use crate::pipeline::{PipelineEvent, Stage};

pub struct ConsoleRenderer {
    started: Instant,
    show_chunks: bool,
    last_progress: Option<(Stage, u8)>,
}

impl ConsoleRenderer {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            show_chunks: false,
            last_progress: None,
        }
    }

    /// Echo streamed text as it arrives
    pub fn with_chunks(mut self, show: bool) -> Self {
        self.show_chunks = show;
        self
    }

    /// Render one event; `None` when there is nothing new to show
    pub fn render(&mut self, event: &PipelineEvent) -> Option<String> {
        match event {
            PipelineEvent::StageChanged { from, to } => {
                self.last_progress = None;
                Some(format!(
                    "{} {} → {} {}",
                    style("▶").cyan(),
                    from,
                    style(to).bold(),
                    style(format!("({})", format_duration(self.started.elapsed().as_secs()))).dim()
                ))
            }
            PipelineEvent::Progress { stage, percent, step } => {
                if self.last_progress == Some((*stage, *percent)) {
                    return None;
                }
                self.last_progress = Some((*stage, *percent));
                let step = step.as_deref().map(|s| format!(" {}", s)).unwrap_or_default();
                Some(format!(
                    "  {} {} {:>3}%{}",
                    stage,
                    render_progress_bar(*percent as usize, 100, 30),
                    percent,
                    style(step).dim()
                ))
            }
            PipelineEvent::Chunk { content, .. } => {
                (self.show_chunks && !content.is_empty()).then(|| format!("  {} {}", style("│").dim(), content))
            }
            PipelineEvent::Reconnecting { stage, attempt } => Some(format!(
                "  {} {} stream lost, reconnecting (attempt {})",
                style("⚠").yellow(),
                stage,
                attempt
            )),
            PipelineEvent::Error { stage, error } => Some(format!("  {} during {}", describe(error), stage)),
        }
    }

    /// Print events until the channel closes or the task is aborted
    pub fn spawn(mut self, mut events: broadcast::Receiver<PipelineEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(line) = self.render(&event) {
                            println!("{}", line);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Console fell behind pipeline events"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for ConsoleRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a simple progress bar
fn render_progress_bar(completed: usize, total: usize, width: usize) -> String {
    if total == 0 {
        return format!("[{}]", " ".repeat(width));
    }

    let progress = (completed as f32 / total as f32).min(1.0);
    let filled = (progress * width as f32) as usize;
    let empty = width.saturating_sub(filled);

    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}

/// Format duration as human-readable string
pub fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorClassifier, codes};

    fn plain(line: Option<String>) -> String {
        console::strip_ansi_codes(&line.unwrap()).to_string()
    }

    #[test]
    fn test_progress_bar_render() {
        assert_eq!(render_progress_bar(0, 10, 10), "[░░░░░░░░░░]");
        assert_eq!(render_progress_bar(5, 10, 10), "[█████░░░░░]");
        assert_eq!(render_progress_bar(10, 10, 10), "[██████████]");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3700), "1h 1m");
    }

    #[test]
    fn test_repeated_progress_is_collapsed() {
        let mut renderer = ConsoleRenderer::new();
        let event = PipelineEvent::Progress {
            stage: Stage::Analysis,
            percent: 40,
            step: Some("upload".to_string()),
        };

        let line = plain(renderer.render(&event));
        assert!(line.contains("40%"));
        assert!(line.ends_with("upload"));
        assert!(renderer.render(&event).is_none());

        renderer.render(&PipelineEvent::StageChanged {
            from: Stage::Input,
            to: Stage::Analysis,
        });
        assert!(renderer.render(&event).is_some());
    }

    #[test]
    fn test_chunks_hidden_by_default() {
        let chunk = PipelineEvent::Chunk {
            stage: Stage::Cases,
            content: "TC-001".to_string(),
        };
        assert!(ConsoleRenderer::new().render(&chunk).is_none());
        assert!(plain(ConsoleRenderer::new().with_chunks(true).render(&chunk)).contains("TC-001"));
    }

    #[test]
    fn test_error_line_names_stage() {
        let mut renderer = ConsoleRenderer::new();
        let line = plain(renderer.render(&PipelineEvent::Error {
            stage: Stage::Code,
            error: ErrorClassifier::classify(codes::LLM_API_ERROR, Some(502)),
        }));
        assert!(line.contains("[LLM_API_ERROR]"));
        assert!(line.ends_with("during code"));
    }
}
