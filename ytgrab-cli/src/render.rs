//! Bus-event rendering: an indicatif multi-bar view for TTY sessions and
//! newline-delimited JSON for machine consumers.

use std::collections::HashMap;
use std::sync::Arc;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ytgrab_engine::{Event, EventPayload, ItemOutcome, LogLevel, OutcomeKind};

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// TTY progress renderer driven entirely by bus events.
pub struct TtyRenderer {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
    bar_style: ProgressStyle,
    spinner_style: ProgressStyle,
}

impl TtyRenderer {
    pub fn new() -> Self {
        let bar_style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:24.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} {bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
            bar_style,
            spinner_style,
        }
    }

    pub fn handle(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::Register { id, label, total } => {
                let bar = if *total > 0 {
                    let bar = ProgressBar::new(*total);
                    bar.set_style(self.bar_style.clone());
                    bar
                } else {
                    let bar = ProgressBar::new_spinner();
                    bar.set_style(self.spinner_style.clone());
                    bar
                };
                bar.set_message(label.clone());
                let bar = self.multi.add(bar);
                if let Some(previous) = self.bars.insert(id.clone(), bar) {
                    previous.finish_and_clear();
                }
            }
            EventPayload::Progress { id, current, total, .. } => {
                if let Some(bar) = self.bars.get(id) {
                    if let Some(total) = total {
                        bar.set_length(*total);
                    }
                    bar.set_position(*current);
                }
            }
            EventPayload::Finish { id } => {
                if let Some(bar) = self.bars.remove(id) {
                    bar.finish_and_clear();
                }
            }
            EventPayload::Log { level, message } => {
                let line = match level {
                    LogLevel::Error => format!("error: {message}"),
                    LogLevel::Warn => format!("warn: {message}"),
                    _ => message.clone(),
                };
                let _ = self.multi.println(line);
            }
            EventPayload::Duplicate { filename, .. } => {
                let _ = self
                    .multi
                    .println(format!("duplicate on disk: {filename}"));
            }
            EventPayload::Status { status, .. } => {
                let _ = self.multi.println(format!("job {status:?}").to_lowercase());
            }
            EventPayload::Done { stats, .. } => {
                if let Some(stats) = stats {
                    let _ = self.multi.println(format!(
                        "done: {} ok, {} failed, {} skipped",
                        stats.succeeded, stats.failed, stats.skipped
                    ));
                }
                for (_, bar) in self.bars.drain() {
                    bar.finish_and_clear();
                }
            }
            _ => {}
        }
    }

    pub fn println(&self, line: &str) {
        let _ = self.multi.println(line);
    }
}

impl Default for TtyRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Emit one bus event as a JSON line on stdout.
pub fn emit_json_event(event: &Event) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(err) => tracing::error!(error = %err, "failed to serialize event"),
    }
}

/// The batch-oriented per-item record emitted in JSON mode.
pub fn item_json(outcome: &ItemOutcome) -> serde_json::Value {
    let status = match outcome.outcome {
        OutcomeKind::Ok => "ok",
        OutcomeKind::Skipped => "skipped",
        OutcomeKind::Failed => "error",
    };
    let mut value = serde_json::json!({
        "type": "item",
        "status": status,
        "url": outcome.url,
        "bytes": outcome.bytes,
    });
    if let Some(output) = &outcome.output {
        value["output"] = serde_json::Value::String(output.display().to_string());
    }
    if let Some((_, message)) = &outcome.error {
        value["error"] = serde_json::Value::String(message.clone());
    }
    value
}

pub fn emit_json_item(outcome: &ItemOutcome) {
    println!("{}", item_json(outcome));
}

/// Wrapper so both renderers share one call site in the event loop.
pub enum Renderer {
    Tty(Box<TtyRenderer>),
    Json,
}

impl Renderer {
    pub fn handle(&mut self, event: &Arc<Event>) {
        match self {
            Renderer::Tty(tty) => tty.handle(event),
            Renderer::Json => emit_json_event(event),
        }
    }

    pub fn item(&mut self, outcome: &ItemOutcome) {
        match self {
            Renderer::Tty(_) => {}
            Renderer::Json => emit_json_item(outcome),
        }
    }
}
