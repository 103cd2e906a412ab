//! Extraction progress reporting.
//!
//! Reports how far a `facts run` has got: items done out of the total, the
//! id range of the batch just finalized, facts accepted, and an ETA.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for an extraction run.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// Run is about to read the corpus.
    Started {
        total: u64,
        start_after: i64,
        limit: Option<u64>,
    },
    /// A batch was finalized and checkpointed.
    BatchDone {
        first_id: i64,
        last_id: i64,
        done: u64,
        total: u64,
        accepted: u64,
        eta_secs: f64,
    },
    /// A batch failed and was skipped without advancing the checkpoint.
    BatchFailed {
        first_id: i64,
        last_id: i64,
        error: String,
    },
}

/// Reports extraction progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

const BAR_WIDTH: usize = 30;

/// Human-friendly progress on stderr:
/// `[progress] [#########.....] 1,234/5,000 (24.7%) | range 10-55 | +3 facts | ETA 4.2 min`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Started {
                total,
                start_after,
                limit,
            } => format!(
                "[progress] total={} | start_after={} | limit={}\n",
                format_number(*total),
                start_after,
                limit.map(format_number).unwrap_or_else(|| "none".to_string())
            ),
            ProgressEvent::BatchDone {
                first_id,
                last_id,
                done,
                total,
                accepted,
                eta_secs,
            } => {
                let done = (*done).min(*total);
                let pct = if *total > 0 {
                    done as f64 / *total as f64 * 100.0
                } else {
                    0.0
                };
                format!(
                    "[progress] {} {}/{} ({:.1}%) | range {}-{} | +{} facts | ETA {:.1} min\n",
                    progress_bar(done, *total),
                    format_number(done),
                    format_number(*total),
                    pct,
                    first_id,
                    last_id,
                    accepted,
                    eta_secs / 60.0
                )
            }
            ProgressEvent::BatchFailed {
                first_id,
                last_id,
                error,
            } => format!("[error] batch {}-{} failed: {}\n", first_id, last_id, error),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Started {
                total,
                start_after,
                limit,
            } => serde_json::json!({
                "event": "started",
                "total": total,
                "start_after": start_after,
                "limit": limit
            }),
            ProgressEvent::BatchDone {
                first_id,
                last_id,
                done,
                total,
                accepted,
                eta_secs,
            } => serde_json::json!({
                "event": "batch",
                "first_id": first_id,
                "last_id": last_id,
                "n": done,
                "total": total,
                "accepted": accepted,
                "eta_secs": eta_secs
            }),
            ProgressEvent::BatchFailed {
                first_id,
                last_id,
                error,
            } => serde_json::json!({
                "event": "batch_failed",
                "first_id": first_id,
                "last_id": last_id,
                "error": error
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn progress_bar(done: u64, total: u64) -> String {
    let filled = if total > 0 {
        ((BAR_WIDTH as f64 * done as f64 / total as f64) as usize).min(BAR_WIDTH)
    } else {
        0
    };
    format!("[{}{}]", "#".repeat(filled), ".".repeat(BAR_WIDTH - filled))
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
