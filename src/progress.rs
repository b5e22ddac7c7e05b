//! Run progress reporting.
//!
//! Reports per-request progress during `drq run` so users see which
//! request is being dispatched and how many are left. Progress is emitted
//! on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use serde_json::{json, Value};

/// A single progress event for a run.
#[derive(Clone, Debug)]
pub enum RunProgressEvent {
    /// Request `n` of `total` is being dispatched.
    Dispatching {
        request_id: String,
        connector: String,
        n: u64,
        total: u64,
    },
    /// Request finished with a status label (`executed`, `degraded`, ...).
    Finished { request_id: String, status: String },
}

impl RunProgressEvent {
    fn human_line(&self) -> String {
        match self {
            RunProgressEvent::Dispatching {
                request_id,
                connector,
                n,
                total,
            } => {
                let width = total.to_string().len();
                format!("run [{:>width$}/{}] {} ({})", n, total, request_id, connector)
            }
            RunProgressEvent::Finished { request_id, status } => {
                format!("run {} -> {}", request_id, status)
            }
        }
    }

    fn json_value(&self) -> Value {
        match self {
            RunProgressEvent::Dispatching {
                request_id,
                connector,
                n,
                total,
            } => json!({
                "event": "dispatching",
                "request_id": request_id,
                "connector": connector,
                "n": n,
                "total": total
            }),
            RunProgressEvent::Finished { request_id, status } => json!({
                "event": "finished",
                "request_id": request_id,
                "status": status
            }),
        }
    }
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait RunProgressReporter: Send + Sync {
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr: "run [ 3/12] REQ-KMA-ASOS (KMA_ASOS)".
pub struct StderrProgress;

impl RunProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", event.human_line());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RunProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", event.json_value());
        let _ = err.flush();
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RunProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

/// How `drq run` reports progress.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn RunProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
