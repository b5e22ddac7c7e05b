//! Run summaries.
//!
//! Every run ends with a [`RunSummary`]: counts, prefixed warnings, new
//! evidence ids, and one outcome line per request that was considered.
//! It is printed to stdout and written as
//! `{case}/reports/_data_requests_run.json`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::write_atomic;

pub const RUN_REPORT_FILE: &str = "_data_requests_run.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Executed,
    /// The source failed and the degrade path recorded fallback evidence.
    Degraded,
    Skipped,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Executed => "executed",
            OutcomeStatus::Degraded => "degraded",
            OutcomeStatus::Skipped => "skipped",
            OutcomeStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestOutcome {
    pub request_id: String,
    pub connector: String,
    pub status: OutcomeStatus,
    /// One line. Empty for plain successes.
    pub reason: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub evidence_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Requests dispatched, whatever their outcome.
    pub executed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub degraded: usize,
    pub warnings: Vec<String>,
    /// Evidence ids recorded during the run, in order.
    pub evidence: Vec<String>,
    pub outcomes: Vec<RequestOutcome>,
}

impl RunSummary {
    pub fn outcome(&self, request_id: &str) -> Option<&RequestOutcome> {
        self.outcomes.iter().find(|o| o.request_id == request_id)
    }

    pub fn push(&mut self, outcome: RequestOutcome) {
        match outcome.status {
            OutcomeStatus::Executed => self.executed += 1,
            OutcomeStatus::Degraded => {
                self.executed += 1;
                self.degraded += 1;
            }
            OutcomeStatus::Failed => {
                self.executed += 1;
                self.failed += 1;
            }
            OutcomeStatus::Skipped => self.skipped += 1,
        }
        self.evidence.extend(outcome.evidence_ids.iter().cloned());
        self.outcomes.push(outcome);
    }
}

/// Write the summary into `reports_dir`, returning the file path.
pub fn write_report(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    std::fs::create_dir_all(reports_dir)
        .with_context(|| format!("cannot create {}", reports_dir.display()))?;
    let path = reports_dir.join(RUN_REPORT_FILE);
    let json = serde_json::to_vec_pretty(summary)?;
    write_atomic(&path, &json).with_context(|| format!("cannot write {}", path.display()))?;
    Ok(path)
}

pub fn print_summary(summary: &RunSummary) {
    println!(
        "run complete: executed={} skipped={} failed={} degraded={} evidence={}",
        summary.executed,
        summary.skipped,
        summary.failed,
        summary.degraded,
        summary.evidence.len()
    );
    if !summary.outcomes.is_empty() {
        println!();
        println!("  {:<28} {:<10} {:<9} {}", "REQUEST", "CONNECTOR", "STATUS", "REASON");
        println!("  {}", "-".repeat(76));
        for o in &summary.outcomes {
            println!(
                "  {:<28} {:<10} {:<9} {}",
                o.request_id,
                o.connector,
                o.status.as_str(),
                o.reason
            );
        }
    }
    if !summary.warnings.is_empty() {
        println!();
        println!("  Warnings:");
        for w in &summary.warnings {
            println!("  - {}", w);
        }
    }
}
