//! Output helpers for the `notesync` binary.

use chrono::{DateTime, Utc};
use notesync_core::classifier::QueryKind;
use notesync_core::models::{SyncState, SyncTotals};
use notesync_core::pipeline::CycleOutcome;
use notesync_core::search::SearchResponse;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// `auto` (or empty) means classify the query.
pub fn parse_query_type(raw: &str) -> Result<Option<QueryKind>, String> {
    match raw.trim() {
        "" | "auto" => Ok(None),
        other => other.parse().map(Some),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub total_items: usize,
    pub items_per_group: BTreeMap<String, usize>,
    pub group_counts: BTreeMap<String, u64>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_full_scan: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_result: Option<SyncTotals>,
    /// Pid and start time of the process holding the sync lock, if any.
    pub lock_holder: Option<String>,
    /// Set when the stored state could not be read.
    pub state_error: Option<String>,
}

impl StatusReport {
    pub fn from_state(state: &SyncState, lock_holder: Option<String>) -> Self {
        Self {
            total_items: state.total_items(),
            items_per_group: state.items_per_group(),
            group_counts: state.group_counts.clone(),
            last_sync: state.last_sync,
            last_success: state.last_success,
            last_full_scan: state.last_full_scan,
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.clone(),
            last_result: state.last_result.clone(),
            lock_holder,
            state_error: None,
        }
    }

    pub fn unreadable(error: String, lock_holder: Option<String>) -> Self {
        Self {
            state_error: Some(error),
            ..Self::from_state(&SyncState::default(), lock_holder)
        }
    }
}

fn when(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string())
}

fn totals_line(t: &SyncTotals) -> String {
    format!(
        "added {}, modified {}, deleted {}, failed {}{}",
        t.added,
        t.modified,
        t.deleted,
        t.failed,
        if t.full_sync { " (full)" } else { "" }
    )
}

pub fn render_status(report: &StatusReport) -> String {
    let mut out = String::new();
    if let Some(err) = &report.state_error {
        let _ = writeln!(out, "state unreadable: {err}");
        let _ = writeln!(out, "the next sync will rebuild the index");
    }
    let _ = writeln!(out, "items indexed: {}", report.total_items);
    for (group, n) in &report.items_per_group {
        let _ = writeln!(out, "  {group}: {n}");
    }
    let _ = writeln!(out, "last sync: {}", when(report.last_sync));
    let _ = writeln!(out, "last success: {}", when(report.last_success));
    let _ = writeln!(out, "last full scan: {}", when(report.last_full_scan));
    if let Some(t) = &report.last_result {
        let _ = writeln!(out, "last result: {}", totals_line(t));
    }
    let _ = writeln!(out, "consecutive failures: {}", report.consecutive_failures);
    if let Some(err) = &report.last_error {
        let _ = writeln!(out, "last error: {err}");
    }
    match &report.lock_holder {
        Some(holder) => {
            let _ = writeln!(out, "lock: {holder}");
        }
        None => {
            let _ = writeln!(out, "lock: free");
        }
    }
    out
}

pub fn render_outcome(outcome: &CycleOutcome) -> String {
    match outcome {
        CycleOutcome::AlreadyRunning => "another sync is already running".to_string(),
        CycleOutcome::Skipped {
            reason,
            consecutive_failures,
        } => format!("skipped: {reason} ({consecutive_failures} consecutive failures)"),
        CycleOutcome::NoChanges { total_items } => {
            format!("no changes ({total_items} items)")
        }
        CycleOutcome::Synced(report) => {
            let mut line = format!("synced: {}", totals_line(&report.totals));
            if report.refreshed > 0 {
                let _ = write!(line, ", {} refreshed without re-embedding", report.refreshed);
            }
            for failure in &report.failures {
                let _ = write!(line, "\n  {failure}");
            }
            line
        }
        CycleOutcome::Failed {
            error,
            consecutive_failures,
        } => format!("failed: {error} ({consecutive_failures} consecutive failures)"),
    }
}

pub fn render_search(resp: &SearchResponse) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "query type: {} (freshness weight {:.2})",
        resp.profile.label, resp.profile.freshness_weight
    );
    if resp.results.is_empty() {
        let _ = writeln!(out, "no results");
        return out;
    }
    for (i, r) in resp.results.iter().enumerate() {
        let _ = writeln!(
            out,
            "{}. {} [{}] score {:.3} (similarity {:.3}, freshness {:.3})",
            i + 1,
            r.title,
            r.group,
            r.score,
            r.similarity,
            r.freshness
        );
        let _ = writeln!(out, "   modified {}  id {}", r.modified_at, r.id);
        if !r.preview.is_empty() {
            let _ = writeln!(out, "   {}", r.preview.replace('\n', " "));
        }
    }
    out
}
