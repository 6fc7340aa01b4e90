//! 📋 The IngestionReport: the receipt at the end of the run.
//!
//! It only ever goes up: counts grow, failures append. It's finalized once, when the
//! coordinator is done, and it is *always* produced. Aborted runs, cancelled runs, runs
//! where the file didn't exist: they all get a report. Nobody leaves without a receipt.
//!
//! Counting rules:
//! - `submitted`: distinct records handed to the backend at least once
//! - `accepted`: records the backend took
//! - `rejected`: records refused for good, by the backend or by the schema (`malformed` ⊆ `rejected`)
//! - `retried`: resubmissions; a record sent three times adds 2
//! - `failed`: records still retriable when retries ran out (or were cut short)
//! - `abandoned`: records read from the source but never submitted (abort or cancel)

use std::fmt;
use std::time::Duration;

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL};
use serde::Serialize;

/// 🏷️ Why a record ended up on the wall of shame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    MalformedRecord,
    Rejected,
    RetriesExhausted,
    Cancelled,
    Interrupted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 🪦 One record that didn't make it, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalFailure {
    pub row: u64,
    /// `None` for malformed rows; they never got far enough to have an id.
    pub id: Option<String>,
    pub kind: FailureKind,
    pub reason: String,
}

/// 🏁 How the run ended, in one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    /// ✅ Everything that could be indexed was.
    Complete,
    /// ⚠️ Finished, but some records are still failed after retries or were refused.
    PartialFailure,
    /// 🛑 Someone pulled the plug.
    Cancelled,
    /// 🚨 A run-level error stopped everything.
    Aborted,
}

/// 📋 Cumulative counts plus the first few terminal failures.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub submitted: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub malformed: u64,
    pub retried: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub batches: u64,
    /// The first `max_reported_failures` terminal failures, in the order they happened.
    pub failures: Vec<TerminalFailure>,
    /// Every terminal failure, including the ones not listed.
    pub failures_total: u64,
    pub aborted: Option<String>,
    pub cancelled: bool,
    pub elapsed_ms: u64,
    #[serde(skip)]
    max_reported_failures: usize,
}

impl IngestionReport {
    pub fn new(max_reported_failures: usize) -> Self {
        Self {
            submitted: 0,
            accepted: 0,
            rejected: 0,
            malformed: 0,
            retried: 0,
            failed: 0,
            abandoned: 0,
            batches: 0,
            failures: Vec::new(),
            failures_total: 0,
            aborted: None,
            cancelled: false,
            elapsed_ms: 0,
            max_reported_failures,
        }
    }

    /// 🪦 Count a terminal failure in the right bucket and list it if there's room.
    pub(crate) fn record_failure(&mut self, failure: TerminalFailure) {
        match failure.kind {
            FailureKind::MalformedRecord => {
                self.malformed += 1;
                self.rejected += 1;
            }
            FailureKind::Rejected => self.rejected += 1,
            FailureKind::RetriesExhausted | FailureKind::Cancelled | FailureKind::Interrupted => {
                self.failed += 1
            }
        }
        self.failures_total += 1;
        if self.failures.len() < self.max_reported_failures {
            self.failures.push(failure);
        }
    }

    /// 🚨 First abort reason wins; later ones are just echoes.
    pub(crate) fn abort(&mut self, reason: impl Into<String>) {
        if self.aborted.is_none() {
            self.aborted = Some(reason.into());
        }
    }

    pub(crate) fn finish(&mut self, elapsed: Duration) {
        self.elapsed_ms = elapsed.as_millis().try_into().unwrap_or(u64::MAX);
    }

    pub fn status(&self) -> RunStatus {
        if self.aborted.is_some() {
            RunStatus::Aborted
        } else if self.cancelled {
            RunStatus::Cancelled
        } else if self.failed > 0 || self.rejected > self.malformed {
            RunStatus::PartialFailure
        } else {
            RunStatus::Complete
        }
    }

    /// 🚪 0 = all good (skipped malformed rows don't count against you), 1 = aborted,
    /// 2 = finished with failures left over, or cancelled.
    pub fn exit_code(&self) -> i32 {
        match self.status() {
            RunStatus::Complete => 0,
            RunStatus::Aborted => 1,
            RunStatus::PartialFailure | RunStatus::Cancelled => 2,
        }
    }

    /// 🍽️ The comfy table version, for humans.
    pub fn render_table(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["📋 ingestion report", ""]);

        let mut row = |label: &str, value: String| {
            table.add_row(vec![
                Cell::new(label),
                Cell::new(value).set_alignment(CellAlignment::Right),
            ]);
        };
        row("status", format!("{:?}", self.status()));
        row("submitted", self.submitted.to_string());
        row("accepted", self.accepted.to_string());
        row("rejected", self.rejected.to_string());
        row("  of which malformed", self.malformed.to_string());
        row("retried", self.retried.to_string());
        row("failed after retries", self.failed.to_string());
        row("abandoned", self.abandoned.to_string());
        row("batches", self.batches.to_string());
        row("elapsed", format!("{:.2}s", self.elapsed_ms as f64 / 1000.0));
        if let Some(reason) = &self.aborted {
            row("aborted", reason.clone());
        }

        let mut out = table.to_string();
        if !self.failures.is_empty() {
            let mut failures = Table::new();
            failures
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["row", "id", "kind", "reason"]);
            for failure in &self.failures {
                failures.add_row(vec![
                    Cell::new(failure.row),
                    Cell::new(failure.id.as_deref().unwrap_or("-")),
                    Cell::new(failure.kind),
                    Cell::new(&failure.reason),
                ]);
            }
            out.push('\n');
            out.push_str(&failures.to_string());
            let unlisted = self.failures_total.saturating_sub(self.failures.len() as u64);
            if unlisted > 0 {
                out.push_str(&format!("\n… and {unlisted} more failure(s) not listed"));
            }
        }
        out
    }
}

impl fmt::Display for IngestionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_table())
    }
}
