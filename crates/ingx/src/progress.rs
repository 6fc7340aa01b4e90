//! 📊 progress.rs: "Are we there yet?" Every pipeline, every time, forever.
//!
//! A spinner, a record count, a rate, and a running tally of accepted/failed.
//! Fed by the coordinator each time a batch resolves. Hidden when progress is off,
//! which includes every test, because nobody wants a spinner in their CI logs.
//!
//! ⚠️ Watching this spinner will not make it go faster. We've tried.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// 🔢 "1000000" → "1,000,000". You're welcome, eyes.
pub(crate) fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut result = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// 📊 The little spinner that could.
pub(crate) struct ProgressMetrics {
    bar: ProgressBar,
    records: u64,
    accepted: u64,
    failed: u64,
}

// -- 🎭 ProgressBar is a diva and doesn't derive Debug
impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressMetrics")
            .field("records", &self.records)
            .field("accepted", &self.accepted)
            .field("failed", &self.failed)
            .finish()
    }
}

impl ProgressMetrics {
    pub(crate) fn new(enabled: bool, label: &str) -> Self {
        let bar = if enabled {
            let bar = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan} {prefix} [{elapsed_precise}] {pos} records ({per_sec}) {msg}",
            ) {
                bar.set_style(style);
            }
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        } else {
            ProgressBar::hidden()
        };
        bar.set_prefix(label.to_string());
        Self { bar, records: 0, accepted: 0, failed: 0 }
    }

    /// 🔄 A batch resolved: `records` left the pipeline, `accepted` of them landed.
    pub(crate) fn update(&mut self, records: u64, accepted: u64) {
        self.records += records;
        self.accepted += accepted;
        self.failed += records.saturating_sub(accepted);
        self.bar.set_position(self.records);
        self.bar.set_message(format!(
            "✅ {} ⚠️ {}",
            format_number(self.accepted),
            format_number(self.failed)
        ));
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
