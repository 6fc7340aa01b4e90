//! 🧠 An in-memory source: a header and some rows, no disk required.
//!
//! Tests use it to feed the coordinator thousands of rows without writing fixture files.
//! Rows go through the same [`Schema`] checks as the CSV source, so a short row here is
//! just as malformed as a short row on disk.

use std::collections::VecDeque;

use crate::app_config::SourceConfig;
use crate::common::Record;
use crate::error::IngestError;
use crate::sources::Schema;

/// 📦 Rows in a `VecDeque`, handed out front to back.
#[derive(Debug)]
pub struct InMemorySource {
    schema: Schema,
    rows: VecDeque<Vec<String>>,
    row: u64,
}

impl InMemorySource {
    /// 🏗️ Build from a header and rows. The `file_name` in `config` is ignored.
    pub fn new(
        header: Vec<String>,
        rows: Vec<Vec<String>>,
        config: &SourceConfig,
    ) -> Result<Self, IngestError> {
        let schema = Schema::new(header, config).map_err(|reason| {
            IngestError::SourceUnavailable { path: "<memory>".to_string(), reason }
        })?;
        Ok(Self { schema, rows: rows.into(), row: 0 })
    }
}

impl Iterator for InMemorySource {
    type Item = Result<Record, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        let cells = self.rows.pop_front()?;
        self.row += 1;
        Some(self.schema.record(self.row, cells.iter().map(String::as_str)))
    }
}
