//! 🚰 Sources: where records are born.
//!
//! A source is a lazy, finite, forward-only stream of `Result<Record, IngestError>`.
//! It's an [`Iterator`], because that's what a lazy, finite, forward-only stream is.
//! Reading never suspends; only the backend gets to make us wait.
//!
//! 🧠 Pattern: concrete impls ([`CsvSource`], [`InMemorySource`]) → [`SourceBackend`] enum.
//! The coordinator holds a `SourceBackend` and never asks which one it is.
//!
//! The header defines the schema. Every row after it must match in width, and every
//! `required_fields` column must be non-null. Rows that don't make the cut come out as
//! `Err(MalformedRecord)` and the stream carries on; whether the run carries on too is
//! the coordinator's call.

use std::collections::HashSet;

use crate::app_config::SourceConfig;
use crate::common::Record;
use crate::error::IngestError;

pub mod csv_source;
pub mod in_mem_source;

pub use csv_source::CsvSource;
pub use in_mem_source::InMemorySource;

/// 📐 The shape every row has to fit, derived from the header and the source config.
#[derive(Debug, Clone)]
pub(crate) struct Schema {
    header: Vec<String>,
    id_field: Option<String>,
    required_fields: Vec<String>,
    empty_as_null: bool,
}

impl Schema {
    /// 📐 Build a schema from a header row. Blank or duplicate column names are refused,
    /// and so is a required field the header doesn't have.
    pub(crate) fn new(header: Vec<String>, config: &SourceConfig) -> Result<Self, String> {
        if header.is_empty() {
            return Err("header row is empty".to_string());
        }
        let mut seen = HashSet::new();
        for name in &header {
            if name.trim().is_empty() {
                return Err("header contains a blank column name".to_string());
            }
            if !seen.insert(name.as_str()) {
                return Err(format!("header contains duplicate column '{name}'"));
            }
        }
        if let Some(missing) = config.required_fields.iter().find(|f| !seen.contains(f.as_str())) {
            return Err(format!("required field '{missing}' is not in the header"));
        }
        Ok(Self {
            header,
            id_field: config.id_field.clone(),
            required_fields: config.required_fields.clone(),
            empty_as_null: config.empty_as_null,
        })
    }

    pub(crate) fn header(&self) -> &[String] {
        &self.header
    }

    /// 🏗️ Turn one row of raw cells into a [`Record`], or explain why not.
    pub(crate) fn record<'a>(
        &self,
        row: u64,
        cells: impl ExactSizeIterator<Item = &'a str>,
    ) -> Result<Record, IngestError> {
        let width = cells.len();
        if width != self.header.len() {
            let reason = if width < self.header.len() {
                format!("expected {} fields, found {} (missing fields)", self.header.len(), width)
            } else {
                format!("expected {} fields, found {} (extra fields)", self.header.len(), width)
            };
            return Err(IngestError::MalformedRecord { row, reason });
        }

        let fields: Vec<(String, Option<String>)> = self
            .header
            .iter()
            .zip(cells)
            .map(|(name, cell)| {
                let value = if self.empty_as_null && cell.is_empty() {
                    None
                } else {
                    Some(cell.to_string())
                };
                (name.clone(), value)
            })
            .collect();

        for required in &self.required_fields {
            let is_null = fields
                .iter()
                .any(|(name, value)| name == required && value.is_none());
            if is_null {
                return Err(IngestError::MalformedRecord {
                    row,
                    reason: format!("required field '{required}' is missing"),
                });
            }
        }

        Ok(Record::new(row, fields, self.id_field.as_deref()))
    }
}

/// 🎭 The many faces of a source. Universal remote, one button: `next()`.
#[derive(Debug)]
pub enum SourceBackend {
    Csv(CsvSource),
    InMemory(InMemorySource),
}

impl SourceBackend {
    /// 📂 Open the configured CSV file from the top.
    ///
    /// Calling this again on the same config is how you "restart" a source: a fresh
    /// reader at offset 0. Mid-stream rewinds are not a thing.
    pub fn open(config: &SourceConfig) -> Result<Self, IngestError> {
        CsvSource::open(config).map(SourceBackend::Csv)
    }

    /// 📊 Total input size in bytes when known. Feeds the progress bar.
    pub fn size_hint_bytes(&self) -> Option<u64> {
        match self {
            SourceBackend::Csv(csv) => csv.file_size(),
            SourceBackend::InMemory(_) => None,
        }
    }
}

impl Iterator for SourceBackend {
    type Item = Result<Record, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            SourceBackend::Csv(csv) => csv.next(),
            SourceBackend::InMemory(mem) => mem.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(header: &[&str], required: &[&str]) -> Schema {
        let mut config = SourceConfig::for_file("unused.csv");
        config.required_fields = required.iter().map(|s| s.to_string()).collect();
        Schema::new(header.iter().map(|s| s.to_string()).collect(), &config)
            .expect("💀 schema should build")
    }

    #[test]
    fn the_one_where_a_row_fits_the_schema() {
        let schema = schema(&["id", "name", "city"], &[]);
        let record = schema
            .record(1, ["7", "Ada", ""].into_iter())
            .expect("💀 row should fit");
        assert_eq!(record.id(), "7");
        assert_eq!(record.get("city"), Some(None));
        assert_eq!(record.get("name"), Some(Some("Ada")));
    }

    #[test]
    fn the_one_where_short_and_long_rows_are_flagged() {
        let schema = schema(&["id", "name"], &[]);
        let short = schema.record(4, ["1"].into_iter()).unwrap_err();
        let long = schema.record(5, ["1", "a", "b"].into_iter()).unwrap_err();
        assert!(matches!(short, IngestError::MalformedRecord { row: 4, .. }));
        assert!(matches!(long, IngestError::MalformedRecord { row: 5, ref reason } if reason.contains("extra")));
    }

    #[test]
    fn the_one_where_a_required_field_goes_missing() {
        let schema = schema(&["id", "email"], &["email"]);
        let err = schema.record(9, ["1", ""].into_iter()).unwrap_err();
        assert_eq!(
            err,
            IngestError::MalformedRecord {
                row: 9,
                reason: "required field 'email' is missing".into()
            }
        );
    }

    #[test]
    fn the_one_where_a_bad_header_is_refused_up_front() {
        let config = SourceConfig::for_file("x.csv");
        assert!(Schema::new(vec!["a".into(), "a".into()], &config).is_err());
        assert!(Schema::new(vec![], &config).is_err());

        let mut strict = SourceConfig::for_file("x.csv");
        strict.required_fields = vec!["email".into()];
        assert!(Schema::new(vec!["id".into()], &strict).is_err());
    }
}
