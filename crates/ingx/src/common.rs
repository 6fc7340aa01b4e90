//! 📦 Common data structures: the building blocks of ingx.
//!
//! A CSV row walks in. It becomes a [`Record`]. Records ride together in a [`Batch`].
//! The backend looks at each one and hands back a [`SubmissionResult`]. That's the whole
//! cast. Everything else in this crate is stage direction.
//!
//! 🦆

use std::fmt;
use std::fmt::Write as _;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

// -- 🧮 per-field overhead in the serialized document: two pairs of quotes, a colon, a comma
const FIELD_OVERHEAD_BYTES: usize = 6;
// -- 🧮 the braces around the whole document
const DOCUMENT_OVERHEAD_BYTES: usize = 2;

/// 🎯 One row of the input file, frozen in time.
///
/// Fields keep the header's column order. Values are `None` when the cell is null.
/// The document id is computed once, at birth, and never changes: either the value of
/// the configured id column or a content hash of the normalized fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    row: u64,
    id: String,
    fields: Vec<(String, Option<String>)>,
}

impl Record {
    /// 🏗️ Build a record for source row `row` (1-based, header excluded).
    ///
    /// `id_field` names the column carrying an explicit document id. When that column is
    /// absent, null, or blank, the id falls back to [`content_hash`] so re-running the
    /// same file lands on the same documents instead of minting duplicates.
    pub fn new(row: u64, fields: Vec<(String, Option<String>)>, id_field: Option<&str>) -> Self {
        let explicit_id = id_field.and_then(|name| {
            fields
                .iter()
                .find(|(field, _)| field == name)
                .and_then(|(_, value)| value.as_deref())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
        });
        let id = explicit_id.unwrap_or_else(|| content_hash(&fields));
        Self { row, id, fields }
    }

    pub fn row(&self) -> u64 {
        self.row
    }

    /// 🔑 The target document id. Same input, same id. Always.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fields(&self) -> &[(String, Option<String>)] {
        &self.fields
    }

    /// 🔍 `None` if the column doesn't exist, `Some(None)` if it exists and is null.
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_deref())
    }

    /// 📏 Estimated serialized size: names + values + JSON punctuation.
    ///
    /// Doesn't account for escaping. A quote-heavy row will be a little bigger on the wire
    /// than this says. The batch limits are soft enough that nobody has cried about it yet.
    pub fn estimated_bytes(&self) -> usize {
        DOCUMENT_OVERHEAD_BYTES
            + self
                .fields
                .iter()
                .map(|(name, value)| {
                    name.len() + value.as_ref().map_or(4, String::len) + FIELD_OVERHEAD_BYTES
                })
                .sum::<usize>()
    }

    /// 📄 The document body as a JSON object. Null cells become JSON `null`.
    pub fn to_document(&self) -> Value {
        let mut document = Map::with_capacity(self.fields.len());
        for (name, value) in &self.fields {
            let json_value = match value {
                Some(text) => Value::String(text.clone()),
                None => Value::Null,
            };
            document.insert(name.clone(), json_value);
        }
        Value::Object(document)
    }
}

/// 🔐 SHA-256 over the normalized field values, hex encoded.
///
/// Normalization: fields sorted by name, every name and value written with its length in
/// front (`u64` little endian), values tagged 0 for null and 1 for present. No cell content
/// can pretend to be a boundary, and null never collides with "".
/// Column order in the file does not change the hash.
pub fn content_hash(fields: &[(String, Option<String>)]) -> String {
    let mut sorted: Vec<&(String, Option<String>)> = fields.iter().collect();
    sorted.sort_by(|(a, _), (b, _)| a.cmp(b));

    let mut hasher = Sha256::new();
    let mut chunk = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    };
    for (name, value) in sorted {
        chunk(name.as_bytes());
        match value {
            Some(text) => {
                chunk(&[1]);
                chunk(text.as_bytes());
            }
            None => chunk(&[0]),
        }
    }

    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        let _ = write!(hex, "{:02x}", byte);
    }
    hex
}

/// 🚦 Where a batch is in its short, eventful life.
///
/// `Pending → Submitting → {Complete, PartialFailure, Fatal}`. A `PartialFailure` batch
/// spawns a smaller batch for its retriable records, which starts back at `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum BatchState {
    Pending,
    Submitting,
    Complete,
    PartialFailure,
    Fatal,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Submitting => "SUBMITTING",
            Self::Complete => "COMPLETE",
            Self::PartialFailure => "PARTIAL_FAILURE",
            Self::Fatal => "FATAL",
        };
        f.write_str(label)
    }
}

/// 📦 A bounded, ordered group of records headed to the backend in one round trip.
#[derive(Debug, Clone)]
pub struct Batch {
    seq: u64,
    attempt: u32,
    records: Vec<Record>,
    bytes: usize,
}

impl Batch {
    /// 🏗️ A fresh batch on its first attempt.
    pub fn new(seq: u64, records: Vec<Record>) -> Self {
        Self::with_attempt(seq, 1, records)
    }

    pub(crate) fn with_attempt(seq: u64, attempt: u32, records: Vec<Record>) -> Self {
        let bytes = records.iter().map(Record::estimated_bytes).sum();
        Self { seq, attempt, records, bytes }
    }

    /// 🔄 The retry batch: same sequence number, next attempt, only the records that
    /// deserve another shot. Order is preserved.
    pub(crate) fn retry_with(&self, records: Vec<Record>) -> Self {
        Self::with_attempt(self.seq, self.attempt + 1, records)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// 1 on the first submission, 2 on the first retry, and so on.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.bytes
    }
}

/// 🎯 What the backend said about one record in one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionResult {
    /// ✅ Indexed. Done. Go home.
    Accepted,
    /// 🚫 The backend will never take this one (mapping conflict, bad value, ...).
    Rejected(String),
    /// 🔄 Not now, maybe later.
    Retriable(String),
}
