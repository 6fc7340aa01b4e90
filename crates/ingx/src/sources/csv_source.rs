//! 📂 Previously, on "Things That Could Go Wrong With A File"...
//!
//! The file didn't exist. The header had two columns called `name`. Row 40,112 had a
//! quoted newline in the middle of an address and one fewer comma than its siblings.
//! Somebody gzipped it "to save space" and renamed it `.csv.gz`.
//!
//! This module reads all of that. The `csv` crate does the quoting and the embedded
//! newlines; we do the schema checks and the gzip sniffing.
//!
//! 🚰 File → (GzDecoder) → csv::Reader → Schema → Record
//! 🦆

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use tracing::{debug, trace};

use crate::app_config::SourceConfig;
use crate::common::Record;
use crate::error::IngestError;
use crate::sources::Schema;

/// 📂 A CSV file, read one row at a time.
pub struct CsvSource {
    config: SourceConfig,
    reader: csv::Reader<Box<dyn Read + Send>>,
    schema: Schema,
    row: u64,
    scratch: csv::StringRecord,
    file_size: Option<u64>,
    exhausted: bool,
}

// 🐛 reader is a boxed trait object and has nothing interesting to say
impl std::fmt::Debug for CsvSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvSource")
            .field("file_name", &self.config.file_name)
            .field("header", &self.schema.header())
            .field("row", &self.row)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl CsvSource {
    /// 📂 Open the file, read the header, build the schema.
    ///
    /// Any failure here is `SourceUnavailable`: nothing has been read, nothing has been sent.
    pub fn open(config: &SourceConfig) -> Result<Self, IngestError> {
        let path = Path::new(&config.file_name);
        let unavailable = |reason: String| IngestError::SourceUnavailable {
            path: config.file_name.clone(),
            reason,
        };

        // 🔤 the csv reader speaks bytes; anything past ASCII would be silently chopped
        if !config.delimiter.is_ascii() {
            return Err(unavailable(format!(
                "delimiter {:?} is not a single ASCII character",
                config.delimiter
            )));
        }
        let delimiter = config.delimiter as u8;

        let file = File::open(path).map_err(|e| unavailable(e.to_string()))?;
        let file_size = file.metadata().ok().map(|m| m.len());

        let is_gzip = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));
        let raw: Box<dyn Read + Send> = if is_gzip {
            debug!("🫁 '{}' looks gzipped, decompressing on the fly", config.file_name);
            Box::new(GzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            // -- 📐 width checks are ours to make, so they can be per-row errors instead of fatal ones
            .flexible(true)
            .from_reader(raw);

        let header: Vec<String> = reader
            .headers()
            .map_err(|e| unavailable(format!("could not read header: {e}")))?
            .iter()
            .map(|name| name.trim().to_string())
            .collect();
        let schema = Schema::new(header, config).map_err(unavailable)?;

        debug!(
            "📂 Opened '{}' with {} column(s): {:?}",
            config.file_name,
            schema.header().len(),
            schema.header()
        );

        Ok(Self {
            config: config.clone(),
            reader,
            schema,
            row: 0,
            scratch: csv::StringRecord::new(),
            file_size,
            exhausted: false,
        })
    }

    /// 🔄 A brand new reader over the same file, starting from the top.
    pub fn reopen(&self) -> Result<Self, IngestError> {
        Self::open(&self.config)
    }

    /// 📏 On-disk size (compressed size for `.gz`), if the filesystem would tell us.
    pub fn file_size(&self) -> Option<u64> {
        self.file_size
    }
}

impl Iterator for CsvSource {
    type Item = Result<Record, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        match self.reader.read_record(&mut self.scratch) {
            Ok(false) => {
                trace!("🏁 '{}' exhausted after {} row(s)", self.config.file_name, self.row);
                self.exhausted = true;
                None
            }
            Ok(true) => {
                self.row += 1;
                let cells: Vec<&str> = self.scratch.iter().collect();
                Some(self.schema.record(self.row, cells.into_iter()))
            }
            Err(err) if err.is_io_error() => {
                // 💀 the disk (or the gzip stream) gave out mid-read; nothing after this is trustworthy
                self.exhausted = true;
                Some(Err(IngestError::SourceUnavailable {
                    path: self.config.file_name.clone(),
                    reason: err.to_string(),
                }))
            }
            Err(err) => {
                self.row += 1;
                Some(Err(IngestError::MalformedRecord {
                    row: self.row,
                    reason: err.to_string(),
                }))
            }
        }
    }
}
