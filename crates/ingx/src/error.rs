//! 💀 The error taxonomy: five flavors of "it didn't work", each with its own blast radius.
//!
//! Most of ingx talks `anyhow` (context chains, written with love, read at 3am).
//! But the coordinator has to *decide* things based on what went wrong: retry it,
//! skip it, or pull the fire alarm. So the errors that drive decisions get a real
//! enum, courtesy of `thiserror`.
//!
//! | variant             | blast radius                  |
//! |---------------------|-------------------------------|
//! | `SourceUnavailable` | run aborts before any submit  |
//! | `MalformedRecord`   | one row (skip) or run (abort) |
//! | `TransientBackend`  | one batch, retried            |
//! | `Timeout`           | same as `TransientBackend`    |
//! | `FatalBackend`      | run aborts                    |

use thiserror::Error;

/// 🏷️ Every failure the pipeline knows how to reason about.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// 📂 The input file is missing, unreadable, or has no header. Nothing was sent.
    #[error("💀 source unavailable: {path}: {reason}")]
    SourceUnavailable { path: String, reason: String },

    /// 🐛 A row that doesn't fit the schema the header promised.
    #[error("🐛 malformed record at row {row}: {reason}")]
    MalformedRecord { row: u64, reason: String },

    /// 🔄 The backend is having a moment (429, 503, connection reset). Try again later.
    #[error("🔄 transient backend error: {0}")]
    TransientBackend(String),

    /// 🚨 The backend will never accept this run (bad credentials, missing index).
    #[error("🚨 fatal backend error: {0}")]
    FatalBackend(String),

    /// ⏱️ `submit()` took longer than the configured timeout.
    #[error("⏱️ submission timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl IngestError {
    /// 🔄 Should the coordinator try this batch again?
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::TransientBackend(_) | Self::Timeout(_))
    }

    /// 🚨 Does this take the whole run down with it?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. } | Self::FatalBackend(_))
    }

    /// 🏷️ Short, stable name used as the failure reason in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "SourceUnavailable",
            Self::MalformedRecord { .. } => "MalformedRecord",
            Self::TransientBackend(_) => "TransientBackendError",
            Self::FatalBackend(_) => "FatalBackendError",
            Self::Timeout(_) => "Timeout",
        }
    }
}
