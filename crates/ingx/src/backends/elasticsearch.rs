//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! 🎬 COLD OPEN: INT. SERVER ROOM: 3:47 AM
//!
//! The cluster is yellow. The bulk queue is full. Somewhere a 429 is being born.
//! Our hero has a CSV with 2.3 million rows and a deadline that was yesterday.
//! "I'll just bulk it in," they whispered. "It'll be fast," they said.
//!
//! 🚀 This module turns a [`Batch`] into one NDJSON `_bulk` request and turns the response
//! back into one [`SubmissionResult`] per record. Every action carries `_id`, so sending
//! the same rows twice overwrites instead of duplicating.
//!
//! Status triage, whole request:
//! - 2xx → look at each item
//! - 401 / 403 / 404 → fatal (credentials or index are wrong; retrying won't fix that)
//! - 408 / 429 / 5xx → transient, the whole batch goes around again
//! - anything else → fatal
//!
//! Status triage, per item: 2xx accepted, 429 / 5xx / `es_rejected_execution_exception`
//! retriable, everything else rejected.
//!
//! ⏱️ There is no client-wide request timeout. How long a `_bulk` call may take is the
//! worker's call (`runtime.submit_timeout_ms`), so the only clocks here are the connect
//! timeout and a short leash on the startup checks.
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use crate::app_config::{BulkOperation, ElasticsearchSinkConfig};
use crate::backends::Adapter;
use crate::common::{Batch, Record, SubmissionResult};
use crate::error::IngestError;

// -- ⏱️ we will wait, but not forever
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STARTUP_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

// 🐢 the thread pool said no, the item itself is fine; whatever status rode along with it
const QUEUE_FULL: &str = "es_rejected_execution_exception";

/// 📡 HTTP `_bulk` adapter.
///
/// Internally holds:
/// - `client`: the HTTP muscle 💪, reused across requests and shared by all workers
/// - `config`: URL, index, bulk operation and (redacted-on-print) credentials
#[derive(Debug)]
pub struct ElasticsearchAdapter {
    client: reqwest::Client,
    config: ElasticsearchSinkConfig,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<serde_json::Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

impl ElasticsearchAdapter {
    /// 🚀 Stand up the adapter and make sure there's something on the other end.
    ///
    /// 1. Build the `reqwest::Client` (10s connect, no overall request cap).
    /// 2. `GET /` to confirm the URL is real and the credentials work.
    /// 3. `GET /{index}` to confirm the index exists.
    ///
    /// Any failure is `FatalBackend`: nothing has been sent yet and nothing will be.
    pub async fn new(config: ElasticsearchSinkConfig) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                IngestError::FatalBackend(format!("💀 The HTTP client refused to be born: {e}"))
            })?;
        let adapter = Self { client, config };

        // -- 📡 "Hello? Is this thing on?": a developer, gesturing at a cluster.
        let ping = adapter
            .authorized(adapter.client.get(adapter.base_url()))
            .timeout(STARTUP_CHECK_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                IngestError::FatalBackend(format!(
                    "💀 Couldn't reach {} ({e}). Is the cluster running? Is the port right?",
                    adapter.base_url()
                ))
            })?;
        if !ping.status().is_success() {
            return Err(IngestError::FatalBackend(format!(
                "💀 {} answered the ping with {}. Check INGX_ES_* credentials.",
                adapter.base_url(),
                ping.status()
            )));
        }

        let index_url = format!("{}/{}", adapter.base_url(), adapter.config.index);
        let index_check = adapter
            .authorized(adapter.client.get(&index_url))
            .timeout(STARTUP_CHECK_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                IngestError::FatalBackend(format!("💀 Index check for '{index_url}' got ghosted: {e}"))
            })?;
        if !index_check.status().is_success() {
            return Err(IngestError::FatalBackend(format!(
                "💀 Index '{}' does not exist (or we can't see it): {}. Create it first, or check the spelling.",
                adapter.config.index,
                index_check.status()
            )));
        }
        debug!("✅ Index '{}' exists and is accepting visitors", adapter.config.index);

        Ok(adapter)
    }

    fn base_url(&self) -> &str {
        self.config.url.trim_end_matches('/')
    }

    /// 🔒 API key beats basic auth. This is not a democracy.
    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let credentials = &self.config.credentials;
        if let Some(api_key) = &credentials.api_key {
            request.header("Authorization", format!("ApiKey {api_key}"))
        } else if let Some(username) = &credentials.username {
            request.basic_auth(username, credentials.password.as_ref())
        } else {
            request
        }
    }

    /// 📄 Render a batch as an NDJSON `_bulk` body: one action line and one source line
    /// per record, each newline-terminated.
    pub(crate) fn render_bulk_body(&self, batch: &Batch) -> String {
        let mut body = String::with_capacity(batch.estimated_bytes() + batch.len() * 64);
        for record in batch.records() {
            let (action, source) = self.render_pair(record);
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&source.to_string());
            body.push('\n');
        }
        body
    }

    fn render_pair(&self, record: &Record) -> (Value, Value) {
        let target = json!({ "_index": self.config.index, "_id": record.id() });
        match self.config.operation {
            BulkOperation::Index => (json!({ "index": target }), record.to_document()),
            BulkOperation::Upsert => (
                json!({ "update": target }),
                json!({ "doc": record.to_document(), "doc_as_upsert": true }),
            ),
        }
    }

    /// 🔍 Map `_bulk` response items back onto the batch, in order.
    fn interpret_items(batch: &Batch, body: &str) -> Result<Vec<SubmissionResult>, IngestError> {
        let response: BulkResponse = serde_json::from_str(body).map_err(|e| {
            IngestError::FatalBackend(format!("💀 `_bulk` answered with something that isn't a bulk response: {e}"))
        })?;
        if response.items.len() != batch.len() {
            return Err(IngestError::FatalBackend(format!(
                "💀 Sent {} actions, got {} items back. The cluster and I are no longer speaking the same protocol.",
                batch.len(),
                response.items.len()
            )));
        }
        if response.errors {
            trace!(batch = batch.seq(), "⚠️ bulk response has item-level errors");
        }

        response
            .items
            .into_iter()
            .map(|item| {
                // 📦 each item is `{ "<action>": { ... } }`, one key, whichever action we sent
                let inner = item.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null);
                let item: BulkItem = serde_json::from_value(inner).map_err(|e| {
                    IngestError::FatalBackend(format!("💀 Unreadable bulk item: {e}"))
                })?;
                Ok(classify_item(item))
            })
            .collect()
    }
}

fn classify_item(item: BulkItem) -> SubmissionResult {
    if (200..300).contains(&item.status) {
        return SubmissionResult::Accepted;
    }
    let reason = item
        .error
        .as_ref()
        .map(describe_error)
        .unwrap_or_else(|| format!("status {}", item.status));
    let queue_full = item
        .error
        .as_ref()
        .and_then(|error| error.get("type"))
        .and_then(Value::as_str)
        == Some(QUEUE_FULL);
    if item.status == 429 || item.status >= 500 || queue_full {
        SubmissionResult::Retriable(reason)
    } else {
        SubmissionResult::Rejected(reason)
    }
}

/// 🏷️ `"type: reason"` from an ES error object, or the raw JSON when it has neither.
fn describe_error(error: &Value) -> String {
    match (error.get("type").and_then(Value::as_str), error.get("reason").and_then(Value::as_str)) {
        (Some(kind), Some(reason)) => format!("{kind}: {reason}"),
        (Some(kind), None) => kind.to_string(),
        _ => error.to_string(),
    }
}

#[async_trait]
impl Adapter for ElasticsearchAdapter {
    async fn submit(&self, batch: &Batch) -> Result<Vec<SubmissionResult>, IngestError> {
        let body = self.render_bulk_body(batch);
        debug!(
            batch = batch.seq(),
            attempt = batch.attempt(),
            bytes = body.len(),
            "📡 POST /_bulk with {} action(s)",
            batch.len()
        );

        let bulk_url = format!("{}/_bulk", self.base_url());
        let response = self
            .authorized(self.client.post(&bulk_url))
            // ⚠️ application/x-ndjson, not application/json. ES has opinions.
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                // 🔌 refused, reset, or the connect leash ran out: all worth another go
                let what = if e.is_timeout() { "timed out connecting" } else { "never arrived" };
                IngestError::TransientBackend(format!("bulk request {what}: {e}"))
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            IngestError::TransientBackend(format!("bulk response body got lost on the way back: {e}"))
        })?;

        match status.as_u16() {
            200..=299 => Self::interpret_items(batch, &text),
            401 | 403 | 404 => Err(IngestError::FatalBackend(format!("{status}: {text}"))),
            408 | 429 | 500..=599 => {
                warn!(batch = batch.seq(), "🔄 cluster pushed back with {status}");
                Err(IngestError::TransientBackend(format!("{status}: {text}")))
            }
            _ => Err(IngestError::FatalBackend(format!("{status}: {text}"))),
        }
    }
}
