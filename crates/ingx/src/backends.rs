//! 🔌 Backends: where the real I/O happens.
//!
//! An adapter takes a [`Batch`] and comes back with one [`SubmissionResult`] per record,
//! in batch order. Or it comes back with an [`IngestError`] that speaks for the whole
//! batch: transient (retry everything) or fatal (stop the run).
//!
//! 🎭 The cast:
//! - [`ElasticsearchAdapter`]: NDJSON over HTTP to `_bulk`. The real one.
//! - [`InMemoryAdapter`]: a `BTreeMap` with a fault-injection habit. The test double.
//! - [`NoOpAdapter`]: logs the batch, accepts everything. The `--dry-run`.
//!
//! Adapters own their connections. The coordinator never touches the network directly;
//! it holds an `Arc<AdapterBackend>` and calls `submit`. Ancient proverb: "He who
//! hardcodes the backend, migrates only once." 🦆

use anyhow::Result;
use async_trait::async_trait;

use crate::app_config::SinkConfig;
use crate::common::{Batch, SubmissionResult};
use crate::error::IngestError;

pub mod elasticsearch;
pub mod in_mem;
pub mod noop;

pub use elasticsearch::ElasticsearchAdapter;
pub use in_mem::InMemoryAdapter;
pub use noop::NoOpAdapter;

/// 🕳️ The one capability every backend has: bulk-write a batch.
///
/// # Contract 📜
/// - `Ok(results)`: `results.len() == batch.len()`, `results[i]` is about `batch.records()[i]`.
/// - `Err(e)` with `e.is_retriable()`: nothing is known to have landed; every record may be retried.
/// - `Err(e)` with `e.is_fatal()`: the run cannot continue.
/// - `&self`, not `&mut self`: several workers may submit through one adapter at once.
#[async_trait]
pub trait Adapter: std::fmt::Debug + Send + Sync {
    async fn submit(&self, batch: &Batch) -> Result<Vec<SubmissionResult>, IngestError>;
}

/// 🎭 The many faces of an adapter. Dispatches `submit` to whoever is inside.
#[derive(Debug)]
pub enum AdapterBackend {
    Elasticsearch(ElasticsearchAdapter),
    InMemory(InMemoryAdapter),
    NoOp(NoOpAdapter),
}

impl AdapterBackend {
    /// 🏗️ Build the adapter a [`SinkConfig`] asks for.
    ///
    /// For Elasticsearch this also pings the cluster and checks the index exists, so a typo
    /// in the index name fails here instead of 10,000 documents in.
    pub async fn from_config(config: &SinkConfig) -> Result<Self, IngestError> {
        match config {
            SinkConfig::Elasticsearch(es_config) => {
                ElasticsearchAdapter::new(es_config.clone())
                    .await
                    .map(AdapterBackend::Elasticsearch)
            }
            SinkConfig::NoOp => Ok(AdapterBackend::NoOp(NoOpAdapter::default())),
        }
    }
}

#[async_trait]
impl Adapter for AdapterBackend {
    async fn submit(&self, batch: &Batch) -> Result<Vec<SubmissionResult>, IngestError> {
        match self {
            AdapterBackend::Elasticsearch(es) => es.submit(batch).await,
            AdapterBackend::InMemory(mem) => mem.submit(batch).await,
            AdapterBackend::NoOp(noop) => noop.submit(batch).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Record;

    #[tokio::test]
    async fn the_one_where_noop_config_builds_a_noop_adapter() {
        let adapter = AdapterBackend::from_config(&SinkConfig::NoOp)
            .await
            .expect("💀 noop should always build");
        assert!(matches!(adapter, AdapterBackend::NoOp(_)));

        let batch = Batch::new(
            1,
            vec![Record::new(1, vec![("id".into(), Some("a".into()))], Some("id"))],
        );
        let results = adapter.submit(&batch).await.expect("💀 noop accepts");
        assert_eq!(results, vec![SubmissionResult::Accepted]);
    }

    #[tokio::test]
    async fn the_one_where_enum_dispatch_reaches_the_in_memory_store() {
        let mem = InMemoryAdapter::new();
        let adapter = AdapterBackend::InMemory(mem.clone());
        let batch = Batch::new(
            1,
            vec![Record::new(1, vec![("id".into(), Some("a".into()))], Some("id"))],
        );
        adapter.submit(&batch).await.expect("💀 in-memory accepts");
        assert_eq!(mem.document_count(), 1);
    }
}
