//! 🪵 The no-op adapter: a dry run with excellent logging.

use async_trait::async_trait;
use tracing::info;

use crate::backends::Adapter;
use crate::common::{Batch, SubmissionResult};
use crate::error::IngestError;

/// 🪵 Accepts every record, sends nothing anywhere.
#[derive(Debug, Default)]
pub struct NoOpAdapter;

#[async_trait]
impl Adapter for NoOpAdapter {
    async fn submit(&self, batch: &Batch) -> Result<Vec<SubmissionResult>, IngestError> {
        let first = batch.records().first().map(|r| r.id()).unwrap_or("-");
        let last = batch.records().last().map(|r| r.id()).unwrap_or("-");
        info!(
            batch = batch.seq(),
            attempt = batch.attempt(),
            records = batch.len(),
            bytes = batch.estimated_bytes(),
            "🪵 dry run: would bulk-index ids {first}..{last}"
        );
        Ok(vec![SubmissionResult::Accepted; batch.len()])
    }
}
