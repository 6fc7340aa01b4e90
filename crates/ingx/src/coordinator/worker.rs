//! 🎬 *[a channel fills with batches. somewhere, a search cluster sighs.]*
//!
//! 🧵 The BatchWorker takes one batch at a time off the channel and sees it through to the
//! end: submit, sort the per-record verdicts, back off, resubmit the stragglers, repeat
//! until nothing is left or the attempts run out. Then it reports back with a
//! [`BatchResolution`] and goes to get the next one.
//!
//! It never reads the source and never touches the report. It only submits, and it
//! tells the coordinator exactly what happened to every record it was handed.
//!
//! ⚠️ Every record in the batch comes back accounted for: accepted, a terminal failure,
//! or abandoned. If that ever stops being true, the debug build will say so loudly.
//! Even a panic mid-batch sends a resolution: the coordinator would otherwise wait forever.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::Worker;
use crate::app_config::RuntimeConfig;
use crate::backends::{Adapter, AdapterBackend};
use crate::common::{Batch, BatchState, Record, SubmissionResult};
use crate::error::IngestError;
use crate::report::{FailureKind, TerminalFailure};

/// 📬 What became of one batch, sent back to the coordinator.
#[derive(Debug)]
pub(crate) struct BatchResolution {
    pub(crate) seq: u64,
    /// Every id the batch carried, so the accumulator can unblock them.
    pub(crate) ids: Vec<String>,
    /// Records handed to the backend at least once.
    pub(crate) submitted: u64,
    /// Resubmissions, summed over every retry.
    pub(crate) retried: u64,
    pub(crate) accepted: u64,
    pub(crate) failures: Vec<TerminalFailure>,
    /// Records the worker never got to submit because the run was already halting.
    pub(crate) abandoned: u64,
    pub(crate) state: BatchState,
    /// Set when the backend said the run can't go on.
    pub(crate) fatal: Option<IngestError>,
}

impl BatchResolution {
    fn new(batch: &Batch) -> Self {
        Self {
            seq: batch.seq(),
            ids: batch.records().iter().map(|r| r.id().to_string()).collect(),
            submitted: 0,
            retried: 0,
            accepted: 0,
            failures: Vec::new(),
            abandoned: 0,
            state: BatchState::Pending,
            fatal: None,
        }
    }

    /// 🧮 Records this resolution accounts for. Must equal the batch size.
    pub(crate) fn resolved(&self) -> u64 {
        self.accepted + self.failures.len() as u64 + self.abandoned
    }

    /// 🧯 The batch blew up mid-flight. Nobody knows which records landed, so every one of
    /// them is interrupted and the run goes down with it.
    fn panicked(seq: u64, ledger: Vec<(u64, String)>, reason: &str) -> Self {
        let failures = ledger
            .iter()
            .map(|(row, id)| TerminalFailure {
                row: *row,
                id: Some(id.clone()),
                kind: FailureKind::Interrupted,
                reason: reason.to_string(),
            })
            .collect();
        Self {
            seq,
            ids: ledger.into_iter().map(|(_, id)| id).collect(),
            submitted: 0,
            retried: 0,
            accepted: 0,
            failures,
            abandoned: 0,
            state: BatchState::Fatal,
            fatal: Some(IngestError::FatalBackend(reason.to_string())),
        }
    }

    fn fail_all<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a Record>,
        kind: FailureKind,
        reason: &str,
    ) {
        for record in records {
            self.failures.push(TerminalFailure {
                row: record.row(),
                id: Some(record.id().to_string()),
                kind,
                reason: reason.to_string(),
            });
        }
    }
}

/// 🧵 Drains batches, submits them with retries, reports back.
#[derive(Debug)]
pub(crate) struct BatchWorker {
    id: usize,
    rx: Receiver<Batch>,
    tx: Sender<BatchResolution>,
    adapter: Arc<AdapterBackend>,
    runtime: RuntimeConfig,
    /// 🛑 The user's cancel: finish the current submission, retry nothing.
    cancel: CancellationToken,
    /// 🚨 Cancelled on user cancel *and* on run abort: submit nothing new.
    halt: CancellationToken,
}

impl BatchWorker {
    pub(crate) fn new(
        id: usize,
        rx: Receiver<Batch>,
        tx: Sender<BatchResolution>,
        adapter: Arc<AdapterBackend>,
        runtime: RuntimeConfig,
        cancel: CancellationToken,
        halt: CancellationToken,
    ) -> Self {
        Self { id, rx, tx, adapter, runtime, cancel, halt }
    }

    // -- 🏷️ records cut short get a different label depending on who pulled the plug
    fn cut_short(&self) -> (FailureKind, &'static str) {
        if self.cancel.is_cancelled() {
            (FailureKind::Cancelled, "run cancelled before the record could be retried")
        } else {
            (FailureKind::Interrupted, "run aborted before the record could be retried")
        }
    }

    /// 🔄 One submission, bounded by the per-submission timeout. A timeout is just
    /// another transient failure.
    async fn submit_once(&self, batch: &Batch) -> Result<Vec<SubmissionResult>, IngestError> {
        let limit = self.runtime.submit_timeout();
        let results = tokio::time::timeout(limit, self.adapter.submit(batch))
            .await
            .unwrap_or(Err(IngestError::Timeout(limit)))?;
        if results.len() != batch.len() {
            return Err(IngestError::FatalBackend(format!(
                "backend answered {} results for {} records",
                results.len(),
                batch.len()
            )));
        }
        Ok(results)
    }

    /// 🎯 See one batch through to the end.
    pub(crate) async fn process(&self, batch: Batch) -> BatchResolution {
        let mut resolution = BatchResolution::new(&batch);
        let seq = batch.seq();

        if self.halt.is_cancelled() {
            debug!(worker = self.id, batch = seq, records = batch.len(), "🛑 halted, batch abandoned");
            resolution.abandoned = batch.len() as u64;
            return resolution;
        }
        resolution.submitted = batch.len() as u64;

        let mut current = batch;
        loop {
            let attempt = current.attempt();
            debug!(
                worker = self.id,
                batch = seq,
                attempt,
                records = current.len(),
                bytes = current.estimated_bytes(),
                from = %BatchState::Pending,
                to = %BatchState::Submitting,
                "📤 submitting batch"
            );

            let results = match self.submit_once(&current).await {
                Ok(results) => results,
                Err(err) if err.is_retriable() => {
                    let reason = SubmissionResult::Retriable(err.to_string());
                    vec![reason; current.len()]
                }
                Err(err) => {
                    error!(
                        worker = self.id,
                        batch = seq,
                        attempt,
                        kind = err.kind(),
                        to = %BatchState::Fatal,
                        "🚨 {err}"
                    );
                    resolution.fail_all(current.records(), FailureKind::Interrupted, &err.to_string());
                    resolution.state = BatchState::Fatal;
                    resolution.fatal = Some(err);
                    break;
                }
            };

            let mut retry: Vec<Record> = Vec::new();
            let mut last_reason = String::new();
            for (record, result) in current.records().iter().zip(results) {
                match result {
                    SubmissionResult::Accepted => resolution.accepted += 1,
                    SubmissionResult::Rejected(reason) => {
                        resolution.failures.push(TerminalFailure {
                            row: record.row(),
                            id: Some(record.id().to_string()),
                            kind: FailureKind::Rejected,
                            reason,
                        });
                    }
                    SubmissionResult::Retriable(reason) => {
                        retry.push(record.clone());
                        last_reason = reason;
                    }
                }
            }

            if retry.is_empty() {
                resolution.state = if resolution.failures.is_empty() {
                    BatchState::Complete
                } else {
                    BatchState::PartialFailure
                };
                debug!(worker = self.id, batch = seq, attempt, to = %resolution.state, "✅ batch resolved");
                break;
            }

            resolution.state = BatchState::PartialFailure;
            if attempt >= self.runtime.max_attempts {
                warn!(
                    worker = self.id,
                    batch = seq,
                    attempts = attempt,
                    records = retry.len(),
                    "💀 retries exhausted: {last_reason}"
                );
                let reason = format!("gave up after {attempt} attempts: {last_reason}");
                resolution.fail_all(&retry, FailureKind::RetriesExhausted, &reason);
                break;
            }
            if self.halt.is_cancelled() {
                let (kind, reason) = self.cut_short();
                resolution.fail_all(&retry, kind, reason);
                break;
            }

            let delay = self.runtime.backoff_for(attempt);
            let backoff_ms = delay.as_millis() as u64;
            warn!(
                worker = self.id,
                batch = seq,
                attempt,
                records = retry.len(),
                backoff_ms,
                to = %BatchState::PartialFailure,
                "🔄 retriable failures, backing off: {last_reason}"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.halt.cancelled() => {
                    let (kind, reason) = self.cut_short();
                    resolution.fail_all(&retry, kind, reason);
                    break;
                }
            }

            resolution.retried += retry.len() as u64;
            current = current.retry_with(retry);
        }

        debug_assert_eq!(resolution.resolved(), resolution.ids.len() as u64);
        resolution
    }
}

impl Worker for BatchWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!(worker = self.id, "📥 BatchWorker started draining channel...");
            while let Ok(batch) = self.rx.recv().await {
                let seq = batch.seq();
                let ledger: Vec<(u64, String)> =
                    batch.records().iter().map(|r| (r.row(), r.id().to_string())).collect();
                let resolution = match AssertUnwindSafe(self.process(batch)).catch_unwind().await {
                    Ok(resolution) => resolution,
                    Err(payload) => {
                        let what = payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "no message".to_string());
                        error!(worker = self.id, batch = seq, to = %BatchState::Fatal, "💥 worker panicked: {what}");
                        BatchResolution::panicked(seq, ledger, &format!("worker panicked mid-batch: {what}"))
                    }
                };
                self.tx
                    .send(resolution)
                    .await
                    .context("BatchWorker lost the coordinator while reporting a batch")?;
            }
            debug!(worker = self.id, "🏁 BatchWorker: channel closed. Shutting down.");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryAdapter;

    fn batch(ids: &[&str]) -> Batch {
        let records = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                Record::new(i as u64 + 1, vec![("id".into(), Some(id.to_string()))], Some("id"))
            })
            .collect();
        Batch::new(1, records)
    }

    fn worker(mem: &InMemoryAdapter, max_attempts: u32) -> (BatchWorker, CancellationToken) {
        let (_batch_tx, batch_rx) = async_channel::bounded(1);
        let (result_tx, _result_rx) = async_channel::unbounded();
        let cancel = CancellationToken::new();
        let runtime = RuntimeConfig { max_attempts, ..RuntimeConfig::default() };
        let worker = BatchWorker::new(
            0,
            batch_rx,
            result_tx,
            Arc::new(AdapterBackend::InMemory(mem.clone())),
            runtime,
            cancel.clone(),
            cancel.child_token(),
        );
        (worker, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_only_the_retriable_record_goes_around_again() {
        let mem = InMemoryAdapter::new().with_transient_failures("b", 2);
        let (worker, _cancel) = worker(&mem, 5);

        let resolution = worker.process(batch(&["a", "b", "c"])).await;

        assert_eq!(resolution.accepted, 3);
        assert_eq!(resolution.retried, 2);
        assert_eq!(resolution.state, BatchState::Complete);
        let submissions = mem.submissions();
        assert_eq!(submissions.len(), 3);
        assert_eq!(submissions[1].ids, vec!["b".to_string()]);
        assert_eq!(submissions[2].attempt, 3);
        assert_eq!(submissions[1].at - submissions[0].at, Duration::from_secs(1));
        assert_eq!(submissions[2].at - submissions[1].at, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_fatal_error_interrupts_the_whole_batch() {
        let mem = InMemoryAdapter::new().with_fatal_after_batches(0);
        let (worker, _cancel) = worker(&mem, 5);

        let resolution = worker.process(batch(&["a", "b"])).await;

        assert_eq!(resolution.state, BatchState::Fatal);
        assert!(resolution.fatal.as_ref().is_some_and(IngestError::is_fatal));
        assert_eq!(resolution.failures.len(), 2);
        assert!(resolution.failures.iter().all(|f| f.kind == FailureKind::Interrupted));
        assert_eq!(mem.submissions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_halted_worker_submits_nothing() {
        let mem = InMemoryAdapter::new();
        let (worker, cancel) = worker(&mem, 5);
        cancel.cancel();

        let resolution = worker.process(batch(&["a", "b"])).await;

        assert_eq!(resolution.abandoned, 2);
        assert_eq!(resolution.submitted, 0);
        assert!(mem.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_cancelling_mid_backoff_stops_the_retries() {
        let mem = InMemoryAdapter::new().with_transient_failures("a", u32::MAX);
        let (worker, cancel) = worker(&mem, 5);
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            canceller.cancel();
        });

        let resolution = worker.process(batch(&["a"])).await;

        // 🛑 attempt 1 at t=0, attempt 2 at t=1s, cancelled during the 2s backoff
        assert_eq!(mem.submissions().len(), 2);
        assert_eq!(resolution.failures.len(), 1);
        assert_eq!(resolution.failures[0].kind, FailureKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_panic_still_sends_a_resolution() {
        let mem = InMemoryAdapter::new().with_panic_on("b");
        let (batch_tx, batch_rx) = async_channel::bounded(1);
        let (result_tx, result_rx) = async_channel::unbounded();
        let cancel = CancellationToken::new();
        let handle = BatchWorker::new(
            0,
            batch_rx,
            result_tx,
            Arc::new(AdapterBackend::InMemory(mem.clone())),
            RuntimeConfig::default(),
            cancel.clone(),
            cancel.child_token(),
        )
        .start();

        batch_tx.send(batch(&["a", "b"])).await.expect("💀 send");
        let resolution = result_rx.recv().await.expect("💀 a resolution, not silence");

        assert_eq!(resolution.state, BatchState::Fatal);
        assert!(resolution.fatal.as_ref().is_some_and(IngestError::is_fatal));
        assert_eq!(resolution.resolved(), 2);
        assert!(resolution.failures.iter().all(|f| f.kind == FailureKind::Interrupted));
        assert!(resolution.failures[0].reason.contains("panicked"));

        // 🧵 and the worker is still standing, ready for the next batch
        batch_tx.send(batch(&["c"])).await.expect("💀 send");
        let next = result_rx.recv().await.expect("💀 second resolution");
        assert_eq!(next.accepted, 1);

        drop(batch_tx);
        handle.await.expect("💀 join").expect("💀 worker exits cleanly");
    }
}
