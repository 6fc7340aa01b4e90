//! 🎬 *[camera pans across a CSV file the size of a small moon]*
//! 🎬 "In a world where rows arrive one at a time..."
//! 🎬 "One coordinator dared to count them all."
//!
//! 📦 The Coordinator owns the run. It pulls records from the source, feeds them to the
//! [`BatchAccumulator`], hands full batches to a pool of [`BatchWorker`]s, folds every
//! [`BatchResolution`] into the [`IngestionReport`], and decides when to stop.
//!
//! 🧠 The shape of it:
//! ```text
//!   SourceBackend ──▶ BatchAccumulator ──▶ async_channel ──▶ BatchWorker × N ──▶ Adapter
//!         ▲                                                        │
//!         └──────────── Coordinator ◀── BatchResolution ───────────┘
//! ```
//!
//! Rules it lives by:
//! - 🐢 Backpressure: no record is pulled while `workers` batches are already in flight.
//!   With `workers = 1` that is strictly one batch at a time.
//! - 🔒 A document id in flight is never submitted again until its batch resolves.
//! - 🚨 A fatal error (source gone, backend says no, malformed row under `abort`) stops
//!   the pulling, lets the in-flight batches land, and marks the report aborted.
//! - 🛑 Cancellation stops the pulling right away; in-flight submissions get to finish,
//!   nothing is retried, and whatever was still in the cart is counted as abandoned.
//! - 📋 There is always a report. Always.
//!
//! ⚠️ The workers are the coordinator's private little minions. Do not pub them.

use std::sync::Arc;

use anyhow::Result;
use async_channel::{Receiver, Sender};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accumulator::{Admission, BatchAccumulator};
use crate::app_config::{MalformedPolicy, RuntimeConfig};
use crate::backends::AdapterBackend;
use crate::common::{Batch, Record};
use crate::error::IngestError;
use crate::progress::ProgressMetrics;
use crate::report::{FailureKind, IngestionReport, TerminalFailure};
use crate::sources::SourceBackend;

mod worker;
use worker::{BatchResolution, BatchWorker};

/// 🏗️ A background worker, that does work. duh.
pub(crate) trait Worker {
    /// 🚀 Start the worker. Returns a JoinHandle because we trust but verify.
    fn start(self) -> JoinHandle<Result<()>>;
}

/// 📦 Drives one ingestion run from the first row to the final report.
#[derive(Debug)]
pub struct Coordinator {
    adapter: Arc<AdapterBackend>,
    runtime: RuntimeConfig,
    on_malformed: MalformedPolicy,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        adapter: Arc<AdapterBackend>,
        runtime: RuntimeConfig,
        on_malformed: MalformedPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self { adapter, runtime, on_malformed, cancel }
    }

    /// 🚀 Ingest everything `source` has to give. Never fails; the report says how it went.
    pub async fn run(&self, source: SourceBackend) -> IngestionReport {
        let started = Instant::now();
        let workers = self.runtime.workers.max(1);
        info!(
            workers,
            max_batch_records = self.runtime.max_batch_records,
            max_batch_bytes = self.runtime.max_batch_bytes,
            input_bytes = source.size_hint_bytes(),
            "🚀 ingestion starting"
        );

        // 🚨 child of the user's token: cancelled by the user, or by us when the run aborts
        let halt = self.cancel.child_token();
        let (batch_tx, batch_rx) = async_channel::bounded::<Batch>(workers);
        let (result_tx, result_rx) = async_channel::unbounded::<BatchResolution>();

        let handles: Vec<JoinHandle<Result<()>>> = (0..workers)
            .map(|id| {
                BatchWorker::new(
                    id,
                    batch_rx.clone(),
                    result_tx.clone(),
                    Arc::clone(&self.adapter),
                    self.runtime.clone(),
                    self.cancel.clone(),
                    halt.clone(),
                )
                .start()
            })
            .collect();
        // -- 🔌 only the workers hold these now, so the channels close when they're done
        drop(batch_rx);
        drop(result_tx);

        let mut run = Run {
            workers,
            on_malformed: self.on_malformed,
            halt,
            batch_tx,
            result_rx,
            accumulator: BatchAccumulator::new(
                self.runtime.max_batch_records,
                self.runtime.max_batch_bytes,
            ),
            report: IngestionReport::new(self.runtime.max_reported_failures),
            progress: ProgressMetrics::new(self.runtime.progress, "📥 ingest"),
            in_flight: 0,
        };

        run.pump(source).await;
        run.wind_down().await;

        let Run { mut report, progress, batch_tx, .. } = run;
        drop(batch_tx);
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!("💀 a worker bowed out with an error: {err:#}");
                    report.abort(format!("worker failed: {err:#}"));
                }
                Err(join_err) => {
                    error!("💀 a worker panicked: {join_err}");
                    report.abort(format!("worker panicked: {join_err}"));
                }
            }
        }

        report.cancelled = self.cancel.is_cancelled();
        report.finish(started.elapsed());
        progress.finish();
        info!(
            status = ?report.status(),
            submitted = report.submitted,
            accepted = report.accepted,
            rejected = report.rejected,
            failed = report.failed,
            abandoned = report.abandoned,
            batches = report.batches,
            elapsed_ms = report.elapsed_ms,
            "🏁 ingestion finished"
        );
        report
    }
}

// -- 🧰 the mutable guts of one run, so the helpers don't need eight &mut parameters each
struct Run {
    workers: usize,
    on_malformed: MalformedPolicy,
    halt: CancellationToken,
    batch_tx: Sender<Batch>,
    result_rx: Receiver<BatchResolution>,
    accumulator: BatchAccumulator,
    report: IngestionReport,
    progress: ProgressMetrics,
    in_flight: usize,
}

impl Run {
    /// 🚰 Pull records until the source runs dry or the run halts.
    async fn pump(&mut self, mut source: SourceBackend) {
        loop {
            // 🐢 all hands busy, nobody reads
            while self.in_flight >= self.workers {
                self.await_resolution().await;
            }
            if self.halt.is_cancelled() {
                return;
            }
            let Some(item) = source.next() else {
                return;
            };

            let record = match item {
                Ok(record) => record,
                Err(IngestError::MalformedRecord { row, reason }) => {
                    warn!(row, "🧟 malformed record: {reason}");
                    let abort = self.on_malformed == MalformedPolicy::Abort;
                    let message = format!("malformed record at row {row}: {reason}");
                    self.report.record_failure(TerminalFailure {
                        row,
                        id: None,
                        kind: FailureKind::MalformedRecord,
                        reason,
                    });
                    if abort {
                        self.abort(message);
                        return;
                    }
                    continue;
                }
                Err(err) => {
                    error!(kind = err.kind(), "🚨 source failed mid-stream: {err}");
                    self.abort(err.to_string());
                    return;
                }
            };

            self.admit(record).await;
        }
    }

    /// 🧺 Get one record into the accumulator, flushing and waiting as needed.
    async fn admit(&mut self, record: Record) {
        let mut pending = Some(record);
        while let Some(record) = pending.take() {
            match self.accumulator.add(record) {
                Admission::Accepted => {}
                Admission::BatchFull(bounced) => {
                    if let Some(batch) = self.accumulator.flush() {
                        self.dispatch(batch).await;
                    }
                    pending = bounced;
                }
                Admission::Blocked(record) => {
                    debug!(id = record.id(), row = record.row(), "🔒 id is in flight, waiting");
                    // 🔒 nothing in flight means nothing to wait for; a leftover lock is stale
                    if self.in_flight == 0 {
                        self.accumulator.release([record.id()]);
                    } else {
                        self.await_resolution().await;
                    }
                    if self.halt.is_cancelled() {
                        self.report.abandoned += 1;
                        return;
                    }
                    pending = Some(record);
                }
            }
        }
    }

    /// 📤 Hand a batch to the workers, waiting for a free slot first.
    async fn dispatch(&mut self, batch: Batch) {
        while self.in_flight >= self.workers {
            self.await_resolution().await;
        }
        if self.halt.is_cancelled() {
            self.report.abandoned += batch.len() as u64;
            return;
        }

        debug!(batch = batch.seq(), records = batch.len(), bytes = batch.estimated_bytes(), "🧺 batch sealed");
        self.accumulator.mark_in_flight(&batch);
        let size = batch.len() as u64;
        self.in_flight += 1;
        self.report.batches += 1;
        if self.batch_tx.send(batch).await.is_err() {
            // 💀 every worker is gone; nobody is coming for this batch
            self.in_flight -= 1;
            self.report.abandoned += size;
            self.abort("all workers exited before the run finished");
        }
    }

    /// ⏳ Wait for one batch to come back and fold it into the report.
    async fn await_resolution(&mut self) {
        match self.result_rx.recv().await {
            Ok(resolution) => self.apply(resolution),
            Err(_) => {
                // 💀 channel closed with batches still out: those records are lost to us
                self.in_flight = 0;
                self.abort("all workers exited before the run finished");
            }
        }
    }

    fn apply(&mut self, resolution: BatchResolution) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.accumulator.release(resolution.ids.iter().map(String::as_str));
        let resolved = resolution.resolved();

        let report = &mut self.report;
        report.submitted += resolution.submitted;
        report.retried += resolution.retried;
        report.accepted += resolution.accepted;
        report.abandoned += resolution.abandoned;
        let failed = resolution.failures.len() as u64;
        for failure in resolution.failures {
            report.record_failure(failure);
        }
        self.progress.update(resolved, resolution.accepted);

        debug!(
            batch = resolution.seq,
            state = %resolution.state,
            accepted = resolution.accepted,
            failed,
            "📬 batch resolution received"
        );
        if let Some(fatal) = resolution.fatal {
            self.abort(fatal.to_string());
        }
    }

    /// 🚨 Stop pulling, stop submitting, keep the first reason.
    fn abort(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.halt.is_cancelled() {
            error!("🚨 aborting run: {reason}");
        }
        self.report.abort(reason);
        self.halt.cancel();
    }

    /// 🧹 Flush or discard the last partial batch, then wait for everything in flight.
    async fn wind_down(&mut self) {
        let (records, bytes) = (self.accumulator.pending_len(), self.accumulator.pending_bytes());
        if self.halt.is_cancelled() {
            let discarded = self.accumulator.discard_pending() as u64;
            if discarded > 0 {
                info!(records = discarded, bytes, "🗑️ unflushed records abandoned");
            }
            self.report.abandoned += discarded;
        } else if let Some(batch) = self.accumulator.flush() {
            debug!(records, bytes, "🧺 flushing the last partial batch");
            self.dispatch(batch).await;
        }

        while self.in_flight > 0 {
            self.await_resolution().await;
        }
    }
}
