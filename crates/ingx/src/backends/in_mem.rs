//! # Previously, on ingx...
//!
//! 🎬 The cluster was down. The cluster is always down when you need to write a test.
//! So we built one out of a `BTreeMap` and an unhealthy amount of fault injection.
//!
//! [`InMemoryAdapter`] upserts documents into a map keyed by document id, which makes it
//! the perfect witness for idempotence: run the same file twice, count the keys, done.
//! It can also be told to misbehave on purpose:
//! - fail specific ids transiently for N attempts (or forever),
//! - reject specific ids outright,
//! - go fatal after N batches,
//! - fail whole submissions with queued errors,
//! - stall submissions (for timeouts) or add latency (for concurrency),
//! - panic outright when a given id shows up.
//!
//! And it keeps a diary. Every submission's ids are logged, and if two submissions
//! containing the same id are ever in flight at once, that lands in [`overlaps`].
//!
//! ⚠️ Clone-able and shared: clones point at the same store, so a test can hand one to the
//! coordinator and keep one for assertions.
//!
//! [`overlaps`]: InMemoryAdapter::overlaps

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

use crate::backends::Adapter;
use crate::common::{Batch, SubmissionResult};
use crate::error::IngestError;

/// 📝 One `submit` call, as the adapter saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionLog {
    pub seq: u64,
    pub attempt: u32,
    pub ids: Vec<String>,
    /// ⏱️ tokio's clock, so paused-time tests can measure backoff gaps exactly
    pub at: tokio::time::Instant,
}

#[derive(Debug, Default)]
struct InMemoryState {
    documents: BTreeMap<String, Value>,
    submissions: Vec<SubmissionLog>,
    transient: HashMap<String, u32>,
    rejections: HashMap<String, String>,
    fatal_after_batches: Option<usize>,
    queued_failures: VecDeque<IngestError>,
    stalls_remaining: usize,
    stall: Duration,
    latency: Duration,
    panic_on: Option<String>,
    in_flight: HashSet<String>,
    overlaps: Vec<String>,
}

/// 📦 A search index that lives and dies with the process.
#[derive(Debug, Default, Clone)]
pub struct InMemoryAdapter {
    state: Arc<Mutex<InMemoryState>>,
}

// -- 🔓 takes ids off the in-flight list even when the submit future is dropped by a timeout
struct InFlightGuard {
    state: Arc<Mutex<InMemoryState>>,
    ids: Vec<String>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        for id in &self.ids {
            state.in_flight.remove(id);
        }
    }
}

fn lock(state: &Mutex<InMemoryState>) -> MutexGuard<'_, InMemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 🔄 `id` comes back `Retriable` for its next `times` submissions. `u32::MAX` = forever.
    pub fn with_transient_failures(self, id: impl Into<String>, times: u32) -> Self {
        lock(&self.state).transient.insert(id.into(), times);
        self
    }

    /// 🚫 `id` is always `Rejected` with `reason`.
    pub fn with_rejection(self, id: impl Into<String>, reason: impl Into<String>) -> Self {
        lock(&self.state).rejections.insert(id.into(), reason.into());
        self
    }

    /// 🚨 The first `batches` submissions behave; every one after that is `FatalBackend`.
    pub fn with_fatal_after_batches(self, batches: usize) -> Self {
        lock(&self.state).fatal_after_batches = Some(batches);
        self
    }

    /// 💥 The next submission fails as a whole with `error` (queue several for several).
    pub fn with_failed_submission(self, error: IngestError) -> Self {
        lock(&self.state).queued_failures.push_back(error);
        self
    }

    /// 🐢 The first `calls` submissions sleep for `stall` before answering.
    pub fn with_stalls(self, calls: usize, stall: Duration) -> Self {
        {
            let mut state = lock(&self.state);
            state.stalls_remaining = calls;
            state.stall = stall;
        }
        self
    }

    /// 🐢 Every submission sleeps for `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        lock(&self.state).latency = latency;
        self
    }

    /// 💣 Any submission carrying `id` panics instead of answering.
    pub fn with_panic_on(self, id: impl Into<String>) -> Self {
        lock(&self.state).panic_on = Some(id.into());
        self
    }

    pub fn document_count(&self) -> usize {
        lock(&self.state).documents.len()
    }

    pub fn document(&self, id: &str) -> Option<Value> {
        lock(&self.state).documents.get(id).cloned()
    }

    pub fn submissions(&self) -> Vec<SubmissionLog> {
        lock(&self.state).submissions.clone()
    }

    /// 🚨 Ids that were part of two concurrent submissions. Should always be empty.
    pub fn overlaps(&self) -> Vec<String> {
        lock(&self.state).overlaps.clone()
    }
}

#[async_trait]
impl Adapter for InMemoryAdapter {
    async fn submit(&self, batch: &Batch) -> Result<Vec<SubmissionResult>, IngestError> {
        let ids: Vec<String> = batch.records().iter().map(|r| r.id().to_string()).collect();

        let (pause, explode) = {
            let mut state = lock(&self.state);
            let previous = state.submissions.len();
            state.submissions.push(SubmissionLog {
                seq: batch.seq(),
                attempt: batch.attempt(),
                ids: ids.clone(),
                at: tokio::time::Instant::now(),
            });

            if state.fatal_after_batches.is_some_and(|limit| previous >= limit) {
                return Err(IngestError::FatalBackend(
                    "index_not_found_exception: no such index".to_string(),
                ));
            }
            if let Some(error) = state.queued_failures.pop_front() {
                return Err(error);
            }

            // 🔒 a batch may carry the same id twice; only other submissions count as overlap
            let unique: HashSet<&String> = ids.iter().collect();
            for id in unique {
                if !state.in_flight.insert(id.clone()) {
                    state.overlaps.push(id.clone());
                }
            }

            let mut pause = state.latency;
            if state.stalls_remaining > 0 {
                state.stalls_remaining -= 1;
                pause += state.stall;
            }
            let explode = state.panic_on.as_ref().is_some_and(|id| ids.contains(id));
            (pause, explode)
        };
        let _guard = InFlightGuard { state: Arc::clone(&self.state), ids: ids.clone() };

        if explode {
            panic!("💣 in-memory adapter was told to blow up on batch {}", batch.seq());
        }

        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }

        let mut state = lock(&self.state);
        let mut results = Vec::with_capacity(batch.len());
        for record in batch.records() {
            let id = record.id();
            if let Some(reason) = state.rejections.get(id) {
                results.push(SubmissionResult::Rejected(reason.clone()));
                continue;
            }
            if let Some(remaining) = state.transient.get_mut(id).filter(|r| **r > 0) {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                results.push(SubmissionResult::Retriable(
                    "es_rejected_execution_exception: queue is full".to_string(),
                ));
                continue;
            }
            state.documents.insert(id.to_string(), record.to_document());
            results.push(SubmissionResult::Accepted);
        }
        trace!(
            batch = batch.seq(),
            attempt = batch.attempt(),
            stored = state.documents.len(),
            "🧠 in-memory submit done"
        );
        Ok(results)
    }
}
