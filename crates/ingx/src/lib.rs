//! 🚀 ingx: CSV in, search index out, and a receipt at the end.
//!
//! 🎬 *[narrator voice]* "It was just one CSV file. How long could it take?"
//!
//! 🧠 The pieces, in the order a record meets them:
//! - [`sources`]: reads rows lazily and checks them against the header
//! - [`accumulator`]: packs records into bounded batches, keeps in-flight ids apart
//! - [`coordinator`]: drives the run, retries, backs off, halts, cancels
//! - [`backends`]: bulk-writes a batch to Elasticsearch (or memory, or nowhere)
//! - [`report`]: counts everything and picks the exit code
//!
//! [`run`] wires them together from an [`AppConfig`](app_config::AppConfig).

pub mod accumulator;
pub mod app_config;
pub mod backends;
pub mod common;
pub mod coordinator;
pub mod error;
pub(crate) mod progress;
pub mod report;
pub mod sources;

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::app_config::AppConfig;
use crate::backends::AdapterBackend;
use crate::coordinator::Coordinator;
use crate::report::IngestionReport;
use crate::sources::SourceBackend;

/// 🚀 Run one ingestion end to end.
///
/// The source is opened before the backend is touched, so a missing file never costs a
/// network round trip. Either failing produces an aborted report, not an `Err`: the
/// caller always gets a receipt. `Err` is reserved for a config that can't describe a run.
pub async fn run(app_config: AppConfig, cancel: CancellationToken) -> Result<IngestionReport> {
    app_config.runtime.validate()?;
    let aborted = |reason: String| {
        error!("🚨 run aborted before the first batch: {reason}");
        let mut report = IngestionReport::new(app_config.runtime.max_reported_failures);
        report.abort(reason);
        report
    };

    let source = match SourceBackend::open(&app_config.source_config) {
        Ok(source) => source,
        Err(err) => return Ok(aborted(err.to_string())),
    };
    info!("📂 reading '{}'", app_config.source_config.file_name);

    let adapter = match AdapterBackend::from_config(&app_config.sink_config).await {
        Ok(adapter) => adapter,
        Err(err) => return Ok(aborted(err.to_string())),
    };

    let coordinator = Coordinator::new(
        Arc::new(adapter),
        app_config.runtime.clone(),
        app_config.source_config.on_malformed,
        cancel,
    );
    Ok(coordinator.run(source).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::{RuntimeConfig, SinkConfig, SourceConfig};
    use std::io::Write;

    fn config_for(file_name: &str) -> AppConfig {
        AppConfig {
            source_config: SourceConfig::for_file(file_name),
            sink_config: SinkConfig::NoOp,
            runtime: RuntimeConfig::default(),
        }
    }

    #[tokio::test]
    async fn the_one_where_a_missing_file_still_gets_a_receipt() {
        let report = run(config_for("/definitely/not/here.csv"), CancellationToken::new())
            .await
            .expect("💀 a missing file is an aborted report, not an error");

        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.submitted, 0);
        assert!(report.aborted.as_deref().is_some_and(|r| r.contains("source unavailable")));
    }

    #[tokio::test]
    async fn the_one_where_a_dry_run_reads_everything_and_sends_nothing() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().expect("💀 temp file");
        writeln!(file, "id,name\n1,Ada\n2,Grace\n3,Linus").expect("💀 write csv");

        let report = run(config_for(&file.path().to_string_lossy()), CancellationToken::new())
            .await
            .expect("💀 dry run should run");

        assert_eq!(report.accepted, 3);
        assert_eq!(report.batches, 1);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn the_one_where_zero_workers_is_refused_up_front() {
        let mut config = config_for("whatever.csv");
        config.runtime.workers = 0;
        assert!(run(config, CancellationToken::new()).await.is_err());
    }
}
