//! 🚀 ingx-cli: the front door, the bouncer, the maitre d' of ingx.
//!
//! 🎬 *[narrator voice]* "It all started with a simple `ingest --input people.csv`..."
//! 📦 This binary is the thin wrapper that parses flags, loads config, sets up logging,
//! wires Ctrl-C and SIGTERM to the cancel button, and then lets the library do the heavy lifting.
//! Like a manager. 🦆
//!
//! The report goes to stdout, logs go to stderr, and the exit code tells the truth:
//! 0 = all good, 1 = aborted, 2 = finished with failures (or cancelled).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// 🚚 Bulk-load a CSV file into a search index.
#[derive(Debug, Parser)]
#[command(name = "ingest", version, about)]
struct Cli {
    /// CSV file to read (`.gz` is decompressed on the fly)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Target index name [default: test]
    #[arg(long)]
    index: Option<String>,

    /// Search cluster, as `host:port` or a full URL [default: localhost:9200]
    #[arg(long)]
    endpoint: Option<String>,

    /// Maximum records per bulk request
    #[arg(long)]
    batch_size: Option<usize>,

    /// Maximum estimated bytes per bulk request
    #[arg(long)]
    max_batch_bytes: Option<usize>,

    /// Batches allowed in flight at once
    #[arg(long)]
    workers: Option<usize>,

    /// What to do with rows that don't match the header
    #[arg(long, value_enum)]
    on_malformed: Option<OnMalformed>,

    /// Column holding the document id (rows without one get a content hash)
    #[arg(long)]
    id_field: Option<String>,

    /// Use `update` + `doc_as_upsert` instead of `index`
    #[arg(long)]
    upsert: bool,

    /// Read and batch everything, send nothing
    #[arg(long)]
    dry_run: bool,

    /// Optional TOML config; flags win over it
    #[arg(long, env = "INGX_CONFIG")]
    config: Option<PathBuf>,

    /// Also write the final report as JSON here
    #[arg(long)]
    report_json: Option<PathBuf>,

    /// No spinner
    #[arg(long)]
    no_progress: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OnMalformed {
    Skip,
    Abort,
}

impl OnMalformed {
    fn as_str(self) -> &'static str {
        match self {
            OnMalformed::Skip => "skip",
            OnMalformed::Abort => "abort",
        }
    }
}

/// 🔗 `localhost:9200` → `http://localhost:9200`. URLs that already have a scheme pass through.
fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

impl Cli {
    /// 🎛️ Flags → dotted config keys, applied on top of the file and the environment.
    fn overrides(&self) -> Vec<(String, Value)> {
        let mut overrides: Vec<(String, Value)> = Vec::new();
        let mut set = |key: &str, value: Value| overrides.push((key.to_string(), value));

        if let Some(input) = &self.input {
            set("source_config.file_name", json!(input.to_string_lossy()));
        }
        if let Some(id_field) = &self.id_field {
            set("source_config.id_field", json!(id_field));
        }
        if let Some(policy) = self.on_malformed {
            set("source_config.on_malformed", json!(policy.as_str()));
        }
        if let Some(batch_size) = self.batch_size {
            set("runtime.max_batch_records", json!(batch_size));
        }
        if let Some(max_batch_bytes) = self.max_batch_bytes {
            set("runtime.max_batch_bytes", json!(max_batch_bytes));
        }
        if let Some(workers) = self.workers {
            set("runtime.workers", json!(workers));
        }
        set("runtime.progress", json!(!self.no_progress));

        if self.dry_run {
            // 🪵 a string replaces the whole table, so any file-side ES settings are moot
            set("sink_config", json!("NoOp"));
        } else {
            if let Some(endpoint) = &self.endpoint {
                set("sink_config.Elasticsearch.url", json!(normalize_endpoint(endpoint)));
            }
            if let Some(index) = &self.index {
                set("sink_config.Elasticsearch.index", json!(index));
            }
            if self.upsert {
                set("sink_config.Elasticsearch.operation", json!("upsert"));
            }
        }
        overrides
    }
}

// -- 🕵️ sniff the reason like a truffle pig hunting for connection problems
fn looks_like_connection_trouble(reason: &str) -> bool {
    ["error sending request", "onnection refused", "tcp connect error", "dns error"]
        .iter()
        .any(|needle| reason.contains(needle))
}

/// 📡 Resolves with the name of whichever stop signal shows up first. A handler that can't
/// be installed just never fires.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "Ctrl-C",
            Err(err) => {
                warn!("⚠️ couldn't listen for Ctrl-C: {err}");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                "SIGTERM"
            }
            Err(err) => {
                warn!("⚠️ couldn't listen for SIGTERM: {err}");
                std::future::pending().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = ctrl_c => name,
        name = terminate => name,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 📡 logs on stderr, so stdout stays clean for the report
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let app_config = match ingx::app_config::load_config_with_overrides(
        cli.config.as_deref(),
        cli.overrides(),
    )
    .context("💀 couldn't build a configuration from the flags, INGX_* env vars and config file")
    {
        Ok(app_config) => app_config,
        Err(err) => {
            error!("💀 error: {err}");
            // -- 🧅 peel the onion of sadness, one layer at a time
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {cause}");
            }
            std::process::exit(1);
        }
    };

    // 🛑 Ctrl-C or SIGTERM: stop reading, let in-flight batches land, still print the report
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        let signal = shutdown_signal().await;
        warn!("🛑 {signal} received: finishing in-flight batches, then stopping");
        on_signal.cancel();
    });

    let report = ingx::run(app_config, cancel).await?;
    println!("{report}");

    if let Some(reason) = report.aborted.as_deref().filter(|r| looks_like_connection_trouble(r)) {
        error!(
            "🔧 hint: looks like the cluster isn't reachable ({reason}). Double-check the \
             endpoint, and if it's in Docker, `docker ps` to see if it's actually up. ☕"
        );
    }

    if let Some(path) = &cli.report_json {
        let json = serde_json::to_string_pretty(&report).context("💀 couldn't serialize the report")?;
        std::fs::write(path, json)
            .with_context(|| format!("💀 couldn't write the JSON report to '{}'", path.display()))?;
    }

    std::process::exit(report.exit_code());
}
