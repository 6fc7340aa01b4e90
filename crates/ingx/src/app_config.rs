//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 Layers, lowest to highest priority:
//!   1. serde defaults (the "it just works" layer)
//!   2. an optional TOML file
//!   3. `INGX_*` environment variables, nested with `__`
//!   4. CLI overrides, handed in as dotted keys
//!
//! Credentials are the exception. They come from `INGX_ES_USERNAME`, `INGX_ES_PASSWORD`
//! and `INGX_ES_API_KEY` only, never from a file, and never show up in `Debug` output. 🦆
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, ensure};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// 📦 One struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    /// 📂 Where the rows come from and what a good row looks like.
    pub source_config: SourceConfig,
    /// 🕳️ Where the documents go. Left out entirely: `http://localhost:9200`, index `test`.
    #[serde(default)]
    pub sink_config: SinkConfig,
    /// 🎛️ Batching, retry, and concurrency knobs.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

// ============================================================
// 📂 SourceConfig
// ============================================================

/// 📂 The CSV input. `file_name` may end in `.gz`; it gets decompressed on the fly.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    pub file_name: String,
    /// Single ASCII byte. Comma, unless you're from a tab-separated household.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Column holding an explicit document id. Missing/null values fall back to a content hash.
    #[serde(default = "default_id_field")]
    pub id_field: Option<String>,
    /// Columns that must be non-null, or the row is malformed.
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub on_malformed: MalformedPolicy,
    /// Turn empty cells into null. On by default.
    #[serde(default = "default_true")]
    pub empty_as_null: bool,
}

impl SourceConfig {
    /// 🏗️ Defaults for everything except the path.
    pub fn for_file(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            delimiter: default_delimiter(),
            id_field: default_id_field(),
            required_fields: Vec::new(),
            on_malformed: MalformedPolicy::default(),
            empty_as_null: true,
        }
    }
}

fn default_delimiter() -> char {
    ','
}

fn default_id_field() -> Option<String> {
    Some("id".to_string())
}

fn default_true() -> bool {
    true
}

/// 🐛 What to do with a row that breaks the header's promises.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Count it as rejected, keep going.
    #[default]
    Skip,
    /// Stop the run.
    Abort,
}

// ============================================================
// 🕳️ SinkConfig
// ============================================================

/// 🎭 The many faces of a sink. Externally tagged, so in TOML it's
/// `[sink_config.Elasticsearch]` or `sink_config = "NoOp"`.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub enum SinkConfig {
    Elasticsearch(ElasticsearchSinkConfig),
    /// 🪵 Dry run: log every batch, index nothing.
    NoOp,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::Elasticsearch(ElasticsearchSinkConfig::default())
    }
}

/// 📡 Everything needed to talk to an Elasticsearch-compatible `_bulk` endpoint.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ElasticsearchSinkConfig {
    /// Base URL. Defaults to a cluster on this machine.
    #[serde(default = "default_es_url")]
    pub url: String,
    /// Target index. Must already exist.
    #[serde(default = "default_es_index")]
    pub index: String,
    #[serde(default)]
    pub operation: BulkOperation,
    /// 🔒 Loaded from `INGX_ES_*` env vars by [`load_config`], never from files.
    #[serde(skip)]
    pub credentials: Credentials,
}

fn default_es_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_es_index() -> String {
    "test".to_string()
}

impl Default for ElasticsearchSinkConfig {
    fn default() -> Self {
        Self::new(default_es_url(), default_es_index())
    }
}

impl ElasticsearchSinkConfig {
    pub fn new(url: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            index: index.into(),
            operation: BulkOperation::default(),
            credentials: Credentials::default(),
        }
    }
}

/// 🔄 Bulk action per document. Both are keyed by `_id`, so both are idempotent.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BulkOperation {
    /// `index`: replace the whole document.
    #[default]
    Index,
    /// `update` + `doc_as_upsert`: merge fields into an existing document, or create it.
    Upsert,
}

/// 🔒 Endpoint credentials. API key beats basic auth when both are set.
#[derive(Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Credentials {
    /// 🔒 Pull credentials from `INGX_ES_USERNAME` / `INGX_ES_PASSWORD` / `INGX_ES_API_KEY`.
    pub fn from_env() -> anyhow::Result<Self> {
        Figment::new()
            .merge(Env::prefixed("INGX_ES_").only(&["username", "password", "api_key"]))
            .extract()
            .context("💀 Couldn't read INGX_ES_* credentials from the environment")
    }
}

// -- 🔒 the whole point of this impl is what it leaves out
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "<redacted>");
        f.debug_struct("Credentials")
            .field("username", &redact(&self.username))
            .field("password", &redact(&self.password))
            .field("api_key", &redact(&self.api_key))
            .finish()
    }
}

// ============================================================
// 🎛️ RuntimeConfig
// ============================================================

/// 🎛️ How the coordinator behaves. All fields have defaults, so an empty `[runtime]`
/// (or none at all) is a perfectly reasonable life choice.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default = "default_max_batch_records", alias = "batch_size")]
    pub max_batch_records: usize,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    /// Total submissions per record, first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    /// Batches allowed in flight at once. 1 = strictly sequential.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How many terminal failures the report lists by name (all of them are counted).
    #[serde(default = "default_max_reported_failures")]
    pub max_reported_failures: usize,
    #[serde(default)]
    pub progress: bool,
}

fn default_max_batch_records() -> usize {
    500
}

// -- 📦 5 MiB: big enough to be worth the round trip, small enough that ES doesn't sulk
fn default_max_batch_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_submit_timeout_ms() -> u64 {
    30_000
}

fn default_workers() -> usize {
    1
}

fn default_max_reported_failures() -> usize {
    20
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_batch_records: default_max_batch_records(),
            max_batch_bytes: default_max_batch_bytes(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            submit_timeout_ms: default_submit_timeout_ms(),
            workers: default_workers(),
            max_reported_failures: default_max_reported_failures(),
            progress: false,
        }
    }
}

impl RuntimeConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    /// ⏳ Delay before resubmitting after failed attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), cap)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.backoff_base().saturating_mul(1u32 << exponent);
        delay.min(self.backoff_cap())
    }

    /// ✅ Reject knob combinations that would make the pipeline stall or spin.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.max_batch_records > 0, "💀 max_batch_records must be at least 1");
        ensure!(self.max_batch_bytes > 0, "💀 max_batch_bytes must be at least 1");
        ensure!(self.max_attempts > 0, "💀 max_attempts must be at least 1");
        ensure!(self.workers > 0, "💀 workers must be at least 1. Zero workers is a vacation.");
        Ok(())
    }
}

// ============================================================
// 🚀 Loading
// ============================================================

/// 🚀 Load the config from an optional TOML file and the environment.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    load_config_with_overrides(config_file_name, Vec::new())
}

/// 🚀 Same as [`load_config`], plus CLI overrides as `(dotted.key, value)` pairs applied last.
///
/// e.g. `("runtime.max_batch_records", json!(100))` or `("sink_config", json!("NoOp"))`.
pub fn load_config_with_overrides(
    config_file_name: Option<&Path>,
    overrides: Vec<(String, serde_json::Value)>,
) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:?} (+{} override(s))",
        config_file_name.unwrap_or(Path::new("<env only>")),
        overrides.len()
    );

    let mut figment = Figment::new();
    if let Some(file_name) = config_file_name {
        figment = figment.merge(Toml::file(file_name));
    }
    figment = figment.merge(Env::prefixed("INGX_").split("__"));
    for (key, value) in overrides {
        figment = figment.merge(Serialized::default(&key, value));
    }

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from '{}', INGX_* env vars and CLI flags.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from INGX_* env vars and CLI flags. \
                 No file was provided, so this one's on the environment."
            .to_string(),
    };
    let mut app_config: AppConfig = figment.extract().context(context_msg)?;

    if let SinkConfig::Elasticsearch(es_config) = &mut app_config.sink_config {
        es_config.credentials = Credentials::from_env()?;
    }
    app_config.runtime.validate()?;
    ensure!(
        app_config.source_config.delimiter.is_ascii(),
        "💀 delimiter must be a single ASCII character, got {:?}",
        app_config.source_config.delimiter
    );

    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_test_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("💀 tempfile refused to exist");
        file.write_all(contents.as_bytes())
            .expect("💀 Failed to write test config. The filesystem said 'new phone who dis'.");
        file
    }

    #[test]
    fn the_one_where_a_full_file_parses() {
        let file = write_test_config(
            r#"
            [source_config]
            file_name = "people.csv"
            delimiter = ";"
            required_fields = ["name"]
            on_malformed = "abort"

            [sink_config.Elasticsearch]
            url = "http://localhost:9200"
            index = "people"
            operation = "upsert"

            [runtime]
            max_batch_records = 100
            workers = 3
            "#,
        );

        let app_config = load_config(Some(file.path())).expect("💀 Config should parse");

        assert_eq!(app_config.source_config.delimiter, ';');
        assert_eq!(app_config.source_config.on_malformed, MalformedPolicy::Abort);
        assert_eq!(app_config.runtime.max_batch_records, 100);
        assert_eq!(app_config.runtime.workers, 3);
        assert_eq!(app_config.runtime.max_attempts, 5);
        match app_config.sink_config {
            SinkConfig::Elasticsearch(es) => {
                assert_eq!(es.index, "people");
                assert_eq!(es.operation, BulkOperation::Upsert);
            }
            honestly_who_knows => panic!("💀 Expected Elasticsearch, got {honestly_who_knows:?}"),
        }
    }

    #[test]
    fn the_one_where_runtime_defaults_show_up_uninvited_but_helpful() {
        let app_config: AppConfig = toml::from_str(
            r#"
            sink_config = "NoOp"
            [source_config]
            file_name = "in.csv"
            "#,
        )
        .expect("💀 Minimal config should parse");

        assert_eq!(app_config.runtime, RuntimeConfig::default());
        assert_eq!(app_config.runtime.max_batch_records, 500);
        assert_eq!(app_config.runtime.max_batch_bytes, 5 * 1024 * 1024);
        assert_eq!(app_config.source_config.id_field.as_deref(), Some("id"));
        assert!(app_config.source_config.empty_as_null);
        assert!(matches!(app_config.sink_config, SinkConfig::NoOp));
    }

    #[test]
    fn the_one_where_cli_overrides_get_the_last_word() {
        let file = write_test_config(
            r#"
            [source_config]
            file_name = "from-file.csv"

            [sink_config.Elasticsearch]
            url = "http://localhost:9200"
            index = "people"

            [runtime]
            max_batch_records = 100
            "#,
        );

        let app_config = load_config_with_overrides(
            Some(file.path()),
            vec![
                ("source_config.file_name".into(), serde_json::json!("from-cli.csv")),
                ("runtime.max_batch_records".into(), serde_json::json!(7)),
                ("sink_config".into(), serde_json::json!("NoOp")),
            ],
        )
        .expect("💀 Overrides should merge");

        assert_eq!(app_config.source_config.file_name, "from-cli.csv");
        assert_eq!(app_config.runtime.max_batch_records, 7);
        assert!(matches!(app_config.sink_config, SinkConfig::NoOp));
    }

    #[test]
    fn the_one_where_no_sink_means_the_local_cluster() {
        let app_config: AppConfig = toml::from_str(
            r#"
            [source_config]
            file_name = "in.csv"
            "#,
        )
        .expect("💀 a config without a sink should parse");

        match app_config.sink_config {
            SinkConfig::Elasticsearch(es) => {
                assert_eq!(es.url, "http://localhost:9200");
                assert_eq!(es.index, "test");
                assert_eq!(es.operation, BulkOperation::Index);
            }
            honestly_who_knows => panic!("💀 Expected Elasticsearch, got {honestly_who_knows:?}"),
        }

        let pointed_elsewhere = load_config_with_overrides(
            None,
            vec![
                ("source_config.file_name".into(), serde_json::json!("in.csv")),
                ("sink_config.Elasticsearch.url".into(), serde_json::json!("http://es.internal:9200")),
            ],
        )
        .expect("💀 a url alone is enough");
        match pointed_elsewhere.sink_config {
            SinkConfig::Elasticsearch(es) => {
                assert_eq!(es.url, "http://es.internal:9200");
                assert_eq!(es.index, "test");
            }
            honestly_who_knows => panic!("💀 Expected Elasticsearch, got {honestly_who_knows:?}"),
        }
    }

    #[test]
    fn the_one_where_zero_workers_is_not_a_plan() {
        let runtime = RuntimeConfig { workers: 0, ..RuntimeConfig::default() };
        assert!(runtime.validate().is_err());
    }

    #[test]
    fn the_one_where_backoff_doubles_until_it_hits_the_ceiling() {
        let runtime = RuntimeConfig::default();
        let delays: Vec<u64> = (1..=7).map(|a| runtime.backoff_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(runtime.backoff_for(200), Duration::from_secs(30));
    }

    #[test]
    fn the_one_where_secrets_stay_secret() {
        let credentials = Credentials {
            username: Some("elastic".into()),
            password: Some("hunter2".into()),
            api_key: None,
        };
        let printed = format!("{credentials:?}");
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("elastic\""));
        assert!(printed.contains("<redacted>"));
    }
}
