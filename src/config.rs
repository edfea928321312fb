//! TOML configuration for the loginsight daemon.
//!
//! Layered model: an explicit path wins, then the `LOGINSIGHT_CONFIG`
//! environment variable, then `/etc/loginsight/loginsight.toml`, then the
//! compiled-in defaults. Every section is optional.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::index::Metric;
use crate::retry::RetryPolicy;
use crate::scorer::FeatureSource;

pub const CONFIG_ENV: &str = "LOGINSIGHT_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/loginsight/loginsight.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogInsightConfig {
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub scorer: ScorerConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl LogInsightConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the effective configuration.
    ///
    /// An explicit path must load; the environment and system locations
    /// fall through to the next layer on failure.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "LOGINSIGHT_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.ingest.workers == 0 {
            bail!("ingest.workers must be at least 1");
        }
        if self.embedding.dimension == 0 {
            bail!("embedding.dimension must be at least 1");
        }
        if self.embedding.max_concurrent_calls == 0 {
            bail!("embedding.max_concurrent_calls must be at least 1");
        }
        if self.embedding.retry.max_attempts == 0 {
            bail!("embedding.retry.max_attempts must be at least 1");
        }
        if !(self.scorer.alert_threshold > 0.0) {
            bail!("scorer.alert_threshold must be positive");
        }
        if !(self.scorer.alpha > 0.0 && self.scorer.alpha <= 1.0) {
            bail!("scorer.alpha must be in (0, 1]");
        }
        if !(self.scorer.min_std_dev > 0.0) {
            bail!("scorer.min_std_dev must be positive");
        }
        if self.alerts.outbound_capacity == 0 {
            bail!("alerts.outbound_capacity must be at least 1");
        }
        if self.alerts.transport == TransportKind::Webhook && self.alerts.webhook_url.is_none() {
            bail!("alerts.webhook_url is required for the webhook transport");
        }
        if self.embedding.provider == ProviderKind::Http && self.embedding.endpoint.is_none() {
            bail!("embedding.endpoint is required for the http provider");
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration")
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// What to do with a record whose embedding could not be computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingFailureMode {
    /// Acknowledge the record as scored but not searchable.
    Degrade,
    DeadLetter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Number of concurrent pipeline workers.
    pub workers: usize,
    /// Width of the timestamp bucket folded into entry ids (seconds).
    pub bucket_secs: u64,
    pub on_embedding_failure: EmbeddingFailureMode,
    /// Deliveries after which a message is dead-lettered instead of retried.
    pub max_deliveries: u32,
    /// Lease length for spooled messages (seconds).
    pub visibility_timeout_secs: u64,
    /// Idle wait between empty spool polls (milliseconds).
    pub poll_interval_ms: u64,
    /// Period of the sweep that re-embeds stored entries missing from the
    /// index (seconds). 0 disables it.
    pub reindex_interval_secs: u64,
    /// Backoff applied to the worker pool while the pipeline is degraded.
    pub systemic_backoff: RetryPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            bucket_secs: 60,
            on_embedding_failure: EmbeddingFailureMode::Degrade,
            max_deliveries: 5,
            visibility_timeout_secs: 30,
            poll_interval_ms: 250,
            reindex_interval_secs: 300,
            systemic_backoff: RetryPolicy {
                max_attempts: u32::MAX,
                base_delay_ms: 500,
                multiplier: 2,
                max_delay_ms: 30_000,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Embedding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Local feature-hashing embeddings; no network.
    Hashing,
    /// OpenAI-compatible HTTP endpoint.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: ProviderKind,
    pub endpoint: Option<String>,
    /// Chat completions endpoint used by `summarize`.
    pub chat_endpoint: Option<String>,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub dimension: usize,
    /// Concurrent provider calls allowed before callers wait.
    pub max_concurrent_calls: usize,
    pub cache_capacity: usize,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Hashing,
            endpoint: None,
            chat_endpoint: None,
            model: "text-embedding-3-small".to_string(),
            api_key_env: "LOGINSIGHT_API_KEY".to_string(),
            dimension: 256,
            max_concurrent_calls: 8,
            cache_capacity: 10_000,
            request_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub metric: Metric,
    /// Write every insert through to the `index_vectors` table and restore
    /// it at startup.
    pub persist: bool,
    pub default_k: usize,
    pub max_k: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Cosine,
            persist: true,
            default_k: 10,
            max_k: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Scorer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// Samples required before z-scores apply.
    pub min_samples: u64,
    /// Weight of the newest sample in the rolling mean and variance.
    pub alpha: f64,
    pub alert_threshold: f64,
    /// Floor for the standard deviation used in z-scores.
    pub min_std_dev: f64,
    /// Score assigned to messages containing failure keywords.
    pub keyword_score: f64,
    /// Numeric signal tracked per service.
    pub feature: FeatureSource,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            min_samples: 5,
            alpha: 0.3,
            alert_threshold: 3.0,
            min_std_dev: 0.5,
            keyword_score: 1.5,
            feature: FeatureSource::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Log,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Minimum interval between alerts for one (service, category) key.
    pub cooldown_secs: u64,
    /// Bound of the outbound alert queue.
    pub outbound_capacity: usize,
    pub transport: TransportKind,
    pub webhook_url: Option<String>,
    pub webhook_timeout_ms: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 600,
            outbound_capacity: 256,
            transport: TransportKind::Log,
            webhook_url: None,
            webhook_timeout_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub pool_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/loginsight/loginsight.db"),
            pool_size: 8,
        }
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    /// Number of recent queries kept for `/search/history`.
    pub history_len: usize,
    /// Default for restricting failure-worded queries to ERROR and above.
    pub prioritize_failures: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            history_len: 10,
            prioritize_failures: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level; `RUST_LOG` overrides it.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = LogInsightConfig::default();
        assert!(cfg.validate().is_ok());

        assert_eq!(cfg.ingest.workers, 4);
        assert_eq!(cfg.ingest.bucket_secs, 60);
        assert_eq!(cfg.ingest.on_embedding_failure, EmbeddingFailureMode::Degrade);

        assert_eq!(cfg.embedding.provider, ProviderKind::Hashing);
        assert_eq!(cfg.embedding.retry.max_attempts, 3);
        assert_eq!(cfg.embedding.retry.base_delay_ms, 200);
        assert_eq!(cfg.embedding.retry.max_delay_ms, 2_000);

        assert_eq!(cfg.index.metric, Metric::Cosine);
        assert!(cfg.index.persist);

        assert_eq!(cfg.scorer.min_samples, 5);
        assert_eq!(cfg.scorer.alert_threshold, 3.0);
        assert!(matches!(cfg.scorer.feature, FeatureSource::LogRate { window_secs: 60 }));

        assert_eq!(cfg.alerts.cooldown_secs, 600);
        assert_eq!(cfg.alerts.transport, TransportKind::Log);

        assert_eq!(cfg.api.history_len, 10);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[ingest]
workers = 8
on_embedding_failure = "dead_letter"

[embedding]
provider = "http"
endpoint = "http://127.0.0.1:9000/v1/embeddings"
dimension = 1536

[embedding.retry]
max_attempts = 5

[index]
metric = "euclidean"
persist = false

[scorer]
alert_threshold = 4.5

[scorer.feature]
kind = "field"
name = "latency_ms"

[alerts]
cooldown_secs = 60
transport = "webhook"
webhook_url = "http://hooks.local/alerts"

[storage]
db_path = "/tmp/li.db"

[logging]
level = "debug"
format = "json"
"#;

        let cfg: LogInsightConfig = toml::from_str(toml_str).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.ingest.workers, 8);
        assert_eq!(cfg.ingest.on_embedding_failure, EmbeddingFailureMode::DeadLetter);
        assert_eq!(cfg.embedding.provider, ProviderKind::Http);
        assert_eq!(cfg.embedding.dimension, 1536);
        assert_eq!(cfg.embedding.retry.max_attempts, 5);
        // Unset retry fields keep their defaults.
        assert_eq!(cfg.embedding.retry.base_delay_ms, 200);
        assert_eq!(cfg.index.metric, Metric::Euclidean);
        assert!(!cfg.index.persist);
        assert_eq!(cfg.scorer.alert_threshold, 4.5);
        assert_eq!(
            cfg.scorer.feature,
            FeatureSource::Field { name: "latency_ms".into() }
        );
        assert_eq!(cfg.alerts.cooldown_secs, 60);
        assert_eq!(cfg.alerts.transport, TransportKind::Webhook);
        assert_eq!(cfg.storage.db_path, PathBuf::from("/tmp/li.db"));
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: LogInsightConfig = toml::from_str("[api]\nbind = \"127.0.0.1:9999\"\n").unwrap();
        assert_eq!(cfg.api.bind, "127.0.0.1:9999");
        assert_eq!(cfg.api.history_len, 10);
        assert_eq!(cfg.ingest.workers, 4);
        assert_eq!(cfg.alerts.cooldown_secs, 600);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let cfg: LogInsightConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.embedding.dimension, EmbeddingConfig::default().dimension);
        assert_eq!(cfg.storage.pool_size, 8);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = LogInsightConfig::default();
        cfg.ingest.workers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = LogInsightConfig::default();
        cfg.embedding.dimension = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = LogInsightConfig::default();
        cfg.scorer.alert_threshold = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = LogInsightConfig::default();
        cfg.alerts.transport = TransportKind::Webhook;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file_and_render() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loginsight.toml");
        std::fs::write(&path, "[ingest]\nworkers = 2\n").unwrap();

        let cfg = LogInsightConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.ingest.workers, 2);

        let rendered = cfg.to_toml_string().unwrap();
        let reparsed: LogInsightConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(reparsed.ingest.workers, 2);
        assert_eq!(reparsed.scorer.feature, cfg.scorer.feature);
    }

    #[test]
    fn test_explicit_missing_path_is_error() {
        assert!(LogInsightConfig::resolve(Some(Path::new("/nonexistent/loginsight.toml"))).is_err());
    }
}
