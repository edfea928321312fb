//! LogInsight -- log ingestion with anomaly alerting and semantic search.
//!
//! Raw log records are normalized, persisted, scored against per-service
//! baselines, embedded and indexed for similarity search. Alert-worthy
//! entries are turned into rate-limited alerts.

pub mod alert;
pub mod api;
pub mod config;
pub mod embedding;
pub mod index;
pub mod insight;
pub mod normalize;
pub mod pipeline;
pub mod query;
pub mod queue;
pub mod retry;
pub mod scorer;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::alert::{AlertIntent, AlertLedger, AlertTransport, Dispatcher, LogTransport, WebhookTransport};
use crate::config::{
    AlertsConfig, EmbeddingConfig, LogFormat, LogInsightConfig, LoggingConfig, ProviderKind, TransportKind,
};
use crate::embedding::providers::{HashingEmbeddingProvider, HttpEmbeddingProvider};
use crate::embedding::{EmbeddingClient, EmbeddingProvider};
use crate::index::VectorIndex;
use crate::pipeline::{Pipeline, PipelineParts, REINDEX_PAGE_SIZE};
use crate::query::SemanticQueryService;
use crate::queue::SpoolQueue;
use crate::scorer::AnomalyScorer;
use crate::storage::{Pool, SqliteLogStore};

/// Install the global tracing subscriber. `RUST_LOG` takes precedence over
/// the configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    // A subscriber may already be installed (tests, embedding callers).
    let _ = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
}

/// Construct the configured embedding provider.
pub fn build_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider {
        ProviderKind::Hashing => Ok(Arc::new(HashingEmbeddingProvider::new(config.dimension))),
        ProviderKind::Http => {
            let endpoint = config
                .endpoint
                .clone()
                .context("embedding.endpoint is required for the http provider")?;
            let api_key = std::env::var(&config.api_key_env).ok();
            if api_key.is_none() {
                warn!(env = %config.api_key_env, "no API key in environment, calling provider unauthenticated");
            }
            let provider = HttpEmbeddingProvider::new(
                endpoint,
                config.chat_endpoint.clone(),
                config.model.clone(),
                api_key,
                Duration::from_millis(config.request_timeout_ms),
            )?;
            Ok(Arc::new(provider))
        }
    }
}

/// Construct the configured alert transport.
pub fn build_transport(config: &AlertsConfig) -> Result<Arc<dyn AlertTransport>> {
    match config.transport {
        TransportKind::Log => Ok(Arc::new(LogTransport)),
        TransportKind::Webhook => {
            let url = config
                .webhook_url
                .clone()
                .context("alerts.webhook_url is required for the webhook transport")?;
            let transport = WebhookTransport::new(url, Duration::from_millis(config.webhook_timeout_ms))?;
            Ok(Arc::new(transport))
        }
    }
}

/// Build the vector index, reloading persisted vectors when persistence is on.
pub async fn open_index(config: &LogInsightConfig, pool: &Pool) -> Result<Arc<VectorIndex>> {
    let index = Arc::new(VectorIndex::new(config.embedding.dimension, config.index.metric));
    if config.index.persist {
        let rows = storage::vectors::load(pool).await?;
        let restored = index.restore(rows).context("persisted vector index is corrupt")?;
        info!(restored, "vector index restored");
    }
    Ok(index)
}

/// The assembled daemon components, wired to one SQLite database.
pub struct Services {
    pub pool: Pool,
    pub pipeline: Arc<Pipeline>,
    pub query: Arc<SemanticQueryService>,
    pub ledger: AlertLedger,
    pub alerts: mpsc::Receiver<AlertIntent>,
}

impl Services {
    pub async fn build(config: &LogInsightConfig) -> Result<Self> {
        let db_path = &config.storage.db_path;
        info!(db_path = %db_path.display(), "initializing database");
        let pool = storage::open_pool(db_path, config.storage.pool_size)?;

        let queue = Arc::new(SpoolQueue::new(
            pool.clone(),
            config.ingest.max_deliveries,
            Duration::from_secs(config.ingest.visibility_timeout_secs),
            Duration::from_millis(config.ingest.poll_interval_ms),
        ));
        let store = Arc::new(SqliteLogStore::new(pool.clone()));
        let embedder = Arc::new(EmbeddingClient::new(build_provider(&config.embedding)?, &config.embedding));
        let index = open_index(config, &pool).await?;
        let (dispatcher, alerts) = Dispatcher::new(config.alerts.cooldown_secs, config.alerts.outbound_capacity);

        let parts = PipelineParts {
            queue,
            store,
            scorer: Arc::new(AnomalyScorer::new(config.scorer.clone())),
            embedder: Arc::clone(&embedder),
            index: Arc::clone(&index),
            dispatcher: Arc::new(dispatcher),
            vector_pool: config.index.persist.then(|| pool.clone()),
        };
        let pipeline = Arc::new(Pipeline::new(config.ingest.clone(), parts));
        let query = Arc::new(SemanticQueryService::new(
            embedder,
            index,
            config.api.history_len,
            config.index.default_k,
            config.index.max_k,
            config.api.prioritize_failures,
        ));

        Ok(Self {
            ledger: AlertLedger::new(pool.clone()),
            pool,
            pipeline,
            query,
            alerts,
        })
    }
}

/// Start the LogInsight daemon: ingestion workers, alert delivery, reindex
/// sweeps and the HTTP API. Returns after Ctrl-C once in-flight work has
/// stopped.
pub async fn serve(config: LogInsightConfig) -> Result<()> {
    let Services {
        pool,
        pipeline,
        query,
        ledger,
        alerts,
    } = Services::build(&config).await?;

    let cancel = CancellationToken::new();

    // 1. Alert delivery
    let transport = build_transport(&config.alerts)?;
    let delivery_cancel = CancellationToken::new();
    let delivery = tokio::spawn(alert::run_delivery(
        alerts,
        transport,
        Some(ledger.clone()),
        delivery_cancel.clone(),
    ));

    // 2. Ingestion workers
    let workers = tokio::spawn(Arc::clone(&pipeline).run(config.ingest.workers, cancel.clone()));

    // 3. Reindex sweeps for entries stored without a vector
    let sweeps = tokio::spawn(Arc::clone(&pipeline).run_reindex_sweeps(
        Duration::from_secs(config.ingest.reindex_interval_secs),
        REINDEX_PAGE_SIZE,
        cancel.clone(),
    ));

    // 4. API server
    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.api.bind))?;
    let app = api::router(api::state::AppState::new(Arc::clone(&pipeline), query, Some(ledger)));

    info!(%addr, "LogInsight listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        shutdown.cancel();
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await?;

    if let Err(e) = workers.await {
        warn!(error = %e, "pipeline task ended abnormally");
    }
    if let Err(e) = sweeps.await {
        warn!(error = %e, "reindex task ended abnormally");
    }
    delivery_cancel.cancel();
    if let Err(e) = delivery.await {
        warn!(error = %e, "alert delivery task ended abnormally");
    }

    if config.index.persist {
        let saved = storage::vectors::snapshot(&pool, &pipeline.parts().index).await?;
        info!(saved, "vector index snapshot written");
    }
    info!(stats = ?pipeline.stats().snapshot(), "LogInsight stopped");
    Ok(())
}
