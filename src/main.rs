use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use loginsight::config::LogInsightConfig;
use loginsight::embedding::EmbeddingClient;
use loginsight::index::SearchFilter;
use loginsight::normalize::Level;
use loginsight::query::{QueryOptions, SemanticQueryService};
use loginsight::queue::{LogQueue, SpoolQueue};
use loginsight::storage::{self, LogStore, SqliteLogStore};

#[derive(Parser)]
#[command(
    name = "loginsight",
    about = "Log ingestion with anomaly alerting and semantic search",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults: $LOGINSIGHT_CONFIG, then /etc/loginsight/loginsight.toml)
    #[arg(long, global = true, env = "LOGINSIGHT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (ingestion workers + alert delivery + API server)
    Serve {
        /// Bind address, overriding the configured one
        #[arg(long)]
        bind: Option<String>,
    },

    /// Enqueue newline-delimited log records from a file ("-" for stdin)
    Ingest {
        /// NDJSON or plain log lines
        file: PathBuf,
    },

    /// Search indexed log entries by meaning
    Query {
        /// Free-text query
        text: String,

        /// Number of results
        #[arg(short, long)]
        k: Option<usize>,

        /// Restrict to one service
        #[arg(long)]
        service: Option<String>,

        /// Only entries at or above this level
        #[arg(long)]
        min_level: Option<String>,

        /// Restrict failure-worded queries to ERROR and above
        #[arg(long)]
        failures: bool,
    },

    /// Re-embed stored entries missing from the persisted vector index
    Reindex,

    /// List dead-lettered records
    DeadLetters {
        /// Maximum records to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = LogInsightConfig::resolve(cli.config.as_deref())?;
    loginsight::init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting LogInsight daemon");
            loginsight::serve(config).await?;
        }
        Commands::Ingest { file } => {
            let pool = storage::open_pool(&config.storage.db_path, config.storage.pool_size)?;
            let queue = spool(&config, pool);

            let reader: Box<dyn BufRead> = if file.as_os_str() == "-" {
                Box::new(BufReader::new(std::io::stdin()))
            } else {
                let f = std::fs::File::open(&file)
                    .with_context(|| format!("failed to open {}", file.display()))?;
                Box::new(BufReader::new(f))
            };
            let source = file.display().to_string();

            let mut enqueued = 0usize;
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                queue.enqueue(&source, line.into_bytes()).await?;
                enqueued += 1;
            }
            println!("Enqueued {} record(s) from {}.", enqueued, source);
        }
        Commands::Query {
            text,
            k,
            service,
            min_level,
            failures,
        } => {
            let min_level = match min_level {
                Some(raw) => Some(Level::parse(&raw).with_context(|| format!("unknown level: {raw}"))?),
                None => None,
            };
            let pool = storage::open_pool(&config.storage.db_path, config.storage.pool_size)?;
            let index = loginsight::open_index(&config, &pool).await?;
            let provider = loginsight::build_provider(&config.embedding)?;
            let embedder = Arc::new(EmbeddingClient::new(provider, &config.embedding));
            let svc = SemanticQueryService::new(
                embedder,
                index,
                config.api.history_len,
                config.index.default_k,
                config.index.max_k,
                config.api.prioritize_failures,
            );
            let options = QueryOptions {
                k,
                filter: SearchFilter {
                    service,
                    min_level,
                    ..SearchFilter::default()
                },
                prioritize_failures: failures.then_some(true),
            };
            let hits = svc.query(&text, options).await?;

            if hits.is_empty() {
                println!("No matching log entries.");
            } else {
                let store = SqliteLogStore::new(pool);
                println!("{:<7} | {:<5} | {:<16} | Message", "Score", "Level", "Service");
                println!("{:-<7}-|-{:-<5}-|-{:-<16}-|-{:-<40}", "", "", "", "");
                for hit in hits {
                    let message = store
                        .get(&hit.entry_id)
                        .await?
                        .map(|e| e.message)
                        .unwrap_or_else(|| hit.entry_id.to_string());
                    println!(
                        "{:<7.3} | {:<5} | {:<16} | {}",
                        hit.score, hit.metadata.level, hit.metadata.service, message
                    );
                }
            }
        }
        Commands::Reindex => {
            if !config.index.persist {
                anyhow::bail!("index.persist is off; the daemon reindexes its in-memory index on its sweep interval");
            }
            let services = loginsight::Services::build(&config).await?;
            let report = services
                .pipeline
                .reindex(loginsight::pipeline::REINDEX_PAGE_SIZE, &CancellationToken::new())
                .await?;
            println!(
                "Reindexed {} of {} stored entries ({} still missing).",
                report.reindexed, report.scanned, report.still_missing
            );
        }
        Commands::DeadLetters { limit } => {
            let pool = storage::open_pool(&config.storage.db_path, config.storage.pool_size)?;
            let letters = spool(&config, pool).dead_letters(limit).await?;
            if letters.is_empty() {
                println!("No dead-lettered records.");
            } else {
                println!("{:<6} | {:<25} | {:<10} | Reason", "ID", "When", "Deliveries");
                println!("{:-<6}-|-{:-<25}-|-{:-<10}-|-{:-<40}", "", "", "", "");
                for letter in letters {
                    println!(
                        "{:<6} | {:<25} | {:<10} | {}",
                        letter.id,
                        letter.dead_lettered_at.to_rfc3339(),
                        letter.deliveries,
                        letter.reason
                    );
                }
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(())
}

fn spool(config: &LogInsightConfig, pool: storage::Pool) -> SpoolQueue {
    SpoolQueue::new(
        pool,
        config.ingest.max_deliveries,
        Duration::from_secs(config.ingest.visibility_timeout_secs),
        Duration::from_millis(config.ingest.poll_interval_ms),
    )
}
