//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::error::ApiError;
use super::state::AppState;
use crate::index::SearchFilter;
use crate::insight::InsightSummary;
use crate::normalize::{EntryId, Level};
use crate::pipeline::REINDEX_PAGE_SIZE;
use crate::query::QueryOptions;
use crate::storage::LogFilter;

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;
const API_SOURCE: &str = "api";
const DEFAULT_TIMELINE_INTERVAL_MINUTES: u32 = 5;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/logs", get(list_logs).post(ingest_logs))
        .route("/logs/{id}", get(get_log))
        .route("/logs/{id}/summary", get(summarize_log))
        .route("/search", axum::routing::post(search))
        .route("/search/history", get(search_history))
        .route("/analytics/errors", get(analytics_errors))
        .route("/analytics/errors/timeline", get(error_timeline))
        .route("/reindex", axum::routing::post(reindex))
        .route("/dead-letters", get(dead_letters))
        .route("/alerts", get(list_alerts))
}

fn meta() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

fn parse_level(raw: Option<&str>) -> Result<Option<Level>, ApiError> {
    match raw {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => Level::parse(s)
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown level: {s}"))),
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let health = state.pipeline.health().current();
    Json(json!({
        "data": {
            "status": if health.is_healthy() { "ok" } else { "degraded" },
            "health": health,
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let parts = state.pipeline.parts();
    let depth = parts.queue.depth().await?;
    let stored = parts.store.count().await?;
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0);

    Ok(Json(json!({
        "data": {
            "health": state.pipeline.health().current(),
            "pipeline": state.pipeline.stats().snapshot(),
            "queue": depth,
            "stored_entries": stored,
            "index": {
                "entries": parts.index.len(),
                "dimension": parts.index.dimension(),
                "metric": parts.index.metric(),
            },
            "embedding": parts.embedder.stats().await,
            "alerts": parts.dispatcher.stats(),
            "scorer": {
                "services": parts.scorer.snapshot(),
                "soft_anomalies": parts.scorer.soft_anomaly_count(),
            },
            "uptime_secs": uptime_secs,
        },
        "meta": meta()
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogsParams {
    level: Option<String>,
    service: Option<String>,
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_logs(
    State(state): State<AppState>,
    Query(params): Query<LogsParams>,
) -> Result<Json<Value>, ApiError> {
    let filter = LogFilter {
        service: params.service.filter(|s| !s.trim().is_empty()),
        level: parse_level(params.level.as_deref())?,
        since: params.since,
        limit: Some(clamp_limit(params.limit)),
        offset: params.offset,
    };
    let entries = state.pipeline.parts().store.query(&filter).await?;
    Ok(Json(json!({
        "data": entries,
        "meta": { "total": entries.len(), "timestamp": Utc::now().to_rfc3339() }
    })))
}

async fn get_log(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let id = EntryId::from(id);
    match state.pipeline.parts().store.get(&id).await? {
        Some(entry) => Ok(Json(json!({
            "data": {
                "entry": entry,
                "indexed": state.pipeline.parts().index.contains(&id),
            },
            "meta": meta()
        }))),
        None => Err(ApiError::NotFound(format!("no log entry {id}"))),
    }
}

async fn summarize_log(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let id = EntryId::from(id);
    let parts = state.pipeline.parts();
    let entry = parts
        .store
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no log entry {id}")))?;
    let summary = parts
        .embedder
        .provider()
        .summarize(&entry.embedding_text())
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    Ok(Json(json!({ "data": { "id": id, "summary": summary }, "meta": meta() })))
}

/// Accepts one JSON log object or an array of them. Strings are taken as
/// raw log lines.
async fn ingest_logs(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let items = match body {
        Value::Array(items) => items,
        other => vec![other],
    };
    if items.is_empty() {
        return Err(ApiError::BadRequest("no log records in request".into()));
    }

    // Encode the whole batch before enqueueing any of it.
    let payloads = items
        .into_iter()
        .map(|item| match item {
            Value::String(line) => Ok(line.into_bytes()),
            other => serde_json::to_vec(&other).map_err(|e| ApiError::BadRequest(e.to_string())),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let queue = &state.pipeline.parts().queue;
    let total = payloads.len();
    let mut accepted = 0usize;
    for payload in payloads {
        if let Err(e) = queue.enqueue(API_SOURCE, payload).await {
            if accepted == 0 {
                return Err(e.into());
            }
            warn!(accepted, total, error = %e, "batch only partly accepted");
            return Err(ApiError::PartiallyAccepted {
                accepted,
                message: format!("accepted {accepted} of {total} records: {e}"),
            });
        }
        accepted += 1;
    }
    info!(accepted, "logs accepted over http");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": { "accepted": accepted }, "meta": meta() })),
    ))
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    min_level: Option<String>,
    #[serde(default)]
    since: Option<DateTime<Utc>>,
    #[serde(default)]
    until: Option<DateTime<Utc>>,
    #[serde(default)]
    prioritize_failures: Option<bool>,
}

async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<Value>, ApiError> {
    let options = QueryOptions {
        k: req.k,
        filter: SearchFilter {
            service: req.service.filter(|s| !s.trim().is_empty()),
            min_level: parse_level(req.min_level.as_deref())?,
            since: req.since,
            until: req.until,
        },
        prioritize_failures: req.prioritize_failures,
    };
    let hits = state.query.query(&req.query, options).await?;

    // Hits carry only index metadata; attach the stored message for display.
    let store = &state.pipeline.parts().store;
    let entries = try_join_all(hits.iter().map(|hit| store.get(&hit.entry_id))).await?;
    let results: Vec<Value> = hits
        .into_iter()
        .zip(entries)
        .map(|(hit, entry)| {
            json!({
                "entry_id": hit.entry_id,
                "score": hit.score,
                "service": hit.metadata.service,
                "level": hit.metadata.level,
                "timestamp": hit.metadata.timestamp,
                "message": entry.map(|e| e.message),
            })
        })
        .collect();

    Ok(Json(json!({
        "data": results,
        "meta": { "total": results.len(), "query": req.query, "timestamp": Utc::now().to_rfc3339() }
    })))
}

async fn search_history(State(state): State<AppState>) -> Json<Value> {
    let history = state.query.history().await;
    Json(json!({ "data": history, "meta": { "total": history.len() } }))
}

async fn analytics_errors(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let counts = state.pipeline.parts().store.level_counts().await?;
    let summary = InsightSummary::from_counts(&counts);
    Ok(Json(json!({ "data": summary, "meta": meta() })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TimelineParams {
    start_time: Option<DateTime<Utc>>,
    interval_minutes: Option<u32>,
}

/// ERROR and FATAL entries per time bucket, latest bucket first.
async fn error_timeline(
    State(state): State<AppState>,
    Query(params): Query<TimelineParams>,
) -> Result<Json<Value>, ApiError> {
    let interval_minutes = params.interval_minutes.unwrap_or(DEFAULT_TIMELINE_INTERVAL_MINUTES);
    if interval_minutes == 0 {
        return Err(ApiError::BadRequest("interval_minutes must be at least 1".into()));
    }
    let timeline = state
        .pipeline
        .parts()
        .store
        .error_timeline(params.start_time, interval_minutes)
        .await?;
    Ok(Json(json!({
        "data": {
            "interval_minutes": interval_minutes,
            "total_intervals": timeline.len(),
            "timeline": timeline,
        },
        "meta": meta()
    })))
}

/// Re-embed stored entries that are missing from the index.
async fn reindex(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let report = state
        .pipeline
        .reindex(REINDEX_PAGE_SIZE, &CancellationToken::new())
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    info!(reindexed = report.reindexed, still_missing = report.still_missing, "reindex requested over http");
    Ok(Json(json!({ "data": report, "meta": meta() })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LimitParams {
    limit: Option<usize>,
}

async fn dead_letters(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Value>, ApiError> {
    let letters = state
        .pipeline
        .parts()
        .queue
        .dead_letters(clamp_limit(params.limit))
        .await?;
    Ok(Json(json!({ "data": letters, "meta": { "total": letters.len() } })))
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Value>, ApiError> {
    let Some(ledger) = &state.ledger else {
        return Ok(Json(json!({ "data": [], "meta": { "total": 0, "message": "alert ledger disabled" } })));
    };
    let alerts = ledger.list_recent(clamp_limit(params.limit)).await?;
    Ok(Json(json!({ "data": alerts, "meta": { "total": alerts.len() } })))
}
