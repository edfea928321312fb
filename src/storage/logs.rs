//! Persisted store for normalized entries, keyed by entry id.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{with_conn, Pool, StoreError};
use crate::normalize::{EntryId, Fields, Level, NormalizedLogEntry};

/// Result of an idempotent upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// First time this entry id was stored.
    Inserted,
    /// The id existed with different content; the row was replaced.
    Updated,
    /// The id existed with identical content; nothing changed.
    Unchanged,
}

/// Reporting query over stored entries. Newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFilter {
    pub service: Option<String>,
    /// Exact level match.
    pub level: Option<Level>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    /// Rows to skip, for paging.
    pub offset: Option<usize>,
}

/// Number of stored entries for one (service, level) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelCount {
    pub service: String,
    pub level: Level,
    pub count: u64,
}

/// Error-level entries in one time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineBucket {
    /// Start of the bucket.
    pub timestamp: DateTime<Utc>,
    pub error_count: u64,
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn put(&self, entry: &NormalizedLogEntry) -> Result<PutOutcome, StoreError>;
    async fn get(&self, id: &EntryId) -> Result<Option<NormalizedLogEntry>, StoreError>;
    async fn query(&self, filter: &LogFilter) -> Result<Vec<NormalizedLogEntry>, StoreError>;
    async fn count(&self) -> Result<u64, StoreError>;
    /// Entry counts grouped by service and level.
    async fn level_counts(&self) -> Result<Vec<LevelCount>, StoreError>;
    /// ERROR and FATAL entries at or after `since`, counted per
    /// `interval_minutes` bucket. Latest bucket first.
    async fn error_timeline(
        &self,
        since: Option<DateTime<Utc>>,
        interval_minutes: u32,
    ) -> Result<Vec<TimelineBucket>, StoreError>;
}

pub struct SqliteLogStore {
    pool: Pool,
}

impl SqliteLogStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

/// Fixed-width RFC 3339 so text order matches time order.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("bad timestamp '{raw}': {e}"),
        })
}

pub(crate) fn parse_level(id: &str, raw: &str) -> Result<Level, StoreError> {
    Level::parse(raw).ok_or_else(|| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("bad level '{raw}'"),
    })
}

const SELECT_COLUMNS: &str = "SELECT id, timestamp, service, level, message, fields_json FROM log_entries";

struct StoredRow {
    id: String,
    timestamp: String,
    service: String,
    level: String,
    message: String,
    fields_json: String,
}

impl StoredRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            service: row.get(2)?,
            level: row.get(3)?,
            message: row.get(4)?,
            fields_json: row.get(5)?,
        })
    }

    fn into_entry(self) -> Result<NormalizedLogEntry, StoreError> {
        let timestamp = parse_ts(&self.id, &self.timestamp)?;
        let level = parse_level(&self.id, &self.level)?;
        let fields: Fields = serde_json::from_str(&self.fields_json)?;
        Ok(NormalizedLogEntry {
            id: EntryId::from(self.id),
            timestamp,
            service: self.service,
            level,
            message: self.message,
            fields,
        })
    }
}

fn get_entry(conn: &Connection, id: &str) -> Result<Option<NormalizedLogEntry>, StoreError> {
    let row = conn
        .query_row(&format!("{SELECT_COLUMNS} WHERE id = ?1"), params![id], StoredRow::read)
        .optional()?;
    row.map(StoredRow::into_entry).transpose()
}

fn put_entry(conn: &mut Connection, entry: &NormalizedLogEntry) -> Result<PutOutcome, StoreError> {
    let fields_json = serde_json::to_string(&entry.fields)?;
    let tx = conn.transaction()?;

    let inserted = tx.execute(
        "INSERT INTO log_entries (id, timestamp, service, level, message, fields_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO NOTHING",
        params![
            entry.id.as_str(),
            format_ts(&entry.timestamp),
            entry.service,
            entry.level.as_str(),
            entry.message,
            fields_json
        ],
    )?;

    let outcome = if inserted == 1 {
        PutOutcome::Inserted
    } else if get_entry(&tx, entry.id.as_str())?.as_ref() == Some(entry) {
        PutOutcome::Unchanged
    } else {
        tx.execute(
            "UPDATE log_entries
             SET timestamp = ?2, service = ?3, level = ?4, message = ?5, fields_json = ?6
             WHERE id = ?1",
            params![
                entry.id.as_str(),
                format_ts(&entry.timestamp),
                entry.service,
                entry.level.as_str(),
                entry.message,
                fields_json
            ],
        )?;
        PutOutcome::Updated
    };

    tx.commit()?;
    Ok(outcome)
}

fn query_entries(conn: &Connection, filter: &LogFilter) -> Result<Vec<NormalizedLogEntry>, StoreError> {
    let mut sql = format!("{SELECT_COLUMNS} WHERE 1 = 1");
    let mut args: Vec<String> = Vec::new();

    if let Some(service) = &filter.service {
        args.push(service.clone());
        sql.push_str(&format!(" AND service = ?{} COLLATE NOCASE", args.len()));
    }
    if let Some(level) = filter.level {
        args.push(level.as_str().to_string());
        sql.push_str(&format!(" AND level = ?{}", args.len()));
    }
    if let Some(since) = &filter.since {
        args.push(format_ts(since));
        sql.push_str(&format!(" AND timestamp >= ?{}", args.len()));
    }
    sql.push_str(" ORDER BY timestamp DESC, id ASC");
    match (filter.limit, filter.offset) {
        (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
        (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
        (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
        (None, None) => {}
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), StoredRow::read)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?.into_entry()?);
    }
    Ok(entries)
}

fn count_levels(conn: &Connection) -> Result<Vec<LevelCount>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT service, level, COUNT(*) FROM log_entries
         GROUP BY service, level
         ORDER BY service, level",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
    })?;

    let mut counts = Vec::new();
    for row in rows {
        let (service, level, count) = row?;
        counts.push(LevelCount {
            level: parse_level(&service, &level)?,
            service,
            count: count.max(0) as u64,
        });
    }
    Ok(counts)
}

fn bucket_errors(
    conn: &Connection,
    since: Option<&DateTime<Utc>>,
    interval_minutes: u32,
) -> Result<Vec<TimelineBucket>, StoreError> {
    let width = i64::from(interval_minutes.max(1)) * 60;
    // Stored timestamps are fixed-width RFC 3339; the first 19 characters
    // are the second-resolution UTC time strftime understands.
    let mut sql = String::from(
        "SELECT (CAST(strftime('%s', substr(timestamp, 1, 19)) AS INTEGER) / ?1) * ?1 AS bucket, COUNT(*)
         FROM log_entries
         WHERE level IN ('ERROR', 'FATAL')",
    );
    let since = since.map(format_ts);
    if since.is_some() {
        sql.push_str(" AND timestamp >= ?2");
    }
    sql.push_str(" GROUP BY bucket ORDER BY bucket DESC");

    let mut stmt = conn.prepare(&sql)?;
    let read = |row: &Row<'_>| -> rusqlite::Result<(i64, i64)> { Ok((row.get(0)?, row.get(1)?)) };
    let rows = match &since {
        Some(since) => stmt.query_map(params![width, since], read)?,
        None => stmt.query_map(params![width], read)?,
    };

    let mut buckets = Vec::new();
    for row in rows {
        let (start, count) = row?;
        let timestamp = Utc.timestamp_opt(start, 0).single().ok_or_else(|| StoreError::Corrupt {
            id: format!("bucket {start}"),
            reason: "timestamp out of range".into(),
        })?;
        buckets.push(TimelineBucket {
            timestamp,
            error_count: count.max(0) as u64,
        });
    }
    Ok(buckets)
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn put(&self, entry: &NormalizedLogEntry) -> Result<PutOutcome, StoreError> {
        let entry = entry.clone();
        with_conn(&self.pool, move |conn| put_entry(conn, &entry)).await
    }

    async fn get(&self, id: &EntryId) -> Result<Option<NormalizedLogEntry>, StoreError> {
        let id = id.as_str().to_string();
        with_conn(&self.pool, move |conn| get_entry(conn, &id)).await
    }

    async fn query(&self, filter: &LogFilter) -> Result<Vec<NormalizedLogEntry>, StoreError> {
        let filter = filter.clone();
        with_conn(&self.pool, move |conn| query_entries(conn, &filter)).await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        with_conn(&self.pool, |conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM log_entries", [], |r| r.get(0))?;
            Ok(n.max(0) as u64)
        })
        .await
    }

    async fn level_counts(&self) -> Result<Vec<LevelCount>, StoreError> {
        with_conn(&self.pool, |conn| count_levels(conn)).await
    }

    async fn error_timeline(
        &self,
        since: Option<DateTime<Utc>>,
        interval_minutes: u32,
    ) -> Result<Vec<TimelineBucket>, StoreError> {
        with_conn(&self.pool, move |conn| bucket_errors(conn, since.as_ref(), interval_minutes)).await
    }
}
