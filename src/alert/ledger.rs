use rusqlite::params;
use uuid::Uuid;

use super::{AlertCategory, AlertIntent};
use crate::normalize::EntryId;
use crate::scorer::Severity;
use crate::storage::logs::{format_ts, parse_ts};
use crate::storage::{with_conn, Pool, StoreError};

/// Append-only record of every emitted alert (`alerts` table).
#[derive(Clone)]
pub struct AlertLedger {
    pool: Pool,
}

impl AlertLedger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, intent: &AlertIntent) -> Result<(), StoreError> {
        let intent = intent.clone();
        with_conn(&self.pool, move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO alerts
                 (id, service, category, severity, entry_id, score, suppressed_count, cooldown_until, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    intent.id.to_string(),
                    intent.service,
                    intent.category.as_str(),
                    intent.severity.as_str(),
                    intent.entry_id.as_str(),
                    intent.score,
                    intent.suppressed_count as i64,
                    format_ts(&intent.cooldown_until),
                    format_ts(&intent.created_at)
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<AlertIntent>, StoreError> {
        with_conn(&self.pool, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, service, category, severity, entry_id, score, suppressed_count, cooldown_until, created_at
                 FROM alerts ORDER BY created_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?;

            let mut alerts = Vec::new();
            for row in rows {
                let (id, service, category, severity, entry_id, score, suppressed, until, created) = row?;
                let corrupt = |reason: String| StoreError::Corrupt { id: id.clone(), reason };
                alerts.push(AlertIntent {
                    id: Uuid::parse_str(&id).map_err(|e| corrupt(e.to_string()))?,
                    category: AlertCategory::parse(&category)
                        .ok_or_else(|| corrupt(format!("bad category '{category}'")))?,
                    severity: Severity::parse(&severity)
                        .ok_or_else(|| corrupt(format!("bad severity '{severity}'")))?,
                    cooldown_until: parse_ts(&id, &until)?,
                    created_at: parse_ts(&id, &created)?,
                    service,
                    entry_id: EntryId::from(entry_id),
                    score,
                    suppressed_count: suppressed.max(0) as u64,
                });
            }
            Ok(alerts)
        })
        .await
    }
}
