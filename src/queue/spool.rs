//! SQLite-backed ingestion spool.
//!
//! Payloads are written here on arrival and survive restarts. A receive
//! leases the oldest visible row; ack deletes it, nack either releases the
//! lease or moves the row to `dead_letters`. Rows that keep failing are
//! dead-lettered once they reach the delivery limit instead of looping.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::warn;

use super::{new_token, DeadLetter, LogQueue, NackAction, QueueDepth, QueueError, MAX_DELIVERIES_REASON};
use crate::normalize::{DeliveryToken, RawLogRecord};
use crate::storage::logs::parse_ts;
use crate::storage::{with_conn, Pool, StoreError};

pub struct SpoolQueue {
    pool: Pool,
    max_deliveries: u32,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn move_to_dead_letters(tx: &Transaction<'_>, id: i64, reason: &str) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO dead_letters (source, payload, reason, deliveries, dead_lettered_at)
         SELECT source, payload, ?2, deliveries, ?3 FROM spool WHERE id = ?1",
        params![id, reason, Utc::now().to_rfc3339()],
    )?;
    tx.execute("DELETE FROM spool WHERE id = ?1", params![id])?;
    Ok(())
}

/// Lease the oldest visible row, dead-lettering exhausted rows on the way.
fn lease_next(
    conn: &mut Connection,
    max_deliveries: u32,
    visibility_ms: i64,
) -> Result<Option<RawLogRecord>, StoreError> {
    let tx = conn.transaction()?;
    let now = now_ms();
    loop {
        let row = tx
            .query_row(
                "SELECT id, source, payload, deliveries FROM spool
                 WHERE lease_token IS NULL OR lease_expires_ms <= ?1
                 ORDER BY id LIMIT 1",
                params![now],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, source, payload, deliveries)) = row else {
            tx.commit()?;
            return Ok(None);
        };

        if deliveries >= max_deliveries {
            warn!(spool_id = id, deliveries, "spooled message dead-lettered");
            move_to_dead_letters(&tx, id, MAX_DELIVERIES_REASON)?;
            continue;
        }

        let token = new_token();
        tx.execute(
            "UPDATE spool SET lease_token = ?2, lease_expires_ms = ?3, deliveries = deliveries + 1
             WHERE id = ?1",
            params![id, token.0, now + visibility_ms],
        )?;
        tx.commit()?;

        return Ok(Some(RawLogRecord {
            payload,
            source,
            received_at: Utc::now(),
            token,
            delivery_count: deliveries + 1,
        }));
    }
}

impl SpoolQueue {
    pub fn new(pool: Pool, max_deliveries: u32, visibility_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            pool,
            max_deliveries: max_deliveries.max(1),
            visibility_timeout,
            poll_interval,
        }
    }

    /// One non-blocking lease attempt.
    pub async fn try_receive(&self) -> Result<Option<RawLogRecord>, QueueError> {
        let max = self.max_deliveries;
        let visibility_ms = self.visibility_timeout.as_millis().min(i64::MAX as u128) as i64;
        Ok(with_conn(&self.pool, move |conn| lease_next(conn, max, visibility_ms)).await?)
    }

    async fn leased_id(&self, token: &DeliveryToken) -> Result<i64, QueueError> {
        let token_str = token.0.clone();
        let id = with_conn(&self.pool, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id FROM spool WHERE lease_token = ?1",
                    params![token_str],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?)
        })
        .await?;
        id.ok_or_else(|| QueueError::UnknownToken(token.to_string()))
    }
}

#[async_trait]
impl LogQueue for SpoolQueue {
    async fn receive(&self) -> Result<Option<RawLogRecord>, QueueError> {
        loop {
            if let Some(record) = self.try_receive().await? {
                return Ok(Some(record));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&self, token: &DeliveryToken) -> Result<(), QueueError> {
        let token_str = token.0.clone();
        let deleted = with_conn(&self.pool, move |conn| {
            Ok(conn.execute("DELETE FROM spool WHERE lease_token = ?1", params![token_str])?)
        })
        .await?;
        if deleted == 0 {
            return Err(QueueError::UnknownToken(token.to_string()));
        }
        Ok(())
    }

    async fn nack(&self, token: &DeliveryToken, action: NackAction) -> Result<(), QueueError> {
        let id = self.leased_id(token).await?;
        with_conn(&self.pool, move |conn| {
            let tx = conn.transaction()?;
            match action {
                NackAction::Requeue => {
                    tx.execute(
                        "UPDATE spool SET lease_token = NULL, lease_expires_ms = NULL WHERE id = ?1",
                        params![id],
                    )?;
                }
                NackAction::DeadLetter { reason } => {
                    warn!(spool_id = id, reason = %reason, "spooled message dead-lettered");
                    move_to_dead_letters(&tx, id, &reason)?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn enqueue(&self, source: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        let source = source.to_string();
        with_conn(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO spool (source, payload) VALUES (?1, ?2)",
                params![source, payload],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let rows = with_conn(&self.pool, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, source, payload, reason, deliveries, dead_lettered_at
                 FROM dead_letters ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, source, payload, reason, deliveries, at) = row?;
                out.push(DeadLetter {
                    id,
                    source,
                    payload: String::from_utf8_lossy(&payload).into_owned(),
                    reason,
                    deliveries,
                    dead_lettered_at: parse_ts(&id.to_string(), &at)?,
                });
            }
            Ok(out)
        })
        .await?;
        Ok(rows)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let now = now_ms();
        let depth = with_conn(&self.pool, move |conn| {
            let (ready, in_flight): (i64, i64) = conn.query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN lease_token IS NULL OR lease_expires_ms <= ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN lease_token IS NOT NULL AND lease_expires_ms > ?1 THEN 1 ELSE 0 END), 0)
                 FROM spool",
                params![now],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let dead: i64 = conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
            Ok(QueueDepth {
                ready: ready.max(0) as u64,
                in_flight: in_flight.max(0) as u64,
                dead_lettered: dead.max(0) as u64,
            })
        })
        .await?;
        Ok(depth)
    }
}
