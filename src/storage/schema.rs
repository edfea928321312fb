//! Database schema and migrations.

use anyhow::Result;
use rusqlite::{params, Connection};

const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS log_entries (
            id TEXT PRIMARY KEY,
            timestamp TEXT NOT NULL,
            service TEXT NOT NULL,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            fields_json TEXT NOT NULL,
            stored_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_log_entries_ts ON log_entries(timestamp);
        CREATE INDEX IF NOT EXISTS idx_log_entries_service ON log_entries(service);

        CREATE TABLE IF NOT EXISTS spool (
            id INTEGER PRIMARY KEY,
            source TEXT NOT NULL,
            payload BLOB NOT NULL,
            enqueued_at TEXT NOT NULL DEFAULT (datetime('now')),
            deliveries INTEGER NOT NULL DEFAULT 0,
            lease_token TEXT,
            lease_expires_ms INTEGER
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_spool_lease ON spool(lease_token);

        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY,
            source TEXT NOT NULL,
            payload BLOB NOT NULL,
            reason TEXT NOT NULL,
            deliveries INTEGER NOT NULL,
            dead_lettered_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id TEXT PRIMARY KEY,
            service TEXT NOT NULL,
            category TEXT NOT NULL,
            severity TEXT NOT NULL,
            entry_id TEXT NOT NULL,
            score REAL NOT NULL,
            suppressed_count INTEGER NOT NULL DEFAULT 0,
            cooldown_until TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at);

        CREATE TABLE IF NOT EXISTS index_vectors (
            entry_id TEXT PRIMARY KEY,
            vector BLOB NOT NULL,
            service TEXT NOT NULL,
            level TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        params![SCHEMA_VERSION],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in ["log_entries", "spool", "dead_letters", "alerts", "index_vectors"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table}");
        }

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }
}
