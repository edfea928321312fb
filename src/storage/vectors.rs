//! Persistence for the vector index (`index_vectors` table).

use rusqlite::{params, Connection};

use super::logs::{format_ts, parse_level, parse_ts};
use super::{with_conn, Pool, StoreError};
use crate::index::{IndexEntry, IndexMetadata, PersistedVector, VectorIndex};
use crate::normalize::EntryId;

fn upsert(conn: &Connection, entry: &IndexEntry) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO index_vectors (entry_id, vector, service, level, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(entry_id) DO UPDATE SET
            vector = excluded.vector,
            service = excluded.service,
            level = excluded.level,
            timestamp = excluded.timestamp",
        params![
            entry.id.as_str(),
            entry.vector.to_le_bytes(),
            entry.metadata.service,
            entry.metadata.level.as_str(),
            format_ts(&entry.metadata.timestamp)
        ],
    )?;
    Ok(())
}

/// Write one index entry through to disk.
pub async fn save(pool: &Pool, entry: &IndexEntry) -> Result<(), StoreError> {
    let entry = entry.clone();
    with_conn(pool, move |conn| upsert(conn, &entry)).await
}

pub async fn remove(pool: &Pool, id: &EntryId) -> Result<bool, StoreError> {
    let id = id.as_str().to_string();
    with_conn(pool, move |conn| {
        Ok(conn.execute("DELETE FROM index_vectors WHERE entry_id = ?1", params![id])? > 0)
    })
    .await
}

/// Replace the stored snapshot with the current contents of `index`.
pub async fn snapshot(pool: &Pool, index: &VectorIndex) -> Result<usize, StoreError> {
    let entries = index.entries();
    with_conn(pool, move |conn| {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM index_vectors", [])?;
        for entry in &entries {
            upsert(&tx, entry)?;
        }
        tx.commit()?;
        Ok(entries.len())
    })
    .await
}

/// Load every stored vector row. Blob validation is left to
/// [`VectorIndex::restore`], which knows the dimension.
pub async fn load(pool: &Pool) -> Result<Vec<PersistedVector>, StoreError> {
    with_conn(pool, |conn| {
        let mut stmt = conn.prepare(
            "SELECT entry_id, vector, service, level, timestamp FROM index_vectors ORDER BY entry_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, bytes, service, level, timestamp) = row?;
            let metadata = IndexMetadata {
                service,
                level: parse_level(&id, &level)?,
                timestamp: parse_ts(&id, &timestamp)?,
            };
            out.push(PersistedVector {
                id: EntryId::from(id),
                bytes,
                metadata,
            });
        }
        Ok(out)
    })
    .await
}
