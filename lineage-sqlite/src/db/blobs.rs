//! Blob rows. Data is stored zstd-compressed.

use lineage_core::store::BlobId;
use rusqlite::{params, Connection, OptionalExtension};

pub fn insert(conn: &Connection, id: &BlobId, compressed: &[u8]) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO blobs (id, data) VALUES (?1, ?2)",
        params![id.as_str(), compressed],
    )?;
    Ok(())
}

/// Compressed row contents.
pub fn find_by_id(conn: &Connection, id: &BlobId) -> anyhow::Result<Option<Vec<u8>>> {
    let row = conn
        .query_row(
            "SELECT data FROM blobs WHERE id = ?",
            params![id.as_str()],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?;
    Ok(row)
}
