//! Manifest rows and their labels.

use chrono::{DateTime, Utc};
use lineage_core::store::{EntryMetadata, Labels, ManifestId, StoredManifest};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};

fn row_to_metadata(row: &Row) -> rusqlite::Result<(String, i64)> {
    Ok((row.get("id")?, row.get("mod_time")?))
}

fn to_mod_time(micros: i64) -> anyhow::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| anyhow::anyhow!("invalid manifest mod time {micros}"))
}

fn labels_for(conn: &Connection, id: &str) -> anyhow::Result<Labels> {
    let mut stmt = conn.prepare("SELECT key, value FROM manifest_labels WHERE manifest_id = ?")?;
    let rows = stmt.query_map(params![id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    Ok(rows.collect::<rusqlite::Result<Labels>>()?)
}

/// Manifests carrying every label in `filter`, oldest first.
pub fn find_by_labels(conn: &Connection, filter: &Labels) -> anyhow::Result<Vec<EntryMetadata>> {
    let rows: Vec<(String, i64)> = if filter.is_empty() {
        let mut stmt = conn.prepare("SELECT id, mod_time FROM manifests ORDER BY mod_time, id")?;
        let rows = stmt.query_map([], row_to_metadata)?;
        rows.collect::<rusqlite::Result<_>>()?
    } else {
        let clauses = vec!["(key = ? AND value = ?)"; filter.len()].join(" OR ");
        let sql = format!(
            "SELECT id, mod_time FROM manifests WHERE id IN (
               SELECT manifest_id FROM manifest_labels WHERE {clauses}
               GROUP BY manifest_id HAVING COUNT(*) = {}
             ) ORDER BY mod_time, id",
            filter.len()
        );

        let args: Vec<&String> = filter.iter().flat_map(|(k, v)| [k, v]).collect();

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), row_to_metadata)?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    rows.into_iter()
        .map(|(id, mod_time)| {
            Ok(EntryMetadata {
                labels: labels_for(conn, &id)?,
                id: ManifestId::from(id),
                mod_time: to_mod_time(mod_time)?,
            })
        })
        .collect()
}

pub fn find_by_id(conn: &Connection, id: &ManifestId) -> anyhow::Result<Option<StoredManifest>> {
    let row = conn
        .query_row(
            "SELECT mod_time, content FROM manifests WHERE id = ?",
            params![id.as_str()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;

    let Some((mod_time, content)) = row else {
        return Ok(None);
    };

    Ok(Some(StoredManifest {
        metadata: EntryMetadata {
            id: id.clone(),
            labels: labels_for(conn, id.as_str())?,
            mod_time: to_mod_time(mod_time)?,
        },
        content: serde_json::from_str(&content)?,
    }))
}

/// Modification time for the next commit: now, but strictly after every
/// stored manifest.
pub fn next_mod_time(tx: &Transaction) -> anyhow::Result<i64> {
    let last: Option<i64> = tx.query_row("SELECT MAX(mod_time) FROM manifests", [], |row| row.get(0))?;
    let now = Utc::now().timestamp_micros();
    Ok(match last {
        Some(last) if now <= last => last + 1,
        _ => now,
    })
}

pub fn insert(
    tx: &Transaction,
    id: &ManifestId,
    labels: &Labels,
    content: &serde_json::Value,
    mod_time: i64,
) -> anyhow::Result<()> {
    tx.execute(
        "INSERT INTO manifests (id, mod_time, content) VALUES (?1, ?2, ?3)",
        params![id.as_str(), mod_time, serde_json::to_string(content)?],
    )?;

    let mut stmt = tx.prepare("INSERT INTO manifest_labels (manifest_id, key, value) VALUES (?1, ?2, ?3)")?;
    for (key, value) in labels {
        stmt.execute(params![id.as_str(), key, value])?;
    }
    Ok(())
}

pub fn delete(tx: &Transaction, id: &ManifestId) -> anyhow::Result<()> {
    tx.execute("DELETE FROM manifests WHERE id = ?", params![id.as_str()])?;
    Ok(())
}
