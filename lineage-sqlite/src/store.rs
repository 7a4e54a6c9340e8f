//! [`ContentStore`] backed by a SQLite database.
//!
//! Every call runs on the blocking pool with its own pooled connection. A
//! write session is applied inside one transaction, so a failed commit leaves
//! nothing behind.

use crate::db::connection::{create_pool, DbPool};
use crate::db::migrate::migrate;
use crate::db::{blobs, manifests};
use async_trait::async_trait;
use bytes::Bytes;
use lineage_core::config::StoreConfig;
use lineage_core::store::{
    BlobId, ContentStore, EntryMetadata, Labels, ManifestId, SessionOp, StoredManifest,
    WriteSession,
};
use lineage_core::utils::errors::{CoreError, Result};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
    compression_level: i32,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and bring its schema
    /// up to date.
    pub fn open(path: &Path, pool_size: u32, compression_level: i32) -> anyhow::Result<Self> {
        let pool = create_pool(path, pool_size)?;
        migrate(&pool)?;

        tracing::info!("Opened sqlite store at {}", path.display());

        Ok(Self {
            pool,
            compression_level,
        })
    }

    pub fn from_config(cfg: &StoreConfig) -> anyhow::Result<Self> {
        Self::open(&cfg.path, cfg.pool_size, cfg.compression_level)
    }

    /// Run `f` with a pooled connection on the blocking pool.
    async fn with_conn<T, F>(&self, cancel: &CancellationToken, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> anyhow::Result<T> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| CoreError::Store(format!("sqlite task failed: {e}")))?
        .map_err(|e| CoreError::Store(format!("{e:#}")))
    }
}

#[async_trait]
impl ContentStore for SqliteStore {
    async fn find_manifests(
        &self,
        cancel: &CancellationToken,
        labels: &Labels,
    ) -> Result<Vec<EntryMetadata>> {
        let filter = labels.clone();
        self.with_conn(cancel, move |conn| manifests::find_by_labels(conn, &filter))
            .await
    }

    async fn get_manifest(
        &self,
        cancel: &CancellationToken,
        id: &ManifestId,
    ) -> Result<Option<StoredManifest>> {
        let id = id.clone();
        self.with_conn(cancel, move |conn| manifests::find_by_id(conn, &id))
            .await
    }

    async fn commit(&self, cancel: &CancellationToken, session: WriteSession) -> Result<()> {
        let purpose = session.purpose().to_string();
        let ops = session.into_ops();
        let count = ops.len();

        self.with_conn(cancel, move |conn| {
            let tx = conn.transaction()?;
            let mod_time = manifests::next_mod_time(&tx)?;

            for op in &ops {
                match op {
                    SessionOp::PutManifest { id, labels, content } => {
                        manifests::insert(&tx, id, labels, content, mod_time)?
                    }
                    SessionOp::DeleteManifest(id) => manifests::delete(&tx, id)?,
                }
            }

            tx.commit()?;
            Ok(())
        })
        .await?;

        debug!(purpose = %purpose, ops = count, "Committed write session");
        Ok(())
    }

    async fn put_blob(&self, cancel: &CancellationToken, data: Bytes) -> Result<BlobId> {
        let level = self.compression_level;
        self.with_conn(cancel, move |conn| {
            let compressed = zstd::encode_all(data.as_ref(), level)?;
            let id = BlobId::generate();
            blobs::insert(conn, &id, &compressed)?;
            Ok(id)
        })
        .await
    }

    async fn get_blob(&self, cancel: &CancellationToken, id: &BlobId) -> Result<Option<Bytes>> {
        let id = id.clone();
        self.with_conn(cancel, move |conn| {
            let Some(data) = blobs::find_by_id(conn, &id)? else {
                return Ok(None);
            };
            Ok(Some(Bytes::from(zstd::decode_all(data.as_slice())?)))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lineage_core::data::{StaticCollection, StaticItem, StaticProducer};
    use lineage_core::model::{BaseModel, ModelStore, ModelType};
    use lineage_core::operations::{BackupOperation, OpStatus};
    use lineage_core::path::{Category, Reason, Service};
    use lineage_core::selectors::Selector;
    use lineage_core::store::atomic_write_session;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("store.db"), 4, 3).unwrap();
        (dir, store)
    }

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_commit_and_find_by_labels() {
        let (_dir, store) = open();
        let cancel = CancellationToken::new();

        let (a, b) = atomic_write_session(&store, &cancel, "test", |w| {
            let a = w.put_manifest(labels(&[("type", "snapshot"), ("tag:u1", "0")]), json!({"n": 1}));
            let b = w.put_manifest(labels(&[("type", "snapshot"), ("tag:u2", "0")]), json!({"n": 2}));
            Ok((a, b))
        })
        .await
        .unwrap();

        let all = store.find_manifests(&cancel, &labels(&[("type", "snapshot")])).await.unwrap();
        assert_eq!(all.len(), 2);

        let one = store
            .find_manifests(&cancel, &labels(&[("type", "snapshot"), ("tag:u2", "0")]))
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].id, b);
        assert_eq!(one[0].labels, labels(&[("type", "snapshot"), ("tag:u2", "0")]));

        let none = store
            .find_manifests(&cancel, &labels(&[("tag:u1", "0"), ("tag:u2", "0")]))
            .await
            .unwrap();
        assert!(none.is_empty());

        let got = store.get_manifest(&cancel, &a).await.unwrap().unwrap();
        assert_eq!(got.content, json!({"n": 1}));
        assert!(store.get_manifest(&cancel, &ManifestId::from("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mod_times_increase_across_commits() {
        let (_dir, store) = open();
        let cancel = CancellationToken::new();

        for i in 0..3 {
            atomic_write_session(&store, &cancel, "test", |w| {
                Ok(w.put_manifest(labels(&[("type", "x")]), json!(i)))
            })
            .await
            .unwrap();
        }

        let found = store.find_manifests(&cancel, &labels(&[("type", "x")])).await.unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.windows(2).all(|w| w[0].mod_time < w[1].mod_time));
    }

    #[tokio::test]
    async fn test_delete_removes_labels() {
        let (_dir, store) = open();
        let cancel = CancellationToken::new();

        let id = atomic_write_session(&store, &cancel, "put", |w| {
            Ok(w.put_manifest(labels(&[("k", "v")]), json!(null)))
        })
        .await
        .unwrap();
        atomic_write_session(&store, &cancel, "delete", |w| {
            w.delete_manifest(id.clone());
            Ok(())
        })
        .await
        .unwrap();

        assert!(store.get_manifest(&cancel, &id).await.unwrap().is_none());
        assert!(store.find_manifests(&cancel, &labels(&[("k", "v")])).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blobs_round_trip_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");
        let cancel = CancellationToken::new();
        let data = Bytes::from(vec![7u8; 4096]);

        let id = {
            let store = SqliteStore::open(&path, 2, 3).unwrap();
            store.put_blob(&cancel, data.clone()).await.unwrap()
        };

        let store = SqliteStore::open(&path, 2, 3).unwrap();
        assert_eq!(store.get_blob(&cancel, &id).await.unwrap(), Some(data));
        assert_eq!(store.get_blob(&cancel, &BlobId::from("nope")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_blob_rows_hold_compressed_data() {
        let (_dir, store) = open();
        let cancel = CancellationToken::new();
        let data = Bytes::from(vec![42u8; 8192]);

        let id = store.put_blob(&cancel, data.clone()).await.unwrap();

        let conn = store.pool.get().unwrap();
        let raw = blobs::find_by_id(&conn, &id).unwrap().unwrap();
        assert!(raw.len() < data.len());
        assert_eq!(zstd::decode_all(raw.as_slice()).unwrap(), data.to_vec());
    }

    #[tokio::test]
    async fn test_cancelled_calls_fail() {
        let (_dir, store) = open();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = store.find_manifests(&cancel, &Labels::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }

    #[tokio::test]
    async fn test_model_store_update_keeps_stable_id() {
        let (_dir, store) = open();
        let cancel = CancellationToken::new();
        let models = ModelStore::new(Arc::new(store));

        let mut m = BaseModel::default();
        m.tags = labels(&[("bar", "x")]);
        models.put(&cancel, ModelType::BackupOp, &mut m).await.unwrap();
        let (stable, first) = (m.stable_id.clone(), m.model_store_id.clone());

        m.tags = labels(&[("bar", "y")]);
        models.update(&cancel, ModelType::BackupOp, &mut m).await.unwrap();

        assert_eq!(m.stable_id, stable);
        assert_ne!(m.model_store_id, first);
        let err = models
            .get_with_model_store_id::<BaseModel>(&cancel, ModelType::BackupOp, &first)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let got: BaseModel = models.get(&cancel, ModelType::BackupOp, &stable).await.unwrap();
        assert_eq!(got.tags.get("bar").map(String::as_str), Some("y"));
    }

    #[tokio::test]
    async fn test_incremental_backup_on_sqlite() {
        let (_dir, store) = open();
        let store = Arc::new(store);
        let models = ModelStore::new(store.clone());
        let cancel = CancellationToken::new();
        let reason = Reason::new("user1", Service::OneDrive, Category::Files);
        let item = StaticItem::new("f1", Utc::now(), "contents");

        for _ in 0..2 {
            let producer = StaticProducer::new()
                .with_collection(StaticCollection::new(reason.clone()).with_item(item.clone()));
            let mut op = BackupOperation::builder()
                .content_store(store.clone())
                .model_store(models.clone())
                .producer(Arc::new(producer))
                .selector(Selector::new(Service::OneDrive).with_owners(["user1"]))
                .build()
                .unwrap();

            op.run(&cancel).await.unwrap();
            assert_eq!(op.status(), OpStatus::Completed);
        }

        assert_eq!(item.open_count(), 1);
    }
}
