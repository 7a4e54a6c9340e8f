//! In-memory content store.
//!
//! Used by tests and by short-lived tooling. Commits are applied under a
//! single write lock, so a session is either fully visible or not at all.
//! Commit failures can be injected to exercise rollback paths.

use super::{
    ensure_active, labels_match, BlobId, ContentStore, EntryMetadata, Labels, ManifestId,
    SessionOp, StoredManifest, WriteSession,
};
use crate::utils::errors::{CoreError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
struct Inner {
    manifests: HashMap<ManifestId, StoredManifest>,
    blobs: HashMap<BlobId, Bytes>,
    last_mod_time: Option<DateTime<Utc>>,
}

impl Inner {
    /// Strictly increasing modification times, even for back-to-back commits.
    fn next_mod_time(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last_mod_time {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_mod_time = Some(next);
        next
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    commit_fault: Mutex<Option<String>>,
    find_fault: Mutex<Option<String>>,
    commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail with `reason` without applying anything.
    pub async fn fail_next_commit(&self, reason: impl Into<String>) {
        *self.commit_fault.lock().await = Some(reason.into());
    }

    /// Make the next manifest query fail with `reason`.
    pub async fn fail_next_find(&self, reason: impl Into<String>) {
        *self.find_fault.lock().await = Some(reason.into());
    }

    /// Number of successfully applied sessions.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::Relaxed)
    }

    pub async fn manifest_count(&self) -> usize {
        self.inner.read().await.manifests.len()
    }

    pub async fn blob_count(&self) -> usize {
        self.inner.read().await.blobs.len()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn find_manifests(
        &self,
        cancel: &CancellationToken,
        labels: &Labels,
    ) -> Result<Vec<EntryMetadata>> {
        ensure_active(cancel)?;

        if let Some(reason) = self.find_fault.lock().await.take() {
            return Err(CoreError::Store(reason));
        }

        let inner = self.inner.read().await;
        let mut res: Vec<EntryMetadata> = inner
            .manifests
            .values()
            .filter(|m| labels_match(&m.metadata.labels, labels))
            .map(|m| m.metadata.clone())
            .collect();
        res.sort_by(|a, b| a.mod_time.cmp(&b.mod_time));

        Ok(res)
    }

    async fn get_manifest(
        &self,
        cancel: &CancellationToken,
        id: &ManifestId,
    ) -> Result<Option<StoredManifest>> {
        ensure_active(cancel)?;
        Ok(self.inner.read().await.manifests.get(id).cloned())
    }

    async fn commit(&self, cancel: &CancellationToken, session: WriteSession) -> Result<()> {
        ensure_active(cancel)?;

        if let Some(reason) = self.commit_fault.lock().await.take() {
            debug!(purpose = session.purpose(), "Injected commit failure, session rolled back");
            return Err(CoreError::Store(reason));
        }

        let purpose = session.purpose().to_string();
        let mut inner = self.inner.write().await;
        let mod_time = inner.next_mod_time();

        for op in session.into_ops() {
            match op {
                SessionOp::PutManifest { id, labels, content } => {
                    let metadata = EntryMetadata {
                        id: id.clone(),
                        labels,
                        mod_time,
                    };
                    inner.manifests.insert(id, StoredManifest { metadata, content });
                }
                SessionOp::DeleteManifest(id) => {
                    inner.manifests.remove(&id);
                }
            }
        }

        self.commits.fetch_add(1, Ordering::Relaxed);
        debug!(purpose = %purpose, "Committed write session");

        Ok(())
    }

    async fn put_blob(&self, cancel: &CancellationToken, data: Bytes) -> Result<BlobId> {
        ensure_active(cancel)?;
        let id = BlobId::generate();
        self.inner.write().await.blobs.insert(id.clone(), data);
        Ok(id)
    }

    async fn get_blob(&self, cancel: &CancellationToken, id: &BlobId) -> Result<Option<Bytes>> {
        ensure_active(cancel)?;
        Ok(self.inner.read().await.blobs.get(id).cloned())
    }
}
