//! Contract of the immutable content/manifest store the core is layered on.
//!
//! The store holds two kinds of objects:
//! - manifests: small labelled JSON documents, queryable by label. Snapshot
//!   manifests and model store records are both manifests.
//! - blobs: opaque immutable byte objects (item data, backup details).
//!
//! Manifests are only ever created or removed through a [`WriteSession`],
//! which the store applies atomically in [`ContentStore::commit`]. Nothing
//! staged in a session is visible to readers before the commit succeeds.

pub mod memory;

use crate::utils::errors::{CoreError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

pub use memory::MemoryStore;

/// Label key the store uses for an object's type. Reserved.
pub const TYPE_LABEL_KEY: &str = "type";

pub type Labels = BTreeMap<String, String>;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Default,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn generate() -> Self {
                Self(::uuid::Uuid::new_v4().simple().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

pub(crate) use string_id;

string_id!(ManifestId);
string_id!(BlobId);

/// Metadata-only view of a manifest, cheap to query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub id: ManifestId,
    pub labels: Labels,
    pub mod_time: DateTime<Utc>,
}

/// A manifest with its JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredManifest {
    pub metadata: EntryMetadata,
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOp {
    PutManifest {
        id: ManifestId,
        labels: Labels,
        content: serde_json::Value,
    },
    DeleteManifest(ManifestId),
}

/// Staged manifest writes. Dropping a session without committing it is a
/// rollback.
#[derive(Debug)]
pub struct WriteSession {
    purpose: String,
    ops: Vec<SessionOp>,
}

impl WriteSession {
    pub fn new(purpose: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            ops: Vec::new(),
        }
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    /// Stage a new manifest and return the id it will have once committed.
    pub fn put_manifest(&mut self, labels: Labels, content: serde_json::Value) -> ManifestId {
        let id = ManifestId::generate();
        self.ops.push(SessionOp::PutManifest {
            id: id.clone(),
            labels,
            content,
        });
        id
    }

    pub fn delete_manifest(&mut self, id: ManifestId) {
        self.ops.push(SessionOp::DeleteManifest(id));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<SessionOp> {
        self.ops
    }
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Metadata of every manifest whose labels contain all of `labels`.
    async fn find_manifests(
        &self,
        cancel: &CancellationToken,
        labels: &Labels,
    ) -> Result<Vec<EntryMetadata>>;

    async fn get_manifest(
        &self,
        cancel: &CancellationToken,
        id: &ManifestId,
    ) -> Result<Option<StoredManifest>>;

    /// Apply every staged op or none of them.
    async fn commit(&self, cancel: &CancellationToken, session: WriteSession) -> Result<()>;

    async fn put_blob(&self, cancel: &CancellationToken, data: Bytes) -> Result<BlobId>;

    async fn get_blob(&self, cancel: &CancellationToken, id: &BlobId) -> Result<Option<Bytes>>;

    /// Load full manifest bodies. Fails if any id is missing.
    async fn load_manifests(
        &self,
        cancel: &CancellationToken,
        ids: &[ManifestId],
    ) -> Result<Vec<StoredManifest>> {
        let mut res = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_manifest(cancel, id).await? {
                Some(m) => res.push(m),
                None => return Err(CoreError::NotFound(format!("manifest {id}"))),
            }
        }
        Ok(res)
    }
}

/// Run `f` against a fresh session and commit only if it succeeds.
pub async fn atomic_write_session<T, F>(
    store: &dyn ContentStore,
    cancel: &CancellationToken,
    purpose: &str,
    f: F,
) -> Result<T>
where
    F: FnOnce(&mut WriteSession) -> Result<T> + Send,
    T: Send,
{
    let mut session = WriteSession::new(purpose);
    let out = f(&mut session)?;
    store.commit(cancel, session).await?;
    Ok(out)
}

pub(crate) fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(CoreError::Cancelled);
    }
    Ok(())
}

/// True if `labels` contains every key/value pair of `filter`.
pub fn labels_match(labels: &Labels, filter: &Labels) -> bool {
    filter.iter().all(|(k, v)| labels.get(k) == Some(v))
}
