//! Collaborator contracts: where backup data comes from and where restored
//! data goes.

pub mod memory;

use crate::bases::BackupBases;
use crate::path::Reason;
use crate::utils::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

pub use memory::{RecordingConsumer, StaticCollection, StaticItem, StaticProducer};

pub type ItemReader = Box<dyn AsyncRead + Send + Unpin>;

/// One source item. Identity is the id; content is only read on demand.
#[async_trait]
pub trait Item: Send + Sync {
    fn id(&self) -> &str;

    fn mod_time(&self) -> DateTime<Utc>;

    /// Tombstone: the item was deleted at the source.
    fn deleted(&self) -> bool {
        false
    }

    async fn open(&self) -> std::io::Result<ItemReader>;
}

/// Items of one lineage. `items` may be called more than once; every call
/// starts a fresh pass.
pub trait Collection: Send + Sync {
    fn reason(&self) -> &Reason;

    fn full_path(&self) -> String;

    /// True if `items` yields only changes since the merge base: items it does
    /// not mention are carried forward, deletions arrive as tombstones. False
    /// means a full listing.
    fn is_delta(&self) -> bool {
        false
    }

    fn items(&self) -> BoxStream<'_, Result<Arc<dyn Item>>>;
}

#[async_trait]
pub trait DataProducer: Send + Sync {
    /// Collections for `reasons`. `bases` describes what the backup builds on.
    async fn produce_collections(
        &self,
        cancel: &CancellationToken,
        reasons: &[Reason],
        bases: &BackupBases,
    ) -> Result<Vec<Arc<dyn Collection>>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreItem {
    pub item_id: String,
    pub mod_time: DateTime<Utc>,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreCollection {
    pub reason: Reason,
    pub items: Vec<RestoreItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    pub reason: Reason,
    pub item_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreOutcome {
    pub successes: usize,
    pub bytes_written: u64,
    pub failures: Vec<ItemFailure>,
}

#[async_trait]
pub trait DataConsumer: Send + Sync {
    /// Write `collections` to the destination. Per-item failures go in the
    /// outcome; an `Err` means nothing can be trusted.
    async fn restore(
        &self,
        cancel: &CancellationToken,
        collections: Vec<RestoreCollection>,
    ) -> Result<RestoreOutcome>;
}
