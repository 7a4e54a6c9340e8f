//! In-memory producers and consumers for tests and dry runs.

use super::{
    Collection, DataConsumer, DataProducer, Item, ItemFailure, ItemReader, RestoreCollection,
    RestoreOutcome,
};
use crate::bases::BackupBases;
use crate::path::Reason;
use crate::store::ensure_active;
use crate::utils::errors::{CoreError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct StaticItem {
    id: String,
    mod_time: DateTime<Utc>,
    data: Bytes,
    deleted: bool,
    read_error: Option<String>,
    cancel_on_open: Option<CancellationToken>,
    opens: Arc<AtomicUsize>,
}

impl StaticItem {
    pub fn new(id: impl Into<String>, mod_time: DateTime<Utc>, data: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            mod_time,
            data: data.into(),
            deleted: false,
            read_error: None,
            cancel_on_open: None,
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn mark_deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Fail every read with `msg`.
    pub fn failing(mut self, msg: impl Into<String>) -> Self {
        self.read_error = Some(msg.into());
        self
    }

    /// Cancel `token` when the item is opened.
    pub fn cancel_on_open(mut self, token: CancellationToken) -> Self {
        self.cancel_on_open = Some(token);
        self
    }

    /// How many times the content was opened, across clones.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Item for StaticItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn mod_time(&self) -> DateTime<Utc> {
        self.mod_time
    }

    fn deleted(&self) -> bool {
        self.deleted
    }

    async fn open(&self) -> std::io::Result<ItemReader> {
        self.opens.fetch_add(1, Ordering::Relaxed);

        if let Some(token) = &self.cancel_on_open {
            token.cancel();
        }
        if let Some(msg) = &self.read_error {
            return Err(std::io::Error::other(msg.clone()));
        }

        Ok(Box::new(Cursor::new(self.data.clone())))
    }
}

/// A fixed list of items. Entries that are `Err` surface as enumeration
/// errors.
pub struct StaticCollection {
    reason: Reason,
    path: String,
    delta: bool,
    entries: Vec<std::result::Result<Arc<dyn Item>, String>>,
}

impl StaticCollection {
    pub fn new(reason: Reason) -> Self {
        let path = format!("{}/{}/{}", reason.resource_owner, reason.service, reason.category);
        Self {
            reason,
            path,
            delta: false,
            entries: Vec::new(),
        }
    }

    /// Yield only changes; see [`Collection::is_delta`].
    pub fn delta(mut self) -> Self {
        self.delta = true;
        self
    }

    pub fn with_item(mut self, item: impl Item + 'static) -> Self {
        self.entries.push(Ok(Arc::new(item)));
        self
    }

    pub fn with_enumeration_error(mut self, msg: impl Into<String>) -> Self {
        self.entries.push(Err(msg.into()));
        self
    }
}

impl Collection for StaticCollection {
    fn reason(&self) -> &Reason {
        &self.reason
    }

    fn full_path(&self) -> String {
        self.path.clone()
    }

    fn is_delta(&self) -> bool {
        self.delta
    }

    fn items(&self) -> BoxStream<'_, Result<Arc<dyn Item>>> {
        stream::iter(self.entries.iter().map(|e| match e {
            Ok(item) => Ok(item.clone()),
            Err(msg) => Err(CoreError::Io(std::io::Error::other(msg.clone()))),
        }))
        .boxed()
    }
}

/// Hands out the collections matching the requested reasons.
#[derive(Default)]
pub struct StaticProducer {
    collections: Vec<Arc<dyn Collection>>,
    failure: Option<String>,
}

impl StaticProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, collection: impl Collection + 'static) -> Self {
        self.collections.push(Arc::new(collection));
        self
    }

    /// Fail enumeration outright.
    pub fn failing(mut self, msg: impl Into<String>) -> Self {
        self.failure = Some(msg.into());
        self
    }
}

#[async_trait]
impl DataProducer for StaticProducer {
    async fn produce_collections(
        &self,
        cancel: &CancellationToken,
        reasons: &[Reason],
        _bases: &BackupBases,
    ) -> Result<Vec<Arc<dyn Collection>>> {
        ensure_active(cancel)?;

        if let Some(msg) = &self.failure {
            return Err(CoreError::Io(std::io::Error::other(msg.clone())));
        }

        Ok(self
            .collections
            .iter()
            .filter(|c| reasons.contains(c.reason()))
            .cloned()
            .collect())
    }
}

/// Accepts everything except the configured item ids and remembers what it
/// was given.
#[derive(Default)]
pub struct RecordingConsumer {
    restored: Mutex<Vec<RestoreCollection>>,
    fail_items: HashSet<String>,
    failure: Option<String>,
}

impl RecordingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_items<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fail_items.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Fail the whole restore.
    pub fn failing(mut self, msg: impl Into<String>) -> Self {
        self.failure = Some(msg.into());
        self
    }

    pub async fn restored(&self) -> Vec<RestoreCollection> {
        self.restored.lock().await.clone()
    }
}

#[async_trait]
impl DataConsumer for RecordingConsumer {
    async fn restore(
        &self,
        cancel: &CancellationToken,
        collections: Vec<RestoreCollection>,
    ) -> Result<RestoreOutcome> {
        ensure_active(cancel)?;

        if let Some(msg) = &self.failure {
            return Err(CoreError::Io(std::io::Error::other(msg.clone())));
        }

        let mut outcome = RestoreOutcome::default();
        for col in &collections {
            for item in &col.items {
                if self.fail_items.contains(&item.item_id) {
                    outcome.failures.push(ItemFailure {
                        reason: col.reason.clone(),
                        item_id: item.item_id.clone(),
                        error: "rejected by destination".to_string(),
                    });
                    continue;
                }
                outcome.successes += 1;
                outcome.bytes_written += item.data.len() as u64;
            }
        }

        self.restored.lock().await.extend(collections);
        Ok(outcome)
    }
}
