//! Restore operation: read the items of one backup back out of the store and
//! hand them to a consumer.

use super::{derive_status, Fault, OpStatus, Options, Results};
use crate::backup::{BackupRecord, Details, DetailsEntry, OperationRecord};
use crate::data::{DataConsumer, RestoreCollection, RestoreItem};
use crate::events::{keys, EventBus, NoopBus, Properties, RESTORE_END, RESTORE_START};
use crate::model::{BaseModel, ModelStore, ModelType, StableId};
use crate::path::Reason;
use crate::selectors::Selector;
use crate::store::ContentStore;
use crate::utils::errors::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct RestoreOperation {
    id: StableId,
    backup_id: StableId,
    status: OpStatus,
    results: Results,
    selector: Selector,
    options: Options,
    store: Arc<dyn ContentStore>,
    models: ModelStore,
    consumer: Arc<dyn DataConsumer>,
    bus: Arc<dyn EventBus>,
}

#[derive(Default)]
pub struct RestoreOperationBuilder {
    store: Option<Arc<dyn ContentStore>>,
    models: Option<ModelStore>,
    consumer: Option<Arc<dyn DataConsumer>>,
    bus: Option<Arc<dyn EventBus>>,
    backup_id: Option<StableId>,
    selector: Option<Selector>,
    options: Options,
}

impl RestoreOperationBuilder {
    pub fn content_store(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn model_store(mut self, models: ModelStore) -> Self {
        self.models = Some(models);
        self
    }

    pub fn consumer(mut self, consumer: Arc<dyn DataConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn backup_id(mut self, id: StableId) -> Self {
        self.backup_id = Some(id);
        self
    }

    pub fn selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<RestoreOperation> {
        let store = self
            .store
            .ok_or_else(|| CoreError::Validation("restore requires a content store".into()))?;
        let models = self
            .models
            .ok_or_else(|| CoreError::Validation("restore requires a model store".into()))?;
        let consumer = self
            .consumer
            .ok_or_else(|| CoreError::Validation("restore requires a data consumer".into()))?;
        let selector = self
            .selector
            .ok_or_else(|| CoreError::Validation("restore requires a selector".into()))?;
        let backup_id = match self.backup_id {
            Some(id) if !id.is_empty() => id,
            _ => return Err(CoreError::Validation("restore requires a backup id".into())),
        };
        if self.options.parallelism == 0 {
            return Err(CoreError::Validation("parallelism must be at least 1".into()));
        }

        Ok(RestoreOperation {
            id: StableId::generate(),
            results: Results {
                backup_id: backup_id.clone(),
                ..Default::default()
            },
            backup_id,
            status: OpStatus::NotStarted,
            selector,
            options: self.options,
            store,
            models,
            consumer,
            bus: self.bus.unwrap_or_else(|| Arc::new(NoopBus)),
        })
    }
}

struct RestoreStats {
    pipeline_started: bool,
    resource_owners: BTreeSet<String>,
    items_read: usize,
    items_written: usize,
    bytes_read: u64,
    bytes_written: u64,
    read_errors: Vec<String>,
    write_errors: Vec<String>,
    fault: Fault,
}

impl RestoreStats {
    fn new(fail_fast: bool) -> Self {
        Self {
            pipeline_started: false,
            resource_owners: BTreeSet::new(),
            items_read: 0,
            items_written: 0,
            bytes_read: 0,
            bytes_written: 0,
            read_errors: Vec::new(),
            write_errors: Vec::new(),
            fault: Fault::new(fail_fast),
        }
    }
}

/// Items of one reason read back from the store.
struct ReadOutcome {
    collection: RestoreCollection,
    bytes_read: u64,
    errors: Vec<String>,
}

impl RestoreOperation {
    pub fn builder() -> RestoreOperationBuilder {
        RestoreOperationBuilder::default()
    }

    pub fn id(&self) -> &StableId {
        &self.id
    }

    pub fn backup_id(&self) -> &StableId {
        &self.backup_id
    }

    pub fn status(&self) -> OpStatus {
        self.status
    }

    pub fn results(&self) -> &Results {
        &self.results
    }

    /// Run the restore once. Returns the entries that reached the consumer.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<Details> {
        let started_at = Utc::now();
        self.status = OpStatus::InProgress;

        self.bus.event(RESTORE_START, self.start_props(started_at));
        info!(restore_id = %self.id, backup_id = %self.backup_id, "Starting restore");

        let mut stats = RestoreStats::new(self.options.fail_fast);
        let outcome = self.do_restore(cancel, &mut stats).await;
        if let Err(e) = &outcome {
            stats.fault.fail(e.to_string());
        }

        let persisted = self.persist_results(started_at, &stats);

        if stats.pipeline_started {
            self.bus.event(RESTORE_END, self.end_props());
        }

        let recorded = self.record_operation().await;
        if let Err(e) = &recorded {
            error!(restore_id = %self.id, "Persisting restore record: {}", e);
            self.status = OpStatus::Failed;
            self.results.failure = Some(e.to_string());
        }

        let details = outcome?;
        persisted?;
        recorded?;

        info!(
            restore_id = %self.id,
            status = %self.status,
            items_written = self.results.items_written,
            "Restore finished"
        );

        Ok(details)
    }

    async fn do_restore(
        &self,
        cancel: &CancellationToken,
        stats: &mut RestoreStats,
    ) -> Result<Details> {
        let selected = self.resolve(cancel).await?;

        stats.pipeline_started = true;
        stats.resource_owners = selected
            .resource_owners()
            .into_iter()
            .map(str::to_string)
            .collect();

        let collections = self.read_items(cancel, selected, stats).await;

        if let Some(failure) = stats.fault.failure() {
            return Err(CoreError::Other(anyhow::anyhow!("{failure}")));
        }
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let outcome = self.consumer.restore(cancel, collections.clone()).await?;

        stats.items_written = outcome.successes;
        stats.bytes_written = outcome.bytes_written;

        let failed: HashSet<(String, String)> = outcome
            .failures
            .iter()
            .map(|f| (f.reason.key(), f.item_id.clone()))
            .collect();
        for f in &outcome.failures {
            let msg = format!("{}/{}: {}", f.reason, f.item_id, f.error);
            stats.fault.add_recoverable(msg.clone());
            stats.write_errors.push(msg);
        }

        let restored = collections
            .into_iter()
            .flat_map(|col| {
                let reason = col.reason;
                col.items.into_iter().map(move |item| (reason.clone(), item))
            })
            .filter(|(reason, item)| !failed.contains(&(reason.key(), item.item_id.clone())))
            .map(|(reason, item)| DetailsEntry {
                reason,
                size: item.data.len() as u64,
                item_id: item.item_id,
                blob_id: Default::default(),
                mod_time: item.mod_time,
                cached: false,
            })
            .collect();

        Ok(Details { entries: restored })
    }

    /// The details entries of the target backup the selector matches.
    async fn resolve(&self, cancel: &CancellationToken) -> Result<Details> {
        let record: BackupRecord = self
            .models
            .get(cancel, ModelType::Backup, &self.backup_id)
            .await?;

        if record.snapshot_id.is_empty()
            || self
                .store
                .get_manifest(cancel, &record.snapshot_id)
                .await?
                .is_none()
        {
            return Err(CoreError::NotFound(format!(
                "snapshot of backup {}",
                self.backup_id
            )));
        }

        let details_id = record.details_ref().ok_or_else(|| {
            CoreError::NotFound(format!("details of backup {}", self.backup_id))
        })?;
        let blob = self
            .store
            .get_blob(cancel, details_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("details blob {details_id}")))?;

        let details = Details::from_bytes(&blob)?.filter(&self.selector);
        if details.is_empty() {
            return Err(CoreError::NoData(format!(
                "nothing in backup {} matches the selection",
                self.backup_id
            )));
        }

        debug!(
            restore_id = %self.id,
            snapshot_id = %record.snapshot_id,
            items = details.len(),
            "Resolved restore selection"
        );

        Ok(details)
    }

    /// Read the selected blobs, one worker per reason.
    async fn read_items(
        &self,
        cancel: &CancellationToken,
        selected: Details,
        stats: &mut RestoreStats,
    ) -> Vec<RestoreCollection> {
        let mut by_reason: BTreeMap<Reason, Vec<DetailsEntry>> = BTreeMap::new();
        for e in selected.entries {
            by_reason.entry(e.reason.clone()).or_default().push(e);
        }

        let stop = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.options.parallelism));
        let fail_fast = self.options.fail_fast;
        let mut handles = Vec::with_capacity(by_reason.len());

        for (reason, entries) in by_reason {
            let sem = Arc::clone(&semaphore);
            let store = Arc::clone(&self.store);
            let stop = stop.clone();

            let handle = tokio::spawn(async move {
                let _permit = tokio::select! {
                    result = sem.acquire_owned() => result.ok(),
                    _ = stop.cancelled() => None,
                };

                read_reason(store.as_ref(), reason, entries, &stop, fail_fast).await
            });

            handles.push(handle);
        }

        let mut collections = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(out) => {
                    stats.items_read += out.collection.items.len();
                    stats.bytes_read += out.bytes_read;
                    for e in out.errors {
                        stats.fault.add_recoverable(e.clone());
                        stats.read_errors.push(e);
                    }
                    if !out.collection.items.is_empty() {
                        collections.push(out.collection);
                    }
                }
                Err(e) => {
                    warn!(restore_id = %self.id, "Restore reader failed: {}", e);
                    stats.fault.fail(format!("restore reader failed: {e}"));
                }
            }
        }

        collections
    }

    fn persist_results(&mut self, started_at: DateTime<Utc>, stats: &RestoreStats) -> Result<()> {
        let status = derive_status(stats.fault.failure(), stats.items_read, stats.items_written);

        let failure = match (status, stats.fault.failure()) {
            (_, Some(f)) => Some(f.to_string()),
            (OpStatus::Failed, None) => Some(format!(
                "none of {} items could be restored",
                stats.items_read
            )),
            _ => None,
        };

        self.status = status;
        self.results = Results {
            backup_id: self.backup_id.clone(),
            started_at,
            completed_at: Utc::now(),
            items_read: stats.items_read,
            items_written: stats.items_written,
            items_cached: 0,
            bytes_read: stats.bytes_read,
            bytes_uploaded: stats.bytes_written,
            resource_owners: stats.resource_owners.len(),
            read_errors: stats.read_errors.clone(),
            write_errors: stats.write_errors.clone(),
            failure: failure.clone(),
        };

        match (status, failure) {
            (OpStatus::Failed, Some(f)) => Err(CoreError::Other(anyhow::anyhow!(f))),
            _ => Ok(()),
        }
    }

    async fn record_operation(&self) -> Result<()> {
        let mut record = OperationRecord {
            base: BaseModel {
                stable_id: self.id.clone(),
                ..Default::default()
            },
            status: self.status,
            backup_id: self.backup_id.to_string(),
            results: self.results.clone(),
        };

        // Accounting is kept even when the run was cancelled.
        let detached = CancellationToken::new();
        self.models
            .put(&detached, ModelType::RestoreOp, &mut record)
            .await
    }

    fn start_props(&self, started_at: DateTime<Utc>) -> Properties {
        let mut props = Properties::new();
        props.insert(keys::RESTORE_ID.into(), json!(self.id.as_str()));
        props.insert(keys::BACKUP_ID.into(), json!(self.backup_id.as_str()));
        props.insert(keys::SERVICE.into(), json!(self.selector.service.as_str()));
        props.insert(keys::START_TIME.into(), json!(started_at.to_rfc3339()));
        props
    }

    fn end_props(&self) -> Properties {
        let r = &self.results;
        let mut props = Properties::new();
        props.insert(keys::RESTORE_ID.into(), json!(self.id.as_str()));
        props.insert(keys::BACKUP_ID.into(), json!(self.backup_id.as_str()));
        props.insert(keys::STATUS.into(), json!(self.status.as_str()));
        props.insert(
            keys::DURATION_MS.into(),
            json!((r.completed_at - r.started_at).num_milliseconds()),
        );
        props.insert(keys::ITEMS_READ.into(), json!(r.items_read));
        props.insert(keys::ITEMS_WRITTEN.into(), json!(r.items_written));
        props.insert(keys::BYTES_READ.into(), json!(r.bytes_read));
        props.insert(keys::RESOURCE_OWNERS.into(), json!(r.resource_owners));
        if let Some(f) = &r.failure {
            props.insert(keys::ERROR.into(), json!(f));
        }
        props
    }
}

async fn read_reason(
    store: &dyn ContentStore,
    reason: Reason,
    entries: Vec<DetailsEntry>,
    stop: &CancellationToken,
    fail_fast: bool,
) -> ReadOutcome {
    let mut out = ReadOutcome {
        collection: RestoreCollection {
            reason,
            items: Vec::with_capacity(entries.len()),
        },
        bytes_read: 0,
        errors: Vec::new(),
    };

    for e in entries {
        if stop.is_cancelled() {
            break;
        }

        let err = match store.get_blob(stop, &e.blob_id).await {
            Ok(Some(data)) => {
                out.bytes_read += data.len() as u64;
                out.collection.items.push(RestoreItem {
                    item_id: e.item_id,
                    mod_time: e.mod_time,
                    data,
                });
                continue;
            }
            Ok(None) => format!("{}/{}: blob {} missing", e.reason, e.item_id, e.blob_id),
            Err(CoreError::Cancelled) => break,
            Err(err) => format!("{}/{}: {}", e.reason, e.item_id, err),
        };

        out.errors.push(err);
        if fail_fast {
            stop.cancel();
            break;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{RecordingConsumer, StaticCollection, StaticItem, StaticProducer};
    use crate::events::RecordingBus;
    use crate::operations::BackupOperation;
    use crate::path::{Category, Service};
    use crate::store::{BlobId, MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        models: ModelStore,
        bus: Arc<RecordingBus>,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            Self {
                models: ModelStore::new(store.clone()),
                store,
                bus: Arc::new(RecordingBus::new()),
                cancel: CancellationToken::new(),
            }
        }

        /// Back up two owners' mail and return the backup id.
        async fn backup(&self) -> StableId {
            let t = Utc::now();
            let producer = StaticProducer::new()
                .with_collection(
                    StaticCollection::new(email("user1"))
                        .with_item(StaticItem::new("a", t, "alpha"))
                        .with_item(StaticItem::new("b", t, "beta")),
                )
                .with_collection(
                    StaticCollection::new(email("user2")).with_item(StaticItem::new("c", t, "gamma")),
                );
            let mut op = BackupOperation::builder()
                .content_store(self.store.clone())
                .model_store(self.models.clone())
                .producer(Arc::new(producer))
                .selector(
                    Selector::new(Service::Exchange)
                        .with_owners(["user1", "user2"])
                        .with_categories([Category::Email]),
                )
                .build()
                .unwrap();
            op.run(&self.cancel).await.unwrap();
            op.id().clone()
        }

        fn op(&self, backup_id: StableId, selector: Selector, consumer: Arc<RecordingConsumer>) -> RestoreOperation {
            RestoreOperation::builder()
                .content_store(self.store.clone())
                .model_store(self.models.clone())
                .consumer(consumer)
                .bus(self.bus.clone())
                .backup_id(backup_id)
                .selector(selector)
                .build()
                .unwrap()
        }
    }

    fn email(owner: &str) -> Reason {
        Reason::new(owner, Service::Exchange, Category::Email)
    }

    fn owners(owners: &[&str]) -> Selector {
        Selector::new(Service::Exchange).with_owners(owners.iter().copied())
    }

    #[test]
    fn test_builder_requires_backup_id() {
        let f = Fixture::new();
        let res = RestoreOperation::builder()
            .content_store(f.store.clone())
            .model_store(f.models.clone())
            .consumer(Arc::new(RecordingConsumer::new()))
            .selector(owners(&["user1"]))
            .build();

        assert!(matches!(res, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_restore_selected_owner() {
        let f = Fixture::new();
        let backup_id = f.backup().await;
        let consumer = Arc::new(RecordingConsumer::new());

        let mut op = f.op(backup_id.clone(), owners(&["user1"]), consumer.clone());
        let details = op.run(&f.cancel).await.unwrap();

        assert_eq!(op.status(), OpStatus::Completed);
        assert_eq!(details.len(), 2);
        let r = op.results();
        assert_eq!(r.backup_id, backup_id);
        assert_eq!((r.items_read, r.items_written, r.resource_owners), (2, 2, 1));
        assert_eq!(r.bytes_read, 9);

        let restored = consumer.restored().await;
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].reason, email("user1"));
        assert_eq!(restored[0].items[0].data, "alpha");

        assert_eq!(f.bus.times_called(RESTORE_START), 1);
        assert_eq!(f.bus.times_called(RESTORE_END), 1);
        let start = &f.bus.called_with(RESTORE_START)[0];
        assert_eq!(start[keys::RESTORE_ID], json!(op.id().as_str()));
        assert_eq!(start[keys::BACKUP_ID], json!(backup_id.as_str()));

        let record: OperationRecord = f
            .models
            .get(&f.cancel, ModelType::RestoreOp, op.id())
            .await
            .unwrap();
        assert_eq!(record.status, OpStatus::Completed);
        assert_eq!(record.backup_id, backup_id.as_str());
    }

    #[tokio::test]
    async fn test_selector_matching_nothing_has_no_end_event() {
        let f = Fixture::new();
        let backup_id = f.backup().await;

        let mut op = f.op(backup_id, Selector::new(Service::Exchange), Arc::new(RecordingConsumer::new()));
        let err = op.run(&f.cancel).await.unwrap_err();

        assert!(matches!(err, CoreError::NoData(_)));
        assert_ne!(op.status(), OpStatus::Completed);
        assert_eq!(f.bus.times_called(RESTORE_START), 1);
        assert_eq!(f.bus.times_called(RESTORE_END), 0);
        assert_eq!(op.results().resource_owners, 0);
        assert!(op.results().failure.is_some());
    }

    #[tokio::test]
    async fn test_unknown_backup_is_not_found() {
        let f = Fixture::new();

        let mut op = f.op(StableId::from("missing"), owners(&["user1"]), Arc::new(RecordingConsumer::new()));
        let err = op.run(&f.cancel).await.unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(op.status(), OpStatus::Failed);
        assert_eq!(f.bus.times_called(RESTORE_END), 0);
    }

    #[tokio::test]
    async fn test_consumer_item_failures_are_recoverable() {
        let f = Fixture::new();
        let backup_id = f.backup().await;
        let consumer = Arc::new(RecordingConsumer::new().failing_items(["b"]));

        let mut op = f.op(backup_id, owners(&["user1", "user2"]), consumer);
        let details = op.run(&f.cancel).await.unwrap();

        assert_eq!(op.status(), OpStatus::Completed);
        let ids: BTreeSet<&str> = details.entries.iter().map(|e| e.item_id.as_str()).collect();
        assert_eq!(ids, BTreeSet::from(["a", "c"]));
        assert_eq!(op.results().items_written, 2);
        assert_eq!(op.results().write_errors.len(), 1);
        assert_eq!(op.results().resource_owners, 2);
    }

    #[tokio::test]
    async fn test_consumer_failure_fails_after_pipeline() {
        let f = Fixture::new();
        let backup_id = f.backup().await;
        let consumer = Arc::new(RecordingConsumer::new().failing("destination offline"));

        let mut op = f.op(backup_id, owners(&["user1"]), consumer);
        assert!(op.run(&f.cancel).await.is_err());

        assert_eq!(op.status(), OpStatus::Failed);
        assert_eq!(f.bus.times_called(RESTORE_END), 1);
        assert!(op.results().failure.as_deref().unwrap().contains("destination offline"));
    }

    #[tokio::test]
    async fn test_missing_blob_is_a_read_error() {
        let f = Fixture::new();
        let store = MemoryStore::new();
        let entries = vec![
            DetailsEntry {
                reason: email("user1"),
                item_id: "gone".into(),
                blob_id: BlobId::from("nope"),
                size: 1,
                mod_time: Utc::now(),
                cached: false,
            },
        ];

        let out = read_reason(&store, email("user1"), entries, &f.cancel, false).await;

        assert!(out.collection.items.is_empty());
        assert_eq!(out.errors.len(), 1);
        assert!(out.errors[0].contains("missing"));
    }

    #[test]
    fn test_persist_results() {
        let f = Fixture::new();
        let mut op = f.op(StableId::from("b1"), owners(&["user1"]), Arc::new(RecordingConsumer::new()));

        let cases = [
            (None, 0, 0, OpStatus::NoData, false),
            (None, 2, 2, OpStatus::Completed, false),
            (None, 2, 1, OpStatus::Completed, false),
            (None, 2, 0, OpStatus::Failed, true),
            (Some("boom"), 2, 2, OpStatus::Failed, true),
        ];

        for (failure, read, written, want, want_err) in cases {
            let mut stats = RestoreStats::new(false);
            stats.items_read = read;
            stats.items_written = written;
            if let Some(msg) = failure {
                stats.fault.fail(msg);
            }

            let res = op.persist_results(Utc::now(), &stats);

            assert_eq!(op.status(), want, "{failure:?} {read} {written}");
            assert_eq!(res.is_err(), want_err, "{failure:?} {read} {written}");
        }
    }
}
