//! Backup operation.
//!
//! A run resolves the bases for the selected lineages, streams every
//! collection from the producer through a bounded pool of workers, reuses
//! unchanged items from the bases, and commits a snapshot plus a details
//! listing. The backup record that makes the snapshot usable is written last.

use super::index::BaseIndex;
use super::{derive_status, Fault, OpStatus, Options, Results};
use crate::backup::{BackupRecord, Details, DetailsEntry, OperationRecord};
use crate::bases::{BackupBases, BaseFinder};
use crate::data::{Collection, DataProducer, Item};
use crate::events::{keys, EventBus, NoopBus, Properties, BACKUP_END, BACKUP_START};
use crate::model::{BaseModel, ModelStore, ModelType, StableId};
use crate::path::{service_cat_key, Reason};
use crate::selectors::Selector;
use crate::snapshot::{
    snapshot_labels, stage_snapshot, SnapshotBody, SnapshotEntry, CHECKPOINT_REASON,
};
use crate::store::{atomic_write_session, BlobId, ContentStore, ManifestId};
use crate::utils::errors::{CoreError, Result};
use crate::version::{self, MIN_INCREMENTAL, NO_BACKUP};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct BackupOperation {
    id: StableId,
    status: OpStatus,
    results: Results,
    selector: Selector,
    fallback_reasons: Vec<Reason>,
    options: Options,
    store: Arc<dyn ContentStore>,
    models: ModelStore,
    producer: Arc<dyn DataProducer>,
    bus: Arc<dyn EventBus>,
}

#[derive(Default)]
pub struct BackupOperationBuilder {
    store: Option<Arc<dyn ContentStore>>,
    models: Option<ModelStore>,
    producer: Option<Arc<dyn DataProducer>>,
    bus: Option<Arc<dyn EventBus>>,
    selector: Option<Selector>,
    fallback_reasons: Vec<Reason>,
    options: Options,
}

impl BackupOperationBuilder {
    pub fn content_store(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn model_store(mut self, models: ModelStore) -> Self {
        self.models = Some(models);
        self
    }

    pub fn producer(mut self, producer: Arc<dyn DataProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Lineages to fall back on for categories the selector's own lineages
    /// have no base for, e.g. a resource owner's previous id.
    pub fn fallback_reasons(mut self, reasons: Vec<Reason>) -> Self {
        self.fallback_reasons = reasons;
        self
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<BackupOperation> {
        let store = self
            .store
            .ok_or_else(|| CoreError::Validation("backup requires a content store".into()))?;
        let models = self
            .models
            .ok_or_else(|| CoreError::Validation("backup requires a model store".into()))?;
        let producer = self
            .producer
            .ok_or_else(|| CoreError::Validation("backup requires a data producer".into()))?;
        let selector = self
            .selector
            .ok_or_else(|| CoreError::Validation("backup requires a selector".into()))?;
        if self.options.parallelism == 0 {
            return Err(CoreError::Validation("parallelism must be at least 1".into()));
        }

        let id = StableId::generate();

        Ok(BackupOperation {
            results: Results {
                backup_id: id.clone(),
                ..Default::default()
            },
            id,
            status: OpStatus::NotStarted,
            selector,
            fallback_reasons: self.fallback_reasons,
            options: self.options,
            store,
            models,
            producer,
            bus: self.bus.unwrap_or_else(|| Arc::new(NoopBus)),
        })
    }
}

/// Running totals for one backup.
struct BackupStats {
    pipeline_started: bool,
    reasons: Vec<Reason>,
    resource_owners: BTreeSet<String>,
    items_read: usize,
    items_written: usize,
    items_cached: usize,
    items_carried: usize,
    bytes_read: u64,
    bytes_uploaded: u64,
    read_errors: Vec<String>,
    write_errors: Vec<String>,
    fault: Fault,
    snapshot_id: ManifestId,
    details_id: BlobId,
}

impl BackupStats {
    fn new(fail_fast: bool) -> Self {
        Self {
            pipeline_started: false,
            reasons: Vec::new(),
            resource_owners: BTreeSet::new(),
            items_read: 0,
            items_written: 0,
            items_cached: 0,
            items_carried: 0,
            bytes_read: 0,
            bytes_uploaded: 0,
            read_errors: Vec::new(),
            write_errors: Vec::new(),
            fault: Fault::new(fail_fast),
            snapshot_id: ManifestId::default(),
            details_id: BlobId::default(),
        }
    }

    fn absorb(&mut self, out: &mut CollectionOutcome) {
        self.items_read += out.items_read;
        self.items_written += out.items_written;
        self.items_cached += out.items_cached;
        self.bytes_read += out.bytes_read;
        self.bytes_uploaded += out.bytes_uploaded;

        for e in out.read_errors.drain(..) {
            self.fault.add_recoverable(e.clone());
            self.read_errors.push(e);
        }
        for e in out.write_errors.drain(..) {
            self.fault.add_recoverable(e.clone());
            self.write_errors.push(e);
        }
    }
}

/// What one worker did with one collection.
struct CollectionOutcome {
    reason: Reason,
    delta: bool,
    interrupted: bool,
    seen: HashSet<String>,
    entries: Vec<DetailsEntry>,
    items_read: usize,
    items_written: usize,
    items_cached: usize,
    bytes_read: u64,
    bytes_uploaded: u64,
    read_errors: Vec<String>,
    write_errors: Vec<String>,
}

impl CollectionOutcome {
    fn new(col: &dyn Collection) -> Self {
        Self {
            reason: col.reason().clone(),
            delta: col.is_delta(),
            interrupted: false,
            seen: HashSet::new(),
            entries: Vec::new(),
            items_read: 0,
            items_written: 0,
            items_cached: 0,
            bytes_read: 0,
            bytes_uploaded: 0,
            read_errors: Vec::new(),
            write_errors: Vec::new(),
        }
    }

    fn interrupted(col: &dyn Collection) -> Self {
        Self {
            interrupted: true,
            ..Self::new(col)
        }
    }
}

/// Every collection of one reason, folded together.
struct Lineage {
    reason: Reason,
    delta: bool,
    interrupted: bool,
    seen: HashSet<String>,
}

impl Lineage {
    fn new(reason: Reason) -> Self {
        Self {
            reason,
            delta: false,
            interrupted: false,
            seen: HashSet::new(),
        }
    }

    fn absorb(&mut self, out: &mut CollectionOutcome) {
        self.delta |= out.delta;
        self.interrupted |= out.interrupted;
        self.seen.extend(out.seen.drain());
    }
}

impl BackupOperation {
    pub fn builder() -> BackupOperationBuilder {
        BackupOperationBuilder::default()
    }

    /// Id the backup record will be stored under. Known before the run.
    pub fn id(&self) -> &StableId {
        &self.id
    }

    pub fn status(&self) -> OpStatus {
        self.status
    }

    pub fn results(&self) -> &Results {
        &self.results
    }

    /// Run the backup once. Returns the details listing of the new backup.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<Details> {
        let started_at = Utc::now();
        self.status = OpStatus::InProgress;

        self.bus.event(BACKUP_START, self.start_props(started_at));
        info!(backup_id = %self.id, service = %self.selector.service, "Starting backup");

        let mut stats = BackupStats::new(self.options.fail_fast);
        let outcome = self.do_backup(cancel, &mut stats).await;
        if let Err(e) = &outcome {
            stats.fault.fail(e.to_string());
        }

        let persisted = self.persist_results(started_at, &stats);

        if stats.pipeline_started {
            self.bus.event(BACKUP_END, self.end_props());
        }

        let recorded = if outcome.is_ok() && self.status == OpStatus::Completed {
            self.create_backup_record(cancel, &stats).await
        } else {
            self.record_operation().await
        };

        if let Err(e) = &recorded {
            error!(backup_id = %self.id, "Persisting backup results: {}", e);
            self.status = OpStatus::Failed;
            self.results.failure = Some(e.to_string());
        }

        let details = outcome?;
        persisted?;
        recorded?;

        info!(
            backup_id = %self.id,
            status = %self.status,
            items_written = self.results.items_written,
            items_cached = self.results.items_cached,
            "Backup finished"
        );

        Ok(details)
    }

    async fn do_backup(
        &self,
        cancel: &CancellationToken,
        stats: &mut BackupStats,
    ) -> Result<Details> {
        let reasons = self.selector.reasons();
        stats.reasons = reasons.clone();

        let mut bases = self.resolve_bases(cancel, &reasons).await?;
        let aliases = self.fallback_aliases(&reasons);
        let index = BaseIndex::load(self.store.as_ref(), cancel, &mut bases, &aliases).await;

        stats.pipeline_started = true;

        let collections = self
            .producer
            .produce_collections(cancel, &reasons, &bases)
            .await?;
        for col in &collections {
            stats
                .resource_owners
                .insert(col.reason().resource_owner.clone());
        }
        debug!(backup_id = %self.id, collections = collections.len(), "Produced collections");

        let (entries, interrupted) = self.transfer(cancel, collections, index, stats).await;

        if interrupted || stats.fault.failure().is_some() {
            self.checkpoint(&reasons, &entries).await;
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let failure = stats.fault.failure().unwrap_or("backup interrupted");
            return Err(CoreError::Other(anyhow::anyhow!("{failure}")));
        }

        if entries.is_empty() {
            return Ok(Details::default());
        }

        let details = Details { entries };
        let details_id = self.store.put_blob(cancel, details.to_bytes()?).await?;

        let body = SnapshotBody {
            incomplete_reason: String::new(),
            entries: details.entries.iter().map(snapshot_entry).collect(),
        };
        let labels = snapshot_labels(&reasons, &self.id);
        let snapshot_id = atomic_write_session(self.store.as_ref(), cancel, "BackupSnapshot", |w| {
            stage_snapshot(w, labels, &body)
        })
        .await?;

        debug!(backup_id = %self.id, snapshot_id = %snapshot_id, items = details.len(), "Committed snapshot");

        stats.snapshot_id = snapshot_id;
        stats.details_id = details_id;

        Ok(details)
    }

    /// Bases for `reasons`, folded with the fallback lineages and trimmed by
    /// the incremental policy.
    async fn resolve_bases(
        &self,
        cancel: &CancellationToken,
        reasons: &[Reason],
    ) -> Result<BackupBases> {
        if reasons.is_empty() {
            return Ok(BackupBases::default());
        }

        let finder = BaseFinder::new(self.store.as_ref(), &self.models);
        let mut bases = finder.find_bases(cancel, reasons).await?;

        if !self.fallback_reasons.is_empty() {
            let fallback = finder.find_bases(cancel, &self.fallback_reasons).await?;
            bases = bases.merge_backup_bases(fallback, service_cat_key);
        }

        if self.options.disable_incrementals {
            info!(backup_id = %self.id, "Incrementals disabled, running full backup");
            bases.clear_merge_bases();
            bases.clear_assist_bases();
            return Ok(bases);
        }

        let min_version = bases.min_backup_version();
        if min_version != NO_BACKUP && min_version < MIN_INCREMENTAL {
            info!(
                backup_id = %self.id,
                min_version,
                "Base backup too old for incrementals, running full backup"
            );
            bases.clear_merge_bases();
        }

        Ok(bases)
    }

    /// Maps each fallback reason onto the selected reason of the same
    /// service and category.
    fn fallback_aliases(&self, reasons: &[Reason]) -> HashMap<String, Reason> {
        self.fallback_reasons
            .iter()
            .filter_map(|fb| {
                reasons
                    .iter()
                    .find(|r| r.service_cat() == fb.service_cat())
                    .map(|r| (fb.key(), r.clone()))
            })
            .collect()
    }

    /// Stream every collection through the worker pool. Returns the entries
    /// of the new snapshot and whether the pipeline stopped early.
    async fn transfer(
        &self,
        cancel: &CancellationToken,
        collections: Vec<Arc<dyn Collection>>,
        index: BaseIndex,
        stats: &mut BackupStats,
    ) -> (Vec<DetailsEntry>, bool) {
        let stop = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.options.parallelism));
        let index = Arc::new(index);
        let fail_fast = self.options.fail_fast;

        let mut handles = Vec::with_capacity(collections.len());

        for col in collections {
            let sem = Arc::clone(&semaphore);
            let store = Arc::clone(&self.store);
            let index = Arc::clone(&index);
            let stop = stop.clone();

            let handle = tokio::spawn(async move {
                let permit = tokio::select! {
                    result = sem.acquire_owned() => match result {
                        Ok(permit) => permit,
                        Err(_) => return CollectionOutcome::interrupted(col.as_ref()),
                    },
                    _ = stop.cancelled() => {
                        return CollectionOutcome::interrupted(col.as_ref());
                    }
                };

                let out = backup_collection(store.as_ref(), col.as_ref(), &index, &stop, fail_fast).await;
                drop(permit);
                out
            });

            handles.push(handle);
        }

        let mut entries = Vec::new();
        let mut interrupted = false;
        let mut lineages: Vec<Lineage> = Vec::new();

        for handle in handles {
            match handle.await {
                Ok(mut out) => {
                    stats.absorb(&mut out);
                    interrupted |= out.interrupted;

                    let key = out.reason.key();
                    let i = match lineages.iter().position(|l| l.reason.key() == key) {
                        Some(i) => i,
                        None => {
                            lineages.push(Lineage::new(out.reason.clone()));
                            lineages.len() - 1
                        }
                    };
                    lineages[i].absorb(&mut out);

                    entries.extend(out.entries);
                }
                Err(e) => {
                    warn!(backup_id = %self.id, "Collection worker failed: {}", e);
                    stats.fault.fail(format!("collection worker failed: {e}"));
                    interrupted = true;
                }
            }
        }

        for lineage in lineages.iter().filter(|l| l.delta && !l.interrupted) {
            let carried = carry_forward(&index, lineage);
            stats.items_carried += carried.len();
            entries.extend(carried);
        }

        (entries, interrupted || stop.is_cancelled())
    }

    /// Best effort: record what was uploaded so far as an incomplete snapshot
    /// the next run can reuse.
    async fn checkpoint(&self, reasons: &[Reason], entries: &[DetailsEntry]) {
        if !self.options.checkpoint_on_failure || entries.is_empty() {
            return;
        }

        let body = SnapshotBody {
            incomplete_reason: CHECKPOINT_REASON.to_string(),
            entries: entries.iter().map(snapshot_entry).collect(),
        };
        let labels = snapshot_labels(reasons, &self.id);

        // The run's own token may already be cancelled.
        let detached = CancellationToken::new();
        match atomic_write_session(self.store.as_ref(), &detached, "BackupCheckpoint", |w| {
            stage_snapshot(w, labels, &body)
        })
        .await
        {
            Ok(id) => info!(backup_id = %self.id, snapshot_id = %id, items = entries.len(), "Wrote checkpoint snapshot"),
            Err(e) => warn!(backup_id = %self.id, "Writing checkpoint snapshot: {}", e),
        }
    }

    /// Derive the status and build the results. Fails when the run failed.
    fn persist_results(&mut self, started_at: DateTime<Utc>, stats: &BackupStats) -> Result<()> {
        let read = stats.items_read + stats.items_carried;
        let written = stats.items_written + stats.items_carried;
        let status = derive_status(stats.fault.failure(), read, written);

        let failure = match (status, stats.fault.failure()) {
            (_, Some(f)) => Some(f.to_string()),
            (OpStatus::Failed, None) => Some(format!("none of {read} items could be backed up")),
            _ => None,
        };

        self.status = status;
        self.results = Results {
            backup_id: self.id.clone(),
            started_at,
            completed_at: Utc::now(),
            items_read: stats.items_read,
            items_written: stats.items_written,
            items_cached: stats.items_cached + stats.items_carried,
            bytes_read: stats.bytes_read,
            bytes_uploaded: stats.bytes_uploaded,
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

    async fn create_backup_record(
        &self,
        cancel: &CancellationToken,
        stats: &BackupStats,
    ) -> Result<()> {
        let mut record = BackupRecord {
            base: BaseModel {
                stable_id: self.id.clone(),
                tags: [(keys::SERVICE.to_string(), self.selector.service.to_string())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
            created_at: Utc::now(),
            version: version::BACKUP,
            status: self.status,
            snapshot_id: stats.snapshot_id.clone(),
            stream_store_id: stats.details_id.clone(),
            details_id: BlobId::default(),
            reasons: stats.reasons.clone(),
            results: self.results.clone(),
        };

        self.models.put(cancel, ModelType::Backup, &mut record).await
    }

    /// Results of a run that produced no backup.
    async fn record_operation(&self) -> Result<()> {
        let mut record = OperationRecord {
            base: BaseModel::default(),
            status: self.status,
            backup_id: self.id.to_string(),
            results: self.results.clone(),
        };

        // Accounting is kept even when the run was cancelled.
        let detached = CancellationToken::new();
        self.models
            .put(&detached, ModelType::BackupOp, &mut record)
            .await
    }

    fn start_props(&self, started_at: DateTime<Utc>) -> Properties {
        let mut props = Properties::new();
        props.insert(keys::BACKUP_ID.into(), json!(self.id.as_str()));
        props.insert(keys::SERVICE.into(), json!(self.selector.service.as_str()));
        props.insert(keys::START_TIME.into(), json!(started_at.to_rfc3339()));
        props
    }

    fn end_props(&self) -> Properties {
        let r = &self.results;
        let mut props = Properties::new();
        props.insert(keys::BACKUP_ID.into(), json!(self.id.as_str()));
        props.insert(keys::SERVICE.into(), json!(self.selector.service.as_str()));
        props.insert(keys::STATUS.into(), json!(self.status.as_str()));
        props.insert(
            keys::DURATION_MS.into(),
            json!((r.completed_at - r.started_at).num_milliseconds()),
        );
        props.insert(keys::ITEMS_READ.into(), json!(r.items_read));
        props.insert(keys::ITEMS_WRITTEN.into(), json!(r.items_written));
        props.insert(keys::BYTES_READ.into(), json!(r.bytes_read));
        props.insert(keys::BYTES_UPLOADED.into(), json!(r.bytes_uploaded));
        props.insert(keys::RESOURCE_OWNERS.into(), json!(r.resource_owners));
        if let Some(f) = &r.failure {
            props.insert(keys::ERROR.into(), json!(f));
        }
        props
    }
}

async fn backup_collection(
    store: &dyn ContentStore,
    col: &dyn Collection,
    index: &BaseIndex,
    stop: &CancellationToken,
    fail_fast: bool,
) -> CollectionOutcome {
    let mut out = CollectionOutcome::new(col);
    let reason = col.reason().clone();
    let path = col.full_path();
    let mut items = col.items();

    while let Some(next) = items.next().await {
        if stop.is_cancelled() {
            out.interrupted = true;
            break;
        }

        let item = match next {
            Ok(item) => item,
            Err(e) => {
                out.read_errors.push(format!("{path}: {e}"));
                if fail_fast {
                    stop.cancel();
                    break;
                }
                continue;
            }
        };

        out.seen.insert(item.id().to_string());
        if item.deleted() {
            continue;
        }
        out.items_read += 1;

        if let Some(base) = index.reusable(&reason, item.id()) {
            if base.mod_time == item.mod_time() {
                out.items_written += 1;
                out.items_cached += 1;
                out.entries.push(DetailsEntry {
                    reason: reason.clone(),
                    item_id: item.id().to_string(),
                    blob_id: base.blob_id.clone(),
                    size: base.size,
                    mod_time: base.mod_time,
                    cached: true,
                });
                continue;
            }
        }

        let data = match read_item(item.as_ref()).await {
            Ok(data) => data,
            Err(e) => {
                out.read_errors.push(format!("{path}/{}: {e}", item.id()));
                if fail_fast {
                    stop.cancel();
                    break;
                }
                continue;
            }
        };

        let size = data.len() as u64;
        out.bytes_read += size;

        match store.put_blob(stop, data).await {
            Ok(blob_id) => {
                out.items_written += 1;
                out.bytes_uploaded += size;
                out.entries.push(DetailsEntry {
                    reason: reason.clone(),
                    item_id: item.id().to_string(),
                    blob_id,
                    size,
                    mod_time: item.mod_time(),
                    cached: false,
                });
            }
            Err(CoreError::Cancelled) => {
                out.interrupted = true;
                break;
            }
            Err(e) => {
                out.write_errors.push(format!("{path}/{}: {e}", item.id()));
                if fail_fast {
                    stop.cancel();
                    break;
                }
            }
        }
    }

    debug!(
        path = %path,
        read = out.items_read,
        written = out.items_written,
        cached = out.items_cached,
        "Collection done"
    );

    out
}

/// Merge base entries of a lineage that none of its collections mentioned.
fn carry_forward(index: &BaseIndex, lineage: &Lineage) -> Vec<DetailsEntry> {
    index
        .merge_entries(&lineage.reason)
        .filter(|e| !lineage.seen.contains(&e.item_id))
        .map(|e| DetailsEntry {
            reason: lineage.reason.clone(),
            item_id: e.item_id.clone(),
            blob_id: e.blob_id.clone(),
            size: e.size,
            mod_time: e.mod_time,
            cached: true,
        })
        .collect()
}

async fn read_item(item: &dyn Item) -> std::io::Result<Bytes> {
    let mut reader = item.open().await?;
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

fn snapshot_entry(e: &DetailsEntry) -> SnapshotEntry {
    SnapshotEntry {
        reason: e.reason.clone(),
        item_id: e.item_id.clone(),
        blob_id: e.blob_id.clone(),
        size: e.size,
        mod_time: e.mod_time,
    }
}
