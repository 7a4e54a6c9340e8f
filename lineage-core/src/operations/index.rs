//! Item lookup over the snapshots a backup builds on.

use crate::bases::{BackupBases, ManifestEntry};
use crate::path::Reason;
use crate::snapshot::{Manifest, SnapshotBody, SnapshotEntry};
use crate::store::{ContentStore, ManifestId};
use crate::utils::errors::{CoreError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type ItemMap = BTreeMap<String, SnapshotEntry>;

/// Snapshot entries of the merge and assist bases, keyed by the reason of the
/// backup being run and the item id.
#[derive(Debug, Default)]
pub(crate) struct BaseIndex {
    merge: HashMap<String, ItemMap>,
    assist: HashMap<String, ItemMap>,
}

impl BaseIndex {
    /// Load every base snapshot. Merge bases that fail to load are removed
    /// from `bases`; assist bases that fail to load are skipped.
    ///
    /// `aliases` maps a base reason key onto the reason it stands in for, so
    /// entries from fallback lineages land under the current one.
    pub(crate) async fn load(
        store: &dyn ContentStore,
        cancel: &CancellationToken,
        bases: &mut BackupBases,
        aliases: &HashMap<String, Reason>,
    ) -> Self {
        let mut index = Self::default();
        let mut loaded: HashSet<ManifestId> = HashSet::new();

        for entry in bases.merge_bases().to_vec() {
            match load_body(store, cancel, entry.id()).await {
                Ok(body) => {
                    add(&mut index.merge, &entry, body, aliases);
                    loaded.insert(entry.id().clone());
                }
                Err(e) => {
                    warn!(manifest_id = %entry.id(), "Dropping merge base that failed to load: {}", e);
                    bases.remove_merge_base_by_manifest_id(entry.id());
                }
            }
        }

        for entry in bases.assist_bases().to_vec() {
            if loaded.contains(entry.id()) {
                // Already indexed as a merge base, which takes priority.
                continue;
            }
            match load_body(store, cancel, entry.id()).await {
                Ok(body) => add(&mut index.assist, &entry, body, aliases),
                Err(e) => {
                    warn!(manifest_id = %entry.id(), "Skipping assist base that failed to load: {}", e);
                }
            }
        }

        debug!(
            merge_reasons = index.merge.len(),
            assist_reasons = index.assist.len(),
            "Loaded base index"
        );

        index
    }

    /// A previous copy of the item that can stand in for reading it again.
    /// Merge bases win over assist bases.
    pub(crate) fn reusable(&self, reason: &Reason, item_id: &str) -> Option<&SnapshotEntry> {
        let key = reason.key();
        self.merge
            .get(&key)
            .and_then(|m| m.get(item_id))
            .or_else(|| self.assist.get(&key).and_then(|m| m.get(item_id)))
    }

    /// Every merge base entry of `reason`, ordered by item id.
    pub(crate) fn merge_entries(&self, reason: &Reason) -> impl Iterator<Item = &SnapshotEntry> {
        self.merge.get(&reason.key()).into_iter().flat_map(|m| m.values())
    }
}

async fn load_body(
    store: &dyn ContentStore,
    cancel: &CancellationToken,
    id: &ManifestId,
) -> Result<SnapshotBody> {
    let stored = store
        .get_manifest(cancel, id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("snapshot {id}")))?;
    let (_, body) = Manifest::from_stored(stored)?;
    Ok(body)
}

fn target(reason: &Reason, aliases: &HashMap<String, Reason>) -> Reason {
    aliases.get(&reason.key()).cloned().unwrap_or_else(|| reason.clone())
}

/// Index the entries of `body` that belong to one of the entry's reasons.
/// Existing keys are kept, so earlier bases take priority.
fn add(
    map: &mut HashMap<String, ItemMap>,
    entry: &ManifestEntry,
    body: SnapshotBody,
    aliases: &HashMap<String, Reason>,
) {
    let wanted: HashMap<String, Reason> = entry
        .reasons
        .iter()
        .map(|r| (r.key(), target(r, aliases)))
        .collect();

    for item in body.entries {
        let Some(to) = wanted.get(&item.reason.key()) else {
            continue;
        };

        map.entry(to.key())
            .or_default()
            .entry(item.item_id.clone())
            .or_insert(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StableId;
    use crate::path::{Category, Service};
    use crate::snapshot::{snapshot_labels, stage_snapshot};
    use crate::store::{atomic_write_session, BlobId, MemoryStore};
    use chrono::Utc;

    fn email(owner: &str) -> Reason {
        Reason::new(owner, Service::Exchange, Category::Email)
    }

    fn item(reason: &Reason, id: &str) -> SnapshotEntry {
        SnapshotEntry {
            reason: reason.clone(),
            item_id: id.to_string(),
            blob_id: BlobId::generate(),
            size: 1,
            mod_time: Utc::now(),
        }
    }

    async fn write(store: &MemoryStore, cancel: &CancellationToken, reason: &Reason, entries: Vec<SnapshotEntry>) -> Manifest {
        let body = SnapshotBody {
            incomplete_reason: String::new(),
            entries,
        };
        let labels = snapshot_labels(&[reason.clone()], &StableId::generate());
        let id = atomic_write_session(store, cancel, "snapshot", |w| stage_snapshot(w, labels, &body))
            .await
            .unwrap();
        let stored = store.get_manifest(cancel, &id).await.unwrap().unwrap();
        Manifest::from_stored(stored).unwrap().0
    }

    #[tokio::test]
    async fn test_unloadable_merge_base_is_removed() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let r = email("user1");

        let good = write(&store, &cancel, &r, vec![item(&r, "a")]).await;
        let missing = Manifest {
            id: ManifestId::from("gone"),
            ..good.clone()
        };
        let entry = |m: &Manifest| ManifestEntry {
            manifest: m.clone(),
            reasons: vec![r.clone()],
        };

        let mut bases = BackupBases::new(vec![], vec![entry(&missing)], vec![entry(&missing), entry(&good)]);
        let index = BaseIndex::load(&store, &cancel, &mut bases, &HashMap::new()).await;

        assert!(bases.merge_bases().is_empty());
        assert_eq!(bases.assist_bases().len(), 1);
        assert!(index.reusable(&r, "a").is_some());
        assert_eq!(index.merge_entries(&r).count(), 0);
    }

    #[tokio::test]
    async fn test_aliases_rekey_fallback_entries() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let old = email("old-id");
        let new = email("new-id");

        let man = write(&store, &cancel, &old, vec![item(&old, "a"), item(&old, "b")]).await;
        let entry = ManifestEntry {
            manifest: man,
            reasons: vec![old.clone()],
        };
        let mut bases = BackupBases::new(vec![], vec![entry.clone()], vec![entry]);
        let aliases: HashMap<String, Reason> = [(old.key(), new.clone())].into_iter().collect();

        let index = BaseIndex::load(&store, &cancel, &mut bases, &aliases).await;

        assert!(index.reusable(&new, "a").is_some());
        assert!(index.reusable(&old, "a").is_none());
        let ids: Vec<&str> = index.merge_entries(&new).map(|e| e.item_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
