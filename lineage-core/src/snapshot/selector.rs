//! Picks the snapshots an incremental backup can build on.
//!
//! For every (service/category, resource owner) pair the selector returns the
//! newest complete snapshot, plus the newest incomplete one when it is newer
//! than that complete snapshot. Older snapshots of a lineage are never
//! returned.

use super::{make_tag_kv, Manifest, SNAPSHOT_TYPE};
use crate::store::{ContentStore, EntryMetadata, Labels, ManifestId, TYPE_LABEL_KEY};
use crate::utils::errors::Result;
use std::collections::{BTreeMap, BTreeSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct ManifestSelector<'a> {
    store: &'a dyn ContentStore,
    extra_tags: Labels,
}

impl<'a> ManifestSelector<'a> {
    pub fn new(store: &'a dyn ContentStore) -> Self {
        Self {
            store,
            extra_tags: Labels::new(),
        }
    }

    /// Additional labels every candidate must carry.
    pub fn with_tags(mut self, tags: Labels) -> Self {
        self.extra_tags.extend(tags);
        self
    }

    /// Base candidates for every pair in `service_cats` x `resource_owners`,
    /// deduplicated by manifest id and ordered by modification time.
    ///
    /// A pair whose lookup fails is logged and skipped; the other pairs still
    /// contribute.
    pub async fn find_previous_manifests(
        &self,
        cancel: &CancellationToken,
        resource_owners: &BTreeSet<String>,
        service_cats: &BTreeSet<String>,
    ) -> Vec<Manifest> {
        let mut found: BTreeMap<ManifestId, Manifest> = BTreeMap::new();

        for service_cat in service_cats {
            for owner in resource_owners {
                let mut tags = self.extra_tags.clone();
                tags.extend([make_tag_kv(service_cat), make_tag_kv(owner)]);
                tags.insert(TYPE_LABEL_KEY.to_string(), SNAPSHOT_TYPE.to_string());

                match self.fetch_prev_manifests(cancel, &found, &tags).await {
                    Ok(mans) => {
                        for man in mans {
                            found.insert(man.id.clone(), man);
                        }
                    }
                    Err(e) => {
                        warn!(
                            resource_owner = %owner,
                            service_cat = %service_cat,
                            "Fetching previous snapshot manifests: {}", e
                        );
                    }
                }
            }
        }

        let mut res: Vec<Manifest> = found.into_values().collect();
        res.sort_by(|a, b| a.mod_time.cmp(&b.mod_time).then_with(|| a.id.cmp(&b.id)));
        res
    }

    async fn fetch_prev_manifests(
        &self,
        cancel: &CancellationToken,
        found: &BTreeMap<ManifestId, Manifest>,
        tags: &Labels,
    ) -> Result<Vec<Manifest>> {
        let mut metas = self.store.find_manifests(cancel, tags).await?;
        if metas.is_empty() {
            return Ok(Vec::new());
        }

        metas.sort_by(|a, b| a.mod_time.cmp(&b.mod_time));

        let last_complete = last_complete_idx(found, &metas);
        if last_complete == Some(metas.len() - 1) {
            // Newest candidate is already a known complete snapshot.
            return Ok(Vec::new());
        }

        let start = last_complete.map_or(0, |i| i + 1);
        let ids: Vec<ManifestId> = metas[start..].iter().map(|m| m.id.clone()).collect();
        debug!(count = ids.len(), "Loading candidate snapshot manifests");

        let stored = self.store.load_manifests(cancel, &ids).await?;
        let mut mans = Vec::with_capacity(stored.len());
        for s in stored {
            let (man, _) = Manifest::from_stored(s)?;
            mans.push(man);
        }

        Ok(manifests_since_last_complete(mans))
    }
}

/// Index of the newest candidate already known to be complete.
fn last_complete_idx(found: &BTreeMap<ManifestId, Manifest>, metas: &[EntryMetadata]) -> Option<usize> {
    metas
        .iter()
        .rposition(|m| found.get(&m.id).is_some_and(Manifest::is_complete))
}

/// Walk newest to oldest, keeping the first incomplete manifest and stopping at
/// the first complete one.
fn manifests_since_last_complete(mut mans: Vec<Manifest>) -> Vec<Manifest> {
    mans.sort_by(|a, b| a.mod_time.cmp(&b.mod_time));

    let mut res = Vec::new();
    let mut found_incomplete = false;

    for man in mans.into_iter().rev() {
        if !man.is_complete() {
            if !found_incomplete {
                found_incomplete = true;
                res.push(man);
            }
            continue;
        }

        res.push(man);
        break;
    }

    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StableId;
    use crate::path::{Category, Reason, Service};
    use crate::snapshot::{snapshot_labels, stage_snapshot, SnapshotBody, CHECKPOINT_REASON};
    use crate::store::{atomic_write_session, MemoryStore};

    async fn write_snapshot(
        store: &MemoryStore,
        cancel: &CancellationToken,
        reasons: &[Reason],
        incomplete: bool,
    ) -> ManifestId {
        let body = SnapshotBody {
            incomplete_reason: if incomplete {
                CHECKPOINT_REASON.to_string()
            } else {
                String::new()
            },
            entries: Vec::new(),
        };
        let labels = snapshot_labels(reasons, &StableId::generate());

        atomic_write_session(store, cancel, "snapshot", |w| stage_snapshot(w, labels, &body))
            .await
            .unwrap()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn ids(mans: &[Manifest]) -> Vec<ManifestId> {
        mans.iter().map(|m| m.id.clone()).collect()
    }

    fn email(owner: &str) -> Reason {
        Reason::new(owner, Service::Exchange, Category::Email)
    }

    #[tokio::test]
    async fn test_newest_complete_then_newer_incomplete() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let r = email("user1");

        let t1 = write_snapshot(&store, &cancel, &[r.clone()], false).await;
        let t2 = write_snapshot(&store, &cancel, &[r.clone()], true).await;

        let sel = ManifestSelector::new(&store);
        let owners = set(&["user1"]);
        let cats = set(&["exchangeemail"]);

        let got = sel.find_previous_manifests(&cancel, &owners, &cats).await;
        assert_eq!(ids(&got), vec![t1.clone(), t2.clone()]);

        let t3 = write_snapshot(&store, &cancel, &[r], false).await;
        let got = sel.find_previous_manifests(&cancel, &owners, &cats).await;
        assert_eq!(ids(&got), vec![t3]);
    }

    #[tokio::test]
    async fn test_only_newest_incomplete_is_returned() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let r = email("user1");

        let complete = write_snapshot(&store, &cancel, &[r.clone()], false).await;
        write_snapshot(&store, &cancel, &[r.clone()], true).await;
        let newest_incomplete = write_snapshot(&store, &cancel, &[r], true).await;

        let got = ManifestSelector::new(&store)
            .find_previous_manifests(&cancel, &set(&["user1"]), &set(&["exchangeemail"]))
            .await;

        assert_eq!(ids(&got), vec![complete, newest_incomplete]);
        assert_eq!(got.iter().filter(|m| !m.is_complete()).count(), 1);
    }

    #[tokio::test]
    async fn test_incomplete_older_than_complete_is_dropped() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let r = email("user1");

        write_snapshot(&store, &cancel, &[r.clone()], true).await;
        let complete = write_snapshot(&store, &cancel, &[r], false).await;

        let got = ManifestSelector::new(&store)
            .find_previous_manifests(&cancel, &set(&["user1"]), &set(&["exchangeemail"]))
            .await;

        assert_eq!(ids(&got), vec![complete]);
    }

    #[tokio::test]
    async fn test_shared_manifest_is_deduplicated() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();

        let both = write_snapshot(&store, &cancel, &[email("user1"), email("user2")], false).await;

        let got = ManifestSelector::new(&store)
            .find_previous_manifests(&cancel, &set(&["user1", "user2"]), &set(&["exchangeemail"]))
            .await;

        assert_eq!(ids(&got), vec![both]);
    }

    #[tokio::test]
    async fn test_pair_failure_is_skipped() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();

        let u2 = write_snapshot(&store, &cancel, &[email("user2")], false).await;
        write_snapshot(&store, &cancel, &[email("user1")], false).await;
        store.fail_next_find("boom").await;

        // Pairs are visited owner-ordered; the injected failure hits user1.
        let got = ManifestSelector::new(&store)
            .find_previous_manifests(&cancel, &set(&["user1", "user2"]), &set(&["exchangeemail"]))
            .await;

        assert_eq!(ids(&got), vec![u2]);
    }

    #[tokio::test]
    async fn test_extra_tags_filter_candidates() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        write_snapshot(&store, &cancel, &[email("user1")], false).await;

        let got = ManifestSelector::new(&store)
            .with_tags([make_tag_kv("not-there")].into_iter().collect())
            .find_previous_manifests(&cancel, &set(&["user1"]), &set(&["exchangeemail"]))
            .await;

        assert!(got.is_empty());
    }

    #[test]
    fn test_manifests_since_last_complete_order() {
        let base = chrono::Utc::now();
        let man = |id: &str, secs: i64, complete: bool| Manifest {
            id: ManifestId::from(id),
            incomplete_reason: if complete { String::new() } else { "x".into() },
            tags: Labels::new(),
            mod_time: base + chrono::Duration::seconds(secs),
        };

        let got = manifests_since_last_complete(vec![
            man("c1", 1, true),
            man("i1", 2, false),
            man("c2", 3, true),
            man("i2", 4, false),
            man("i3", 5, false),
        ]);

        let got: Vec<&str> = got.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(got, vec!["i3", "c2"]);
    }
}
