use super::{BackupBases, BackupEntry, ManifestEntry};
use crate::backup::BackupRecord;
use crate::model::{ModelStore, ModelType};
use crate::path::Reason;
use crate::snapshot::{make_tag_kv, ManifestSelector, TAG_BACKUP_CATEGORY};
use crate::store::{ensure_active, ContentStore, ManifestId};
use crate::utils::errors::Result;
use std::collections::{BTreeSet, HashMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resolves the bases for a set of lineages: selects candidate snapshots per
/// reason, pairs complete ones with their backup records and verifies the
/// result.
pub struct BaseFinder<'a> {
    store: &'a dyn ContentStore,
    models: &'a ModelStore,
}

impl<'a> BaseFinder<'a> {
    pub fn new(store: &'a dyn ContentStore, models: &'a ModelStore) -> Self {
        Self { store, models }
    }

    pub async fn find_bases(
        &self,
        cancel: &CancellationToken,
        reasons: &[Reason],
    ) -> Result<BackupBases> {
        let selector = ManifestSelector::new(self.store)
            .with_tags([make_tag_kv(TAG_BACKUP_CATEGORY)].into_iter().collect());

        // Reasons are looked up one at a time so each one is only attached to
        // the snapshots selected for it.
        let mut entries: Vec<ManifestEntry> = Vec::new();
        let mut index: HashMap<ManifestId, usize> = HashMap::new();

        for reason in reasons {
            let owners = BTreeSet::from([reason.resource_owner.clone()]);
            let cats = BTreeSet::from([reason.service_cat()]);

            for man in selector.find_previous_manifests(cancel, &owners, &cats).await {
                match index.get(&man.id) {
                    Some(&i) => entries[i].reasons.push(reason.clone()),
                    None => {
                        index.insert(man.id.clone(), entries.len());
                        entries.push(ManifestEntry {
                            manifest: man,
                            reasons: vec![reason.clone()],
                        });
                    }
                }
            }
        }

        // The selector logs and skips failed lookups, cancellation included.
        ensure_active(cancel)?;

        let mut bases = BackupBases::default();

        for entry in entries {
            if !entry.manifest.is_complete() {
                bases.assist_bases.push(entry);
                continue;
            }

            let Some(backup_id) = entry.manifest.backup_id() else {
                warn!(manifest_id = %entry.id(), "Complete snapshot has no backup id tag");
                bases.assist_bases.push(entry);
                continue;
            };

            match self
                .models
                .get::<BackupRecord>(cancel, ModelType::Backup, &backup_id)
                .await
            {
                Ok(backup) => {
                    bases.backups.push(BackupEntry {
                        backup,
                        reasons: entry.reasons.clone(),
                    });
                    bases.merge_bases.push(entry.clone());
                    bases.assist_bases.push(entry);
                }
                Err(e) if e.is_not_found() => {
                    info!(manifest_id = %entry.id(), backup_id = %backup_id, "No backup record for snapshot, using it as assist base");
                    bases.assist_bases.push(entry);
                }
                Err(e) => return Err(e),
            }
        }

        bases.fixup_and_verify();

        debug!(
            reasons = reasons.len(),
            merge_bases = bases.merge_bases.len(),
            assist_bases = bases.assist_bases.len(),
            "Found backup bases"
        );

        Ok(bases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StableId;
    use crate::path::{Category, Service};
    use crate::snapshot::{snapshot_labels, stage_snapshot, SnapshotBody, CHECKPOINT_REASON};
    use crate::store::{atomic_write_session, BlobId, MemoryStore};
    use std::sync::Arc;

    struct Fixture {
        store: Arc<MemoryStore>,
        models: ModelStore,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let models = ModelStore::new(store.clone());
            Self {
                store,
                models,
                cancel: CancellationToken::new(),
            }
        }

        async fn snapshot(&self, reasons: &[Reason], backup_id: &StableId, incomplete: bool) -> ManifestId {
            let body = SnapshotBody {
                incomplete_reason: if incomplete {
                    CHECKPOINT_REASON.into()
                } else {
                    String::new()
                },
                entries: Vec::new(),
            };
            let labels = snapshot_labels(reasons, backup_id);
            atomic_write_session(self.store.as_ref(), &self.cancel, "snapshot", |w| {
                stage_snapshot(w, labels, &body)
            })
            .await
            .unwrap()
        }

        /// A complete snapshot plus the backup record that points at it.
        async fn backup(&self, reasons: &[Reason]) -> (StableId, ManifestId) {
            let backup_id = StableId::generate();
            let snapshot_id = self.snapshot(reasons, &backup_id, false).await;

            let mut record = BackupRecord::default();
            record.base.stable_id = backup_id.clone();
            record.snapshot_id = snapshot_id.clone();
            record.stream_store_id = BlobId::generate();
            record.reasons = reasons.to_vec();
            self.models
                .put(&self.cancel, ModelType::Backup, &mut record)
                .await
                .unwrap();

            (backup_id, snapshot_id)
        }

        fn finder(&self) -> BaseFinder<'_> {
            BaseFinder::new(self.store.as_ref(), &self.models)
        }
    }

    fn email(owner: &str) -> Reason {
        Reason::new(owner, Service::Exchange, Category::Email)
    }

    fn contacts(owner: &str) -> Reason {
        Reason::new(owner, Service::Exchange, Category::Contacts)
    }

    #[tokio::test]
    async fn test_find_bases_pairs_snapshots_with_backups() {
        let f = Fixture::new();
        let (bid, sid) = f.backup(&[email("user1"), contacts("user1")]).await;
        let incomplete = f.snapshot(&[email("user1")], &StableId::generate(), true).await;

        let bases = f
            .finder()
            .find_bases(&f.cancel, &[email("user1"), contacts("user1")])
            .await
            .unwrap();

        assert_eq!(bases.backups().len(), 1);
        assert_eq!(bases.backups()[0].backup.base.stable_id, bid);
        assert_eq!(bases.merge_bases().len(), 1);
        assert_eq!(bases.merge_bases()[0].id(), &sid);
        assert_eq!(
            bases.merge_bases()[0].reasons,
            vec![email("user1"), contacts("user1")]
        );

        let assist: Vec<&ManifestId> = bases.assist_bases().iter().map(|m| m.id()).collect();
        assert_eq!(assist, vec![&sid, &incomplete]);
    }

    #[tokio::test]
    async fn test_reasons_attach_only_to_their_own_selection() {
        let f = Fixture::new();
        let (_, both) = f.backup(&[email("user1"), contacts("user1")]).await;
        let (_, newer_email) = f.backup(&[email("user1")]).await;

        let bases = f
            .finder()
            .find_bases(&f.cancel, &[email("user1"), contacts("user1")])
            .await
            .unwrap();

        let merge: Vec<(&ManifestId, &[Reason])> = bases
            .merge_bases()
            .iter()
            .map(|m| (m.id(), m.reasons.as_slice()))
            .collect();
        assert_eq!(
            merge,
            vec![
                (&newer_email, [email("user1")].as_slice()),
                (&both, [contacts("user1")].as_slice()),
            ]
        );
    }

    #[tokio::test]
    async fn test_snapshot_without_record_is_assist_only() {
        let f = Fixture::new();
        let orphan = f.snapshot(&[email("user1")], &StableId::generate(), false).await;

        let bases = f.finder().find_bases(&f.cancel, &[email("user1")]).await.unwrap();

        assert!(bases.merge_bases().is_empty());
        assert!(bases.backups().is_empty());
        assert_eq!(bases.assist_bases()[0].id(), &orphan);
    }

    #[tokio::test]
    async fn test_no_history_is_empty() {
        let f = Fixture::new();
        let bases = f.finder().find_bases(&f.cancel, &[email("user1")]).await.unwrap();
        assert!(bases.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_lookup_errors() {
        let f = Fixture::new();
        f.backup(&[email("user1")]).await;
        f.cancel.cancel();

        let err = f
            .finder()
            .find_bases(&f.cancel, &[email("user1")])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::utils::errors::CoreError::Cancelled));
    }
}
