//! The set of prior snapshots a backup builds on.
//!
//! Merge bases are complete snapshots with a valid backup record; their items
//! can be carried forward into the new backup without re-reading. Assist bases
//! are any snapshots (complete or not) whose content can be reused when an
//! item is unchanged, but which are never treated as authoritative.

pub mod finder;

use crate::backup::BackupRecord;
use crate::path::Reason;
use crate::snapshot::Manifest;
use crate::store::ManifestId;
use crate::version::NO_BACKUP;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

pub use finder::BaseFinder;

/// A snapshot and the lineages it serves as a base for.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub manifest: Manifest,
    pub reasons: Vec<Reason>,
}

impl ManifestEntry {
    pub fn id(&self) -> &ManifestId {
        &self.manifest.id
    }
}

/// A backup record and the lineages it serves as a base for.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupEntry {
    pub backup: BackupRecord,
    pub reasons: Vec<Reason>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupBases {
    backups: Vec<BackupEntry>,
    merge_bases: Vec<ManifestEntry>,
    assist_bases: Vec<ManifestEntry>,
}

/// What the receiving side of a merge already covers for one reason key.
struct Coverage {
    newest: DateTime<Utc>,
    has_incomplete: bool,
}

impl BackupBases {
    pub fn new(
        backups: Vec<BackupEntry>,
        merge_bases: Vec<ManifestEntry>,
        assist_bases: Vec<ManifestEntry>,
    ) -> Self {
        Self {
            backups,
            merge_bases,
            assist_bases,
        }
    }

    pub fn backups(&self) -> &[BackupEntry] {
        &self.backups
    }

    pub fn merge_bases(&self) -> &[ManifestEntry] {
        &self.merge_bases
    }

    pub fn assist_bases(&self) -> &[ManifestEntry] {
        &self.assist_bases
    }

    pub fn is_empty(&self) -> bool {
        self.backups.is_empty() && self.merge_bases.is_empty() && self.assist_bases.is_empty()
    }

    /// Lowest format version among the backups, or `NO_BACKUP` if there are
    /// none.
    pub fn min_backup_version(&self) -> i32 {
        self.backups
            .iter()
            .map(|b| b.backup.version)
            .min()
            .unwrap_or(NO_BACKUP)
    }

    /// Forget a merge base whose snapshot could not be used, along with its
    /// backup and its assist entry.
    pub fn remove_merge_base_by_manifest_id(&mut self, id: &ManifestId) {
        self.merge_bases.retain(|m| m.id() != id);
        self.assist_bases.retain(|m| m.id() != id);
        self.backups.retain(|b| &b.backup.snapshot_id != id);
    }

    /// Drop every merge base and the backups backing them. Assist bases stay.
    pub fn clear_merge_bases(&mut self) {
        self.merge_bases.clear();
        self.backups.clear();
    }

    pub fn clear_assist_bases(&mut self) {
        self.assist_bases.clear();
    }

    /// Fold `other` into `self`, with `self` taking priority.
    ///
    /// A reason is only taken from `other` when `self` has no merge base for
    /// its key (as computed by `reason_key`). Merge bases taken from `other`
    /// keep only the uncovered reasons, and are dropped if `other` has no
    /// backup record for them. Assist bases from `other` that pair with one
    /// of its merge bases follow that merge base. Other complete assist
    /// bases contribute reasons `self` has no entry for; incomplete ones
    /// contribute reasons `self` has no incomplete base for and no newer
    /// entry for.
    pub fn merge_backup_bases<F>(mut self, other: BackupBases, reason_key: F) -> BackupBases
    where
        F: Fn(&Reason) -> String,
    {
        if other.merge_bases.is_empty() && other.assist_bases.is_empty() {
            return self;
        }
        if self.merge_bases.is_empty() && self.assist_bases.is_empty() {
            return other;
        }

        let to_merge: HashSet<String> = self
            .merge_bases
            .iter()
            .flat_map(|m| m.reasons.iter().map(&reason_key))
            .collect();

        let mut coverage: HashMap<String, Coverage> = HashMap::new();
        for m in self.merge_bases.iter().chain(self.assist_bases.iter()) {
            for r in &m.reasons {
                let c = coverage.entry(reason_key(r)).or_insert(Coverage {
                    newest: m.manifest.mod_time,
                    has_incomplete: false,
                });
                c.newest = c.newest.max(m.manifest.mod_time);
                c.has_incomplete |= !m.manifest.is_complete();
            }
        }

        let BackupBases {
            backups: other_backups,
            merge_bases: other_merge,
            assist_bases: other_assist,
        } = other;

        let other_merge_ids: HashSet<ManifestId> =
            other_merge.iter().map(|m| m.id().clone()).collect();

        for man in other_merge {
            let reasons: Vec<Reason> = man
                .reasons
                .iter()
                .filter(|r| !to_merge.contains(&reason_key(r)))
                .cloned()
                .collect();
            if reasons.is_empty() {
                continue;
            }

            let bup = man.manifest.backup_id().and_then(|bid| {
                other_backups
                    .iter()
                    .find(|b| b.backup.base.stable_id == bid)
            });
            let Some(bup) = bup else {
                info!(manifest_id = %man.id(), "Dropping merge base without a backup record while merging bases");
                continue;
            };

            let entry = ManifestEntry {
                manifest: man.manifest,
                reasons: reasons.clone(),
            };

            self.backups.push(BackupEntry {
                backup: bup.backup.clone(),
                reasons,
            });
            self.merge_bases.push(entry.clone());
            self.assist_bases.push(entry);
        }

        for man in other_assist {
            if other_merge_ids.contains(man.id()) {
                continue;
            }

            let complete = man.manifest.is_complete();
            let mod_time = man.manifest.mod_time;
            let reasons: Vec<Reason> = man
                .reasons
                .iter()
                .filter(|r| match coverage.get(&reason_key(r)) {
                    None => true,
                    Some(_) if complete => false,
                    Some(c) => !c.has_incomplete && mod_time > c.newest,
                })
                .cloned()
                .collect();
            if reasons.is_empty() {
                continue;
            }

            self.assist_bases.push(ManifestEntry {
                manifest: man.manifest,
                reasons,
            });
        }

        self
    }

    /// Drop every merge base that cannot be trusted.
    ///
    /// A merge base survives only if it is complete, has a non-empty reason set
    /// with no duplicates, shares no reason with another merge base, and has a
    /// backup record pointing at both its snapshot and a details listing.
    /// Backups survive only alongside their merge base. A dropped merge base
    /// leaves the assist bases as well; assist-only entries are untouched.
    pub fn fixup_and_verify(&mut self) {
        let mut dropped: HashSet<ManifestId> = HashSet::new();
        let mut holders: HashMap<String, HashSet<ManifestId>> = HashMap::new();

        for m in &self.merge_bases {
            if m.reasons.is_empty() {
                warn!(manifest_id = %m.id(), "Dropping merge base with no reasons");
                dropped.insert(m.id().clone());
            }

            let mut seen = HashSet::new();
            for r in &m.reasons {
                let key = r.key();
                if !seen.insert(key.clone()) {
                    warn!(manifest_id = %m.id(), reason = %r, "Dropping merge base with duplicate reason");
                    dropped.insert(m.id().clone());
                }
                holders.entry(key).or_default().insert(m.id().clone());
            }

            if !m.manifest.is_complete() {
                info!(manifest_id = %m.id(), "Dropping incomplete merge base");
                dropped.insert(m.id().clone());
            }
        }

        for (key, ids) in holders {
            if ids.len() > 1 {
                warn!(reason_key = %key, count = ids.len(), "Dropping merge bases sharing a reason");
                dropped.extend(ids);
            }
        }

        let mut candidates: Vec<BackupEntry> = std::mem::take(&mut self.backups)
            .into_iter()
            .filter(|b| {
                let bup = &b.backup;
                if bup.snapshot_id.is_empty() || bup.details_ref().is_none() {
                    info!(backup_id = %bup.base.stable_id, "Dropping backup missing snapshot or details reference");
                    return false;
                }
                !dropped.contains(&bup.snapshot_id)
            })
            .collect();

        let mut merge_keep = Vec::new();
        let mut backup_keep = Vec::new();

        for m in std::mem::take(&mut self.merge_bases) {
            if dropped.contains(m.id()) {
                continue;
            }

            let bid = m.manifest.backup_id();
            let idx = candidates.iter().position(|b| {
                Some(&b.backup.base.stable_id) == bid.as_ref() && &b.backup.snapshot_id == m.id()
            });

            match idx {
                Some(i) => {
                    backup_keep.push(candidates.swap_remove(i));
                    merge_keep.push(m);
                }
                None => {
                    info!(manifest_id = %m.id(), "Dropping merge base without a usable backup");
                    dropped.insert(m.id().clone());
                }
            }
        }

        self.merge_bases = merge_keep;
        self.backups = backup_keep;
        self.assist_bases.retain(|m| !dropped.contains(m.id()));

        debug!(
            backups = self.backups.len(),
            merge_bases = self.merge_bases.len(),
            assist_bases = self.assist_bases.len(),
            "Verified backup bases"
        );
    }
}
