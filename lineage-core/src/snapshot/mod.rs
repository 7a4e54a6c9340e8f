//! Snapshot manifests and the tag namespace used to find them.
//!
//! A snapshot is a manifest labelled with `type=snapshot` plus user tags. User
//! tags live under the `tag:` prefix so they can never collide with the
//! store's own labels. Lineage tags (service/category and resource owner) are
//! presence markers: the tag key carries the information and the value is a
//! fixed placeholder.

pub mod selector;

use crate::model::StableId;
use crate::path::Reason;
use crate::store::{BlobId, Labels, ManifestId, StoredManifest, WriteSession, TYPE_LABEL_KEY};
use crate::utils::errors::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use selector::ManifestSelector;

pub const SNAPSHOT_TYPE: &str = "snapshot";
pub const USER_TAG_PREFIX: &str = "tag:";
pub const DEFAULT_TAG_VALUE: &str = "0";

/// Tag holding the stable id of the backup record a snapshot belongs to.
pub const TAG_BACKUP_ID: &str = "backup-id";
/// Marks snapshots written by a backup operation, as opposed to any other
/// manifest that may carry lineage tags.
pub const TAG_BACKUP_CATEGORY: &str = "is-canon-backup";

/// Incomplete reason recorded when a run stops early and checkpoints.
pub const CHECKPOINT_REASON: &str = "checkpoint";

/// Presence-style lineage tag: `tag:<key>` -> `"0"`.
pub fn make_tag_kv(key: &str) -> (String, String) {
    (format!("{USER_TAG_PREFIX}{key}"), DEFAULT_TAG_VALUE.to_string())
}

/// Value-carrying user tag: `tag:<key>` -> `value`.
pub fn make_value_tag(key: &str, value: &str) -> (String, String) {
    (format!("{USER_TAG_PREFIX}{key}"), value.to_string())
}

/// Lineage tags for a reason.
pub fn reason_tags(reason: &Reason) -> Labels {
    [
        make_tag_kv(&reason.service_cat()),
        make_tag_kv(&reason.resource_owner),
    ]
    .into_iter()
    .collect()
}

/// One item captured in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub reason: Reason,
    pub item_id: String,
    pub blob_id: BlobId,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
}

/// Manifest body of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBody {
    #[serde(default)]
    pub incomplete_reason: String,
    #[serde(default)]
    pub entries: Vec<SnapshotEntry>,
}

/// Snapshot summary used for base selection. `tags` holds the manifest's user
/// tags with their `tag:` prefix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub id: ManifestId,
    pub incomplete_reason: String,
    pub tags: Labels,
    pub mod_time: DateTime<Utc>,
}

impl Manifest {
    pub fn is_complete(&self) -> bool {
        self.incomplete_reason.is_empty()
    }

    /// Look up a user tag by its unprefixed key.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .get(&format!("{USER_TAG_PREFIX}{key}"))
            .map(String::as_str)
    }

    /// Stable id of the owning backup record, if tagged.
    pub fn backup_id(&self) -> Option<StableId> {
        self.tag(TAG_BACKUP_ID)
            .filter(|v| !v.is_empty())
            .map(StableId::from)
    }

    /// Build the summary and the body from a stored snapshot manifest.
    pub fn from_stored(stored: StoredManifest) -> Result<(Self, SnapshotBody)> {
        let body: SnapshotBody = serde_json::from_value(stored.content).map_err(|e| {
            CoreError::Store(format!(
                "manifest {} is not a snapshot: {e}",
                stored.metadata.id
            ))
        })?;

        let tags = stored
            .metadata
            .labels
            .into_iter()
            .filter(|(k, _)| k.starts_with(USER_TAG_PREFIX))
            .collect();

        let manifest = Self {
            id: stored.metadata.id,
            incomplete_reason: body.incomplete_reason.clone(),
            tags,
            mod_time: stored.metadata.mod_time,
        };

        Ok((manifest, body))
    }
}

/// Labels a snapshot manifest is written with.
pub fn snapshot_labels(reasons: &[Reason], backup_id: &StableId) -> Labels {
    let mut labels: Labels = reasons.iter().flat_map(reason_tags).collect();
    labels.extend([
        make_value_tag(TAG_BACKUP_ID, backup_id.as_str()),
        make_tag_kv(TAG_BACKUP_CATEGORY),
        (TYPE_LABEL_KEY.to_string(), SNAPSHOT_TYPE.to_string()),
    ]);
    labels
}

/// Stage a snapshot manifest in `w`.
pub fn stage_snapshot(
    w: &mut WriteSession,
    labels: Labels,
    body: &SnapshotBody,
) -> Result<ManifestId> {
    let content = serde_json::to_value(body)?;
    Ok(w.put_manifest(labels, content))
}
