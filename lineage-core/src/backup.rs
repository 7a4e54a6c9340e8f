//! Durable backup records and the details listing stored with them.

use crate::model::{BaseModel, Model};
use crate::operations::{OpStatus, Results};
use crate::path::Reason;
use crate::selectors::Selector;
use crate::store::{BlobId, ManifestId};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::utils::errors::Result;

/// The record that makes a snapshot usable as a backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    #[serde(flatten)]
    pub base: BaseModel,

    pub created_at: DateTime<Utc>,
    pub version: i32,
    pub status: OpStatus,

    /// Snapshot holding the backed up items.
    #[serde(default)]
    pub snapshot_id: ManifestId,
    /// Blob holding the details listing.
    #[serde(default)]
    pub stream_store_id: BlobId,
    /// Older records point at the details through this field instead.
    #[serde(default, skip_serializing_if = "BlobId::is_empty")]
    pub details_id: BlobId,

    #[serde(default)]
    pub reasons: Vec<Reason>,
    #[serde(default)]
    pub results: Results,
}

impl Default for BackupRecord {
    fn default() -> Self {
        Self {
            base: BaseModel::default(),
            created_at: Utc::now(),
            version: crate::version::BACKUP,
            status: OpStatus::NotStarted,
            snapshot_id: ManifestId::default(),
            stream_store_id: BlobId::default(),
            details_id: BlobId::default(),
            reasons: Vec::new(),
            results: Results::default(),
        }
    }
}

impl BackupRecord {
    /// Where the details listing lives, preferring the current field.
    pub fn details_ref(&self) -> Option<&BlobId> {
        [&self.stream_store_id, &self.details_id]
            .into_iter()
            .find(|id| !id.is_empty())
    }
}

impl Model for BackupRecord {
    fn base(&self) -> &BaseModel {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseModel {
        &mut self.base
    }
}

/// Audit record written for runs that produced no backup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    #[serde(flatten)]
    pub base: BaseModel,
    pub status: OpStatus,
    #[serde(default)]
    pub backup_id: String,
    #[serde(default)]
    pub results: Results,
}

impl Model for OperationRecord {
    fn base(&self) -> &BaseModel {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseModel {
        &mut self.base
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailsEntry {
    pub reason: Reason,
    pub item_id: String,
    pub blob_id: BlobId,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    /// Carried forward from a base without re-reading the item.
    #[serde(default)]
    pub cached: bool,
}

/// Per-item listing of a backup, stored as a blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Details {
    pub entries: Vec<DetailsEntry>,
}

impl Details {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn resource_owners(&self) -> BTreeSet<&str> {
        self.entries
            .iter()
            .map(|e| e.reason.resource_owner.as_str())
            .collect()
    }

    /// Entries the selector matches, in their original order.
    pub fn filter(&self, selector: &Selector) -> Details {
        Details {
            entries: self
                .entries
                .iter()
                .filter(|e| selector.matches(&e.reason))
                .cloned()
                .collect(),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{Category, Service};

    #[test]
    fn test_details_ref_falls_back_to_legacy_field() {
        let mut bup = BackupRecord::default();
        assert_eq!(bup.details_ref(), None);

        bup.details_id = BlobId::from("legacy");
        assert_eq!(bup.details_ref().map(BlobId::as_str), Some("legacy"));

        bup.stream_store_id = BlobId::from("current");
        assert_eq!(bup.details_ref().map(BlobId::as_str), Some("current"));
    }

    #[test]
    fn test_legacy_record_decodes() {
        let raw = serde_json::json!({
            "id": "bup1",
            "created_at": "2023-01-01T00:00:00Z",
            "version": 1,
            "status": "completed",
            "snapshot_id": "snap1",
            "details_id": "deets1"
        });

        let bup: BackupRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(bup.base.stable_id.as_str(), "bup1");
        assert!(bup.stream_store_id.is_empty());
        assert_eq!(bup.details_ref().map(BlobId::as_str), Some("deets1"));
    }

    #[test]
    fn test_details_filter_by_selector() {
        let entry = |owner: &str, category| DetailsEntry {
            reason: Reason::new(owner, Service::Exchange, category),
            item_id: format!("{owner}-item"),
            blob_id: BlobId::generate(),
            size: 3,
            mod_time: Utc::now(),
            cached: false,
        };
        let deets = Details {
            entries: vec![
                entry("user1", Category::Email),
                entry("user1", Category::Contacts),
                entry("user2", Category::Email),
            ],
        };

        let sel = Selector::new(Service::Exchange)
            .with_owners(["user1"])
            .with_categories([Category::Email]);
        let got = deets.filter(&sel);

        assert_eq!(got.len(), 1);
        assert_eq!(got.entries[0].item_id, "user1-item");
        assert_eq!(deets.resource_owners().len(), 2);
    }
}
