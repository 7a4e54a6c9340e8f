//! Durable metadata models and their identities.
//!
//! A model has two ids: a [`StableId`] assigned once by [`ModelStore::put`]
//! and kept for its whole life, and a [`ManifestId`] naming the physical
//! manifest currently holding it. Every update writes a new manifest, so the
//! physical id changes while the stable id does not.

pub mod store;

use crate::store::{string_id, Labels, ManifestId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use store::ModelStore;

/// Label key holding a model's stable id. Reserved.
pub const STABLE_ID_KEY: &str = "stableID";

string_id!(StableId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelType {
    Unknown,
    BackupOp,
    RestoreOp,
    Backup,
    BackupDetails,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::BackupOp => "backup-op",
            Self::RestoreOp => "restore-op",
            Self::Backup => "backup",
            Self::BackupDetails => "backup-details",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and user tags shared by every model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseModel {
    #[serde(rename = "id", default)]
    pub stable_id: StableId,

    /// Filled in by the store on read and write; never serialized.
    #[serde(skip)]
    pub model_store_id: ManifestId,

    /// Stored as manifest labels rather than in the body.
    #[serde(skip)]
    pub tags: Labels,

    #[serde(default)]
    pub model_version: i32,
}

pub trait Model: Serialize + DeserializeOwned + Send + Sync {
    fn base(&self) -> &BaseModel;
    fn base_mut(&mut self) -> &mut BaseModel;
}

impl Model for BaseModel {
    fn base(&self) -> &BaseModel {
        self
    }

    fn base_mut(&mut self) -> &mut BaseModel {
        self
    }
}
