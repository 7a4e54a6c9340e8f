//! Incremental backup lineage.
//!
//! Tracks which earlier snapshots a new backup can build on: a versioned
//! model store for backup records, manifest selection per lineage, the
//! reconciliation of merge and assist bases, and the operations that drive a
//! backup or restore pass over pluggable data sources.

pub mod backup;
pub mod bases;
pub mod config;
pub mod data;
pub mod events;
pub mod model;
pub mod operations;
pub mod path;
pub mod selectors;
pub mod snapshot;
pub mod store;
pub mod utils;
pub mod version;

// Re-export commonly used types
pub use backup::{BackupRecord, Details, DetailsEntry};
pub use bases::{BackupBases, BaseFinder};
pub use config::Config;
pub use model::{ModelStore, ModelType, StableId};
pub use operations::{BackupOperation, OpStatus, Options, RestoreOperation, Results};
pub use path::{Category, Reason, Service};
pub use selectors::Selector;
pub use store::{ContentStore, MemoryStore};
pub use utils::errors::{CoreError, Result};
