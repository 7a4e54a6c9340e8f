//! SQLite-backed content and manifest store for lineage-core.

pub mod db;
pub mod store;

use lineage_core::config::{StoreConfig, StoreKind};
use lineage_core::store::{ContentStore, MemoryStore};
use std::sync::Arc;

pub use store::SqliteStore;

/// The store `cfg` asks for.
pub fn open_store(cfg: &StoreConfig) -> anyhow::Result<Arc<dyn ContentStore>> {
    Ok(match cfg.kind {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Sqlite => Arc::new(SqliteStore::from_config(cfg)?),
    })
}
