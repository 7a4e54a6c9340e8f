//! Configuration management.
//!
//! Loads configuration from a TOML file with environment variable overrides.

use crate::operations::Options;
use crate::utils::errors::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub operations: OperationsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    /// Database file for the sqlite store
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Maximum pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationsConfig {
    /// Collections processed concurrently
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Stop at the first per-item error
    #[serde(default)]
    pub fail_fast: bool,

    /// Always run full backups
    #[serde(default)]
    pub disable_incrementals: bool,

    /// Write an incomplete snapshot when a backup stops early
    #[serde(default = "default_true")]
    pub checkpoint_on_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_store_path() -> PathBuf {
    PathBuf::from("lineage.db")
}

fn default_pool_size() -> u32 {
    8
}

fn default_compression_level() -> i32 {
    3
}

fn default_parallelism() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            path: default_store_path(),
            pool_size: default_pool_size(),
            compression_level: default_compression_level(),
        }
    }
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            fail_fast: false,
            disable_incrementals: false,
            checkpoint_on_failure: default_true(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env(|k| std::env::var(k).ok())?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `LINEAGE_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("LINEAGE_LOG_LEVEL") {
            self.log.level = level;
        }

        if let Some(raw) = lookup("LINEAGE_PARALLELISM") {
            self.operations.parallelism = raw
                .parse()
                .map_err(|_| CoreError::Config(format!("LINEAGE_PARALLELISM: invalid value {raw:?}")))?;
        }

        if let Some(path) = lookup("LINEAGE_STORE_PATH") {
            self.store.path = PathBuf::from(path);
            self.store.kind = StoreKind::Sqlite;
        }

        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.operations.parallelism == 0 {
            return Err(CoreError::Config("operations.parallelism must be at least 1".into()));
        }
        if self.store.pool_size == 0 {
            return Err(CoreError::Config("store.pool_size must be at least 1".into()));
        }
        if !(1..=22).contains(&self.store.compression_level) {
            return Err(CoreError::Config(format!(
                "store.compression_level must be within 1-22, got {}",
                self.store.compression_level
            )));
        }
        Ok(())
    }

    pub fn options(&self) -> Options {
        Options::from(&self.operations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.store.kind, StoreKind::Memory);
        assert!(config.operations.checkpoint_on_failure);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
            [store]
            kind = "sqlite"
            path = "/var/lib/lineage/store.db"

            [operations]
            fail_fast = true
            "#,
        )
        .unwrap();

        assert_eq!(config.store.kind, StoreKind::Sqlite);
        assert_eq!(config.store.path, PathBuf::from("/var/lib/lineage/store.db"));
        assert_eq!(config.store.pool_size, 8);
        assert!(config.operations.fail_fast);
        assert_eq!(config.operations.parallelism, 4);

        let opts = config.options();
        assert!(opts.fail_fast);
        assert_eq!(opts.parallelism, 4);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Config::from_toml("[operations]\nparallelism = 0\n").unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));

        let err = Config::from_toml("[store]\nkind = \"postgres\"\n").unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("LINEAGE_LOG_LEVEL", "debug"),
            ("LINEAGE_PARALLELISM", "16"),
            ("LINEAGE_STORE_PATH", "/tmp/x.db"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.log.level, "debug");
        assert_eq!(config.operations.parallelism, 16);
        assert_eq!(config.store.kind, StoreKind::Sqlite);

        let mut config = Config::default();
        let err = config
            .apply_env(|k| (k == "LINEAGE_PARALLELISM").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lineage.toml");
        std::fs::write(&path, "[log]\nlevel = \"warn\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        let expected = std::env::var("LINEAGE_LOG_LEVEL").unwrap_or_else(|_| "warn".into());
        assert_eq!(config.log.level, expected);
    }
}
