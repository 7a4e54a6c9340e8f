//! Backup and restore orchestration.
//!
//! An operation is built once with its collaborators, run once, and leaves
//! behind a status and an immutable [`Results`] value describing the run.

pub mod backup;
mod index;
pub mod restore;

use crate::config::OperationsConfig;
use crate::model::StableId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use backup::{BackupOperation, BackupOperationBuilder};
pub use restore::{RestoreOperation, RestoreOperationBuilder};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
    NoData,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::NoData => "no_data",
        }
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one run, built once when the run finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Results {
    pub backup_id: StableId,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub items_read: usize,
    pub items_written: usize,
    pub items_cached: usize,
    pub bytes_read: u64,
    pub bytes_uploaded: u64,
    pub resource_owners: usize,
    #[serde(default)]
    pub read_errors: Vec<String>,
    #[serde(default)]
    pub write_errors: Vec<String>,
    /// The unrecoverable error that ended the run, if any.
    #[serde(default)]
    pub failure: Option<String>,
}

/// Operation control options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub parallelism: usize,
    pub fail_fast: bool,
    pub disable_incrementals: bool,
    pub checkpoint_on_failure: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self::from(&OperationsConfig::default())
    }
}

impl From<&OperationsConfig> for Options {
    fn from(cfg: &OperationsConfig) -> Self {
        Self {
            parallelism: cfg.parallelism.max(1),
            fail_fast: cfg.fail_fast,
            disable_incrementals: cfg.disable_incrementals,
            checkpoint_on_failure: cfg.checkpoint_on_failure,
        }
    }
}

/// Error accumulator for one run: any number of recoverable errors, at most
/// one unrecoverable failure.
#[derive(Debug, Default)]
pub struct Fault {
    fail_fast: bool,
    failure: Option<String>,
    recovered: Vec<String>,
}

impl Fault {
    pub fn new(fail_fast: bool) -> Self {
        Self {
            fail_fast,
            ..Default::default()
        }
    }

    /// Record a per-item error. Under fail-fast the first one becomes the
    /// failure.
    pub fn add_recoverable(&mut self, err: impl Into<String>) {
        let err = err.into();
        if self.fail_fast && self.failure.is_none() {
            self.failure = Some(err.clone());
        }
        self.recovered.push(err);
    }

    /// Record the unrecoverable failure. The first one wins.
    pub fn fail(&mut self, err: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some(err.into());
        }
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn recovered(&self) -> &[String] {
        &self.recovered
    }
}

/// Status of a finished run.
///
/// Any unrecoverable failure is `Failed`. A run that saw no items at all is
/// `NoData`. A run that saw items but wrote none of them is `Failed`.
/// Everything else is `Completed`, recoverable errors included.
pub(crate) fn derive_status(failure: Option<&str>, items_read: usize, items_written: usize) -> OpStatus {
    if failure.is_some() {
        OpStatus::Failed
    } else if items_read == 0 && items_written == 0 {
        OpStatus::NoData
    } else if items_written == 0 {
        OpStatus::Failed
    } else {
        OpStatus::Completed
    }
}
