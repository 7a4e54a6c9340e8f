//! Error types shared by the model store, manifest selection, backup bases
//! and the operation orchestrator.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Reserved tag key: {0}")]
    ReservedTag(String),

    #[error("Unrecognized model type: {0}")]
    UnknownModelType(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Model type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Identity mismatch: {0}")]
    IdentityMismatch(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No data: {0}")]
    NoData(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// True when the error means "absent" rather than "failed".
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
