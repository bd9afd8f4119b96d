//! Error taxonomy for the pipeline core.
//!
//! Per-unit failures ([`HashingError`], [`ProcessingError`]) are recovered
//! inside a stage: the unit is logged, counted, and left out of the ledger so
//! the next run retries it. Everything in [`PipelineError`] halts the stage
//! that raised it and, through the orchestrator, the rest of the run.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the pipeline's error type.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// A unit's content could not be canonically serialized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashingError {
    #[error("content is not serializable: {0}")]
    NotSerializable(String),

    #[error("content contains a non-finite number")]
    NonFiniteNumber,

    #[error("content could not be read: {0}")]
    Unreadable(String),
}

/// The processing function failed for a single unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{unit}: {reason}")]
pub struct ProcessingError {
    /// Identity hash (or other short label) of the failing unit.
    pub unit: String,
    pub reason: String,
}

impl ProcessingError {
    pub fn new(unit: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self {
            unit: unit.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors that abort a stage (and with it the pipeline run).
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The processing function or the sink failed for the whole in-flight batch.
    #[error("batch failure in stage '{stage}': {reason}")]
    BatchFailure { stage: String, reason: String },

    /// A ledger or stamp file exists but cannot be trusted.
    #[error(
        "ledger corrupted at {path}: {reason} (repair the file or rerun with --clear-state)"
    )]
    LedgerCorruption { path: PathBuf, reason: String },

    /// A stage was asked to run before a dependency ever produced output.
    #[error(
        "stage '{stage}' depends on '{dependency}', which has no committed state; run '{dependency}' first"
    )]
    DependencyStale { stage: String, dependency: String },

    #[error("unknown stage '{name}' (available: {available})")]
    UnknownStage { name: String, available: String },

    #[error("invalid pipeline definition: {0}")]
    Definition(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("graph sink error: {0}")]
    Sink(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn batch(stage: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        PipelineError::BatchFailure {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Serialization(e.to_string())
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::Sink(e.to_string())
    }
}
