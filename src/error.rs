//! Error handling module
//!
//! Separates infrastructure faults (the check could not run) from the one
//! expected failure (model changes without a migration).

use crate::config::ConfigError;
use crate::diff::PendingDiff;
use crate::migration::{GraphError, MigrationKey};
use std::path::PathBuf;
use thiserror::Error;

/// Anything that stops the pending diff from being computed
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid model definition: {0}")]
    InvalidModel(String),

    #[error("Invalid migration log: {0}")]
    Graph(#[from] GraphError),

    #[error("Migration {migration} cannot be replayed: {message}")]
    Replay { migration: MigrationKey, message: String },
}

impl GateError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GateError::Io { path: path.into(), source }
    }

    pub fn parse(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        GateError::Parse { path: path.into(), source }
    }
}

/// How failures map onto process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitPolicy {
    /// Both failure kinds exit 1
    #[default]
    Collapsed,
    /// Pending changes exit 1, computation failures exit 2
    Distinct,
}

/// The two ways a check can fail
#[derive(Error, Debug)]
pub enum CheckFailure {
    #[error("{} unapplied model change(s) detected", .0.len())]
    PendingChangesDetected(PendingDiff),

    #[error("Diff computation failed: {0}")]
    DiffComputationFailed(#[from] GateError),
}

impl CheckFailure {
    pub fn exit_code(&self, policy: ExitPolicy) -> u8 {
        match (self, policy) {
            (CheckFailure::PendingChangesDetected(_), _) => 1,
            (CheckFailure::DiffComputationFailed(_), ExitPolicy::Collapsed) => 1,
            (CheckFailure::DiffComputationFailed(_), ExitPolicy::Distinct) => 2,
        }
    }

    /// Stable tag used in log records
    pub fn kind(&self) -> &'static str {
        match self {
            CheckFailure::PendingChangesDetected(_) => "pending_changes_detected",
            CheckFailure::DiffComputationFailed(_) => "diff_computation_failed",
        }
    }
}

/// Result type alias for gate internals
pub type GateResult<T> = Result<T, GateError>;
