//! Error taxonomy for rpmdoctor.

use std::path::PathBuf;

/// Errors that end a run (or prevent it from starting).
///
/// External command failures are *not* errors: the supervisor reports them
/// as data (`CommandResult`) and the probes translate them into symptoms.
/// Only configuration problems, missing tooling, and violated invariants
/// propagate as `Err`.
#[derive(Debug, thiserror::Error)]
pub enum DoctorError {
    /// Invalid configuration (bad flag value, unusable dbpath, no disk space).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A required external binary could not be resolved.
    #[error("required binary not found: {0}")]
    MissingBinary(String),

    /// lsof is missing or unusable and a repair requires holder information.
    #[error("file-handle inspector unavailable: {0}")]
    InspectorUnavailable(String),

    /// Another package manager holds the lock.
    #[error("package manager lock held at {0}")]
    LockContention(PathBuf),

    /// The overall run deadline was exceeded.
    #[error("overall run deadline exceeded")]
    Deadline,

    /// A state-machine invariant was violated. Always a bug.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for rpmdoctor-core operations.
pub type Result<T> = std::result::Result<T, DoctorError>;
