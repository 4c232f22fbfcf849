//! Structured errors for the checkpoint subsystem.
//!
//! Every failure carries a class (which decides retry behaviour), a stable
//! code for callers and audit records, and enough context (run, tenant, step)
//! to act on it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the core.
pub type Result<T, E = CheckpointError> = std::result::Result<T, E>;

/// Error classes used for routing and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// Malformed input, never retried
    Validation,

    /// Store temporarily unavailable, retry with backoff
    Transient,

    /// Corrupted or tampered state, run is forced to FAILED
    Terminal,

    /// Tenant mismatch on access
    DataIsolation,

    /// Store read/write failure
    Checkpoint,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Transient => "TRANSIENT_ERROR",
            Self::Terminal => "TERMINAL_ERROR",
            Self::DataIsolation => "DATA_ISOLATION_ERROR",
            Self::Checkpoint => "CHECKPOINT_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the store, the verifier and the orchestrator
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("invalid input: {message}")]
    Validation { code: &'static str, message: String },

    #[error("checkpoint store busy: {message}")]
    StoreBusy { message: String },

    #[error("checkpoint store failure: {message}")]
    Store { message: String },

    #[error("access denied for run {run_id}: data isolation policy violated")]
    DataIsolation { run_id: String, tenant_id: String },

    #[error("run {run_id} not found")]
    NotFound { run_id: String },

    #[error("run {run_id} is already {status} and cannot change")]
    RunFinalized { run_id: String, status: String },

    #[error("version conflict on run {run_id}: expected {expected}, found {actual}")]
    VersionConflict {
        run_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("payload of run {run_id} is immutable after creation")]
    PayloadImmutable { run_id: String },

    #[error("event history of run {run_id} diverges at index {index}")]
    HistoryRewrite { run_id: String, index: u64 },

    #[error("integrity check failed for run {run_id}: stored {stored}, recomputed {recomputed}")]
    IntegrityMismatch {
        run_id: String,
        stored: String,
        recomputed: String,
    },

    #[error("checkpoint content of run {run_id} is corrupt: {message}")]
    Corrupt { run_id: String, message: String },

    #[error("run {run_id} is at unknown step '{step}'")]
    UnknownStep { run_id: String, step: String },

    #[error("value is not encodable: {0}")]
    Encoding(String),
}

impl CheckpointError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation { .. } | Self::PayloadImmutable { .. } => ErrorClass::Validation,
            Self::StoreBusy { .. } => ErrorClass::Transient,
            Self::DataIsolation { .. } => ErrorClass::DataIsolation,
            Self::Store { .. }
            | Self::NotFound { .. }
            | Self::VersionConflict { .. }
            | Self::IntegrityMismatch { .. } => ErrorClass::Checkpoint,
            Self::RunFinalized { .. }
            | Self::HistoryRewrite { .. }
            | Self::Corrupt { .. }
            | Self::UnknownStep { .. }
            | Self::Encoding(_) => ErrorClass::Terminal,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. } => *code,
            Self::StoreBusy { .. } => "STORE_BUSY",
            Self::Store { .. } => "STORE_FAILURE",
            Self::DataIsolation { .. } => "AGENCY_BOUNDARY_CROSSED",
            Self::NotFound { .. } => "CHECKPOINT_NOT_FOUND",
            Self::RunFinalized { .. } => "RUN_ALREADY_FINAL",
            Self::VersionConflict { .. } => "VERSION_CONFLICT",
            Self::PayloadImmutable { .. } => "PAYLOAD_IMMUTABLE",
            Self::HistoryRewrite { .. } => "EVENT_HISTORY_REWRITE",
            Self::IntegrityMismatch { .. } => "CHECKPOINT_INTEGRITY_MISMATCH",
            Self::Corrupt { .. } => "CHECKPOINT_CORRUPT",
            Self::UnknownStep { .. } => "UNKNOWN_RUN_STATE",
            Self::Encoding(_) => "NOT_ENCODABLE",
        }
    }

    /// Integrity failures are Checkpoint-class but must never be retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::IntegrityMismatch { .. } | Self::NotFound { .. } => false,
            _ => matches!(
                self.class(),
                ErrorClass::Transient | ErrorClass::Checkpoint
            ),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self.class() {
            ErrorClass::Validation => 400,
            ErrorClass::Transient => 503,
            ErrorClass::DataIsolation => 403,
            ErrorClass::Terminal | ErrorClass::Checkpoint => match self {
                Self::NotFound { .. } => 404,
                Self::VersionConflict { .. } => 409,
                _ => 500,
            },
        }
    }
}

impl From<rusqlite::Error> for CheckpointError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => Self::StoreBusy {
                message: err.to_string(),
            },
            _ => Self::Store {
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_mapping() {
        let err = CheckpointError::validation("RUN_ID_EMPTY", "run id is empty");
        assert_eq!(err.class(), ErrorClass::Validation);
        assert_eq!(err.code(), "RUN_ID_EMPTY");
        assert!(!err.retryable());
        assert_eq!(err.http_status(), 400);

        let busy = CheckpointError::StoreBusy {
            message: "database is locked".to_string(),
        };
        assert_eq!(busy.class(), ErrorClass::Transient);
        assert!(busy.retryable());
        assert_eq!(busy.http_status(), 503);
    }

    #[test]
    fn test_integrity_mismatch_is_not_retryable() {
        let err = CheckpointError::IntegrityMismatch {
            run_id: "R1".to_string(),
            stored: "aa".to_string(),
            recomputed: "bb".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Checkpoint);
        assert!(!err.retryable());
    }

    #[test]
    fn test_data_isolation_hides_other_tenant() {
        let err = CheckpointError::DataIsolation {
            run_id: "R2".to_string(),
            tenant_id: "nasa".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::DataIsolation);
        assert_eq!(err.http_status(), 403);
        assert!(!err.to_string().contains("noaa"));
    }

    #[test]
    fn test_version_conflict_is_retryable() {
        let err = CheckpointError::VersionConflict {
            run_id: "R1".to_string(),
            expected: 1,
            actual: 2,
        };
        assert!(err.retryable());
        assert_eq!(err.http_status(), 409);
    }
}
