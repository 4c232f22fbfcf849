//! Run rows, checkpoints and run results.
//!
//! A Run is the single durable row kept per pipeline execution. The
//! checkpoint is the view of that row handed back by `load`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::events::Event;
use crate::error::ErrorClass;

/// Lifecycle status of a run row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Created, no step saved after the first
    Pending,

    /// At least one checkpoint update recorded
    InProgress,

    /// Finished successfully
    Completed,

    /// Finished with a failure
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// COMPLETED and FAILED are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Allowed transitions: PENDING -> IN_PROGRESS -> {COMPLETED, FAILED}.
    ///
    /// A PENDING run may be finished directly; it passes through
    /// IN_PROGRESS implicitly.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Pending) => false,
            (Self::Pending, _) => true,
            (Self::InProgress, Self::Pending) => false,
            (Self::InProgress, _) => true,
            (Self::Completed, _) | (Self::Failed, _) => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// Integrity bookkeeping for a run, one per row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityRecord {
    /// Digest stored at the most recent save
    pub computed_hash: String,

    /// Digest recomputed at the most recent load
    pub verified_hash: Option<String>,

    /// Outcome of the most recent verification
    pub integrity_valid: bool,

    /// Set once any load has seen a mismatch; never cleared
    pub hash_mismatch_detected: bool,

    /// First time a mismatch was seen
    pub mismatch_detected_at: Option<DateTime<Utc>>,

    /// Last verification time
    pub verified_at: Option<DateTime<Utc>>,
}

/// A persisted checkpoint as returned by `load` and `inspect`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Stable identifier of the run row
    pub checkpoint_id: String,

    pub run_id: String,
    pub tenant_id: String,
    pub provider_name: String,
    pub model: String,

    /// Snapshot taken at run creation
    pub payload: Value,

    /// Full event history, ordered by index
    pub events: Vec<Event>,

    /// Most recently completed step ("" if none)
    pub last_step: String,

    pub status: RunStatus,
    pub checkpoint_version: u64,

    /// Digest stored with the row
    pub checkpoint_hash: String,

    /// Whether the digest recomputed at load time matched
    pub integrity_valid: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
}

/// Compact listing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub provider_name: String,
    pub model: String,
    pub status: RunStatus,
    pub last_step: String,
    pub checkpoint_version: u64,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Why a run stopped at a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: String,
    pub class: ErrorClass,
    pub code: String,
    pub message: String,
}

/// Outcome handed back after a run finishes or fails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub success: bool,
    pub output: Value,
    pub events: Vec<Event>,
    pub resumed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
}
