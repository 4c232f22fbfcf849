//! Checkpoint store and audit log interfaces.
//!
//! Every call takes the caller's verified identity; tenant matching is part of
//! each read and write path, not a filter the caller may forget.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::domain::{
    AuditEntry, AuditQuery, Checkpoint, Event, IdentityContext, IntegrityRecord, RunStatus,
    RunSummary,
};
use crate::error::{CheckpointError, Result};

/// Input to `CheckpointStore::save`
#[derive(Debug, Clone)]
pub struct SaveRequest<'a> {
    pub run_id: &'a str,
    pub provider_name: &'a str,
    pub model: &'a str,
    pub payload: &'a Value,
    pub events: &'a [Event],
    pub last_step: &'a str,

    /// Optimistic concurrency guard: `Some(0)` requires the row to be new,
    /// `Some(v)` requires the stored version to be `v`, `None` accepts any.
    pub expected_version: Option<u64>,
}

impl SaveRequest<'_> {
    pub fn validate(&self) -> Result<()> {
        validate_run_id(self.run_id)?;
        if !self.payload.is_object() {
            return Err(CheckpointError::validation(
                "PAYLOAD_NOT_OBJECT",
                "payload must be a JSON object",
            ));
        }
        for (i, event) in self.events.iter().enumerate() {
            if event.index != i as u64 {
                return Err(CheckpointError::validation(
                    "EVENT_INDEX_GAP",
                    format!("event at position {} has index {}", i, event.index),
                ));
            }
            if event.name.trim().is_empty() {
                return Err(CheckpointError::validation(
                    "EVENT_NAME_EMPTY",
                    format!("event {} has an empty name", i),
                ));
            }
        }
        Ok(())
    }
}

/// Run ids are opaque but must be non-empty and free of whitespace
pub fn validate_run_id(run_id: &str) -> Result<()> {
    if run_id.is_empty() {
        return Err(CheckpointError::validation("RUN_ID_EMPTY", "run id must not be empty"));
    }
    if run_id.chars().any(char::is_whitespace) {
        return Err(CheckpointError::validation(
            "RUN_ID_INVALID",
            format!("run id '{}' contains whitespace", run_id.escape_debug()),
        ));
    }
    Ok(())
}

/// What a successful save wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReceipt {
    pub checkpoint_id: String,
    pub checkpoint_version: u64,
    pub checkpoint_hash: String,
    pub created: bool,
}

/// Append-only audit ledger
pub trait AuditLog: Send + Sync {
    /// The only mutation: insert one entry
    fn append_audit(&self, entry: &AuditEntry) -> Result<()>;

    /// Entries matching the filter, newest first
    fn audit_query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>>;

    /// Retention sweep: drop entries strictly older than `before`
    fn purge_audit(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Durable, tenant-partitioned run storage
pub trait CheckpointStore: AuditLog {
    /// Create or update the run row; the matching audit entry is written in
    /// the same transaction.
    fn save(&self, ctx: &IdentityContext, request: &SaveRequest<'_>) -> Result<SaveReceipt>;

    /// Load a live row owned by the caller's tenant and record the outcome of
    /// re-verifying its digest. Another tenant's row reads as `None`.
    fn load(&self, ctx: &IdentityContext, run_id: &str) -> Result<Option<Checkpoint>>;

    /// Compare a caller-recomputed digest with the stored one
    fn verify_integrity(
        &self,
        ctx: &IdentityContext,
        checkpoint_id: &str,
        recomputed_hash: &str,
    ) -> Result<bool>;

    /// Status and version of the caller's row without reading its content.
    /// Another tenant's row is a `DataIsolation` error, as for `save`.
    fn current_version(
        &self,
        ctx: &IdentityContext,
        run_id: &str,
    ) -> Result<Option<(RunStatus, u64)>>;

    /// Verification history of a run, without re-verifying
    fn integrity_record(&self, ctx: &IdentityContext, run_id: &str)
        -> Result<Option<IntegrityRecord>>;

    fn mark_completed(&self, ctx: &IdentityContext, run_id: &str) -> Result<()>;

    fn mark_failed(&self, ctx: &IdentityContext, run_id: &str, reason: &str) -> Result<()>;

    /// Delete rows with `expires_at < now`; one CLEANUP audit entry per call
    fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Caller's runs, most recently updated first
    fn list_runs(&self, ctx: &IdentityContext, limit: usize) -> Result<Vec<RunSummary>>;
}

/// Source of wall-clock time for the store
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventLedger;
    use serde_json::json;

    #[test]
    fn test_run_id_validation() {
        assert!(validate_run_id("R1").is_ok());
        assert_eq!(validate_run_id("").unwrap_err().code(), "RUN_ID_EMPTY");
        assert_eq!(validate_run_id("R 1").unwrap_err().code(), "RUN_ID_INVALID");
    }

    #[test]
    fn test_save_request_rejects_non_object_payload() {
        let payload = json!([1, 2, 3]);
        let request = SaveRequest {
            run_id: "R1",
            provider_name: "mock",
            model: "gpt-demo",
            payload: &payload,
            events: &[],
            last_step: "",
            expected_version: None,
        };
        assert_eq!(request.validate().unwrap_err().code(), "PAYLOAD_NOT_OBJECT");
    }

    #[test]
    fn test_save_request_rejects_index_gap() {
        let payload = json!({});
        let ledger = EventLedger::new().record("auth", Default::default());
        let mut events = ledger.events().to_vec();
        events[0].index = 3;

        let request = SaveRequest {
            run_id: "R1",
            provider_name: "mock",
            model: "gpt-demo",
            payload: &payload,
            events: &events,
            last_step: "auth",
            expected_version: None,
        };
        assert_eq!(request.validate().unwrap_err().code(), "EVENT_INDEX_GAP");
    }

    #[test]
    fn test_manual_clock() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::days(2));
        assert_eq!(clock.now(), start + Duration::days(2));
    }
}
