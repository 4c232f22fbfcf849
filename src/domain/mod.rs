//! Domain types for the checkpoint subsystem.
//!
//! This module contains the plain data structures:
//! - Events and the append-only EventLedger
//! - Run status, checkpoints and run results
//! - Audit entries and queries
//! - Caller identity

pub mod audit;
pub mod events;
pub mod identity;
pub mod ledger;
pub mod run;

// Re-export commonly used types
pub use audit::{AuditAction, AuditEntry, AuditQuery, SYSTEM_ACTOR};
pub use events::{error_event_name, Event, EventData};
pub use identity::IdentityContext;
pub use ledger::EventLedger;
pub use run::{Checkpoint, IntegrityRecord, RunResult, RunStatus, RunSummary, StepFailure};
