//! Core checkpoint logic.
//!
//! This module contains:
//! - Canonical: deterministic encoding of checkpoint content
//! - Integrity: digests and verification
//! - Store: storage and audit interfaces, plus the SQLite implementation
//! - Pipeline: step sequences and the save retry policy
//! - Orchestrator: main execution engine

pub mod canonical;
pub mod integrity;
pub mod orchestrator;
pub mod pipeline;
pub mod sqlite_store;
pub mod store;

// Re-export commonly used types
pub use orchestrator::{Orchestrator, RunRequest, RunState};
pub use pipeline::{Pipeline, RetryPolicy};
pub use sqlite_store::{SqliteCheckpointStore, StoreOptions};
pub use store::{
    AuditLog, CheckpointStore, Clock, ManualClock, SaveReceipt, SaveRequest, SystemClock,
};
