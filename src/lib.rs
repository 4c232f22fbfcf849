//! runvault - Resumable, integrity-verified checkpoints for pipeline runs
//!
//! A multi-stage run saves a checkpoint after every step and can be resumed
//! from the last completed step after an interruption.
//!
//! # Architecture
//!
//! The system is built around an append-only history:
//! - Every step outcome is an immutable event in the run's ledger
//! - Each checkpoint carries a SHA-256 digest over its canonical encoding,
//!   and resume refuses content whose digest does not match
//! - Storage is tenant-partitioned and every mutation is audited
//!
//! # Modules
//!
//! - `adapters`: Providers, the provider registry and step executors
//! - `core`: Canonical encoding, integrity, checkpoint store, orchestrator
//! - `domain`: Data structures (Event, EventLedger, Checkpoint, AuditEntry)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline
//! runvault --tenant nasa run --provider mock --token t --payload '{"q":1}'
//!
//! # Inspect a checkpoint
//! runvault --tenant nasa inspect <run-id>
//!
//! # Resume an interrupted run
//! runvault --tenant nasa run --provider mock --token t --run-id <run-id> --resume
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use adapters::{Provider, ProviderClient, ProviderRegistry, StepExecutor};
pub use core::{CheckpointStore, Orchestrator, RunRequest, SqliteCheckpointStore};
pub use domain::{AuditAction, AuditEntry, Event, EventLedger, IdentityContext, RunResult, RunStatus};
pub use error::{CheckpointError, ErrorClass};
