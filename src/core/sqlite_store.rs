//! SQLite-backed checkpoint store and audit log.
//!
//! One row per run in `runs`, events in the append-only `run_events` child
//! table, one integrity record per run, and an insert-only `audit_log`.
//! Every write runs inside a `BEGIN IMMEDIATE` transaction together with the
//! audit entry that describes it, so concurrent writers on the same file
//! (other connections, other processes) serialize on the version check.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    AuditAction, AuditEntry, AuditQuery, Checkpoint, Event, IdentityContext, IntegrityRecord,
    RunStatus, RunSummary,
};
use crate::error::{CheckpointError, Result};

use super::{canonical, integrity};
use super::store::{
    validate_run_id, AuditLog, CheckpointStore, Clock, SaveReceipt, SaveRequest, SystemClock,
};

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  checkpoint_id TEXT NOT NULL UNIQUE,
  tenant_id TEXT NOT NULL,
  provider_name TEXT NOT NULL,
  model TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('PENDING', 'IN_PROGRESS', 'COMPLETED', 'FAILED')),
  last_step TEXT NOT NULL DEFAULT '',
  checkpoint_version INTEGER NOT NULL CHECK (checkpoint_version >= 1),
  checkpoint_hash TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  expires_at TEXT NOT NULL,
  failure_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_tenant_run ON runs(tenant_id, run_id);
CREATE INDEX IF NOT EXISTS idx_runs_expires ON runs(expires_at);

CREATE TRIGGER IF NOT EXISTS trg_runs_tenant_immutable
BEFORE UPDATE OF tenant_id ON runs
WHEN NEW.tenant_id <> OLD.tenant_id
BEGIN
  SELECT RAISE(FAIL, 'runs.tenant_id is immutable');
END;

CREATE TABLE IF NOT EXISTS run_events (
  run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
  event_index INTEGER NOT NULL CHECK (event_index >= 0),
  name TEXT NOT NULL,
  event_json TEXT NOT NULL,
  PRIMARY KEY (run_id, event_index)
);

CREATE TRIGGER IF NOT EXISTS trg_run_events_no_update
BEFORE UPDATE ON run_events
BEGIN
  SELECT RAISE(FAIL, 'run_events is append-only');
END;

CREATE TABLE IF NOT EXISTS run_integrity (
  run_id TEXT PRIMARY KEY REFERENCES runs(run_id) ON DELETE CASCADE,
  computed_hash TEXT NOT NULL,
  verified_hash TEXT,
  integrity_valid INTEGER NOT NULL DEFAULT 1 CHECK (integrity_valid IN (0, 1)),
  hash_mismatch_detected INTEGER NOT NULL DEFAULT 0 CHECK (hash_mismatch_detected IN (0, 1)),
  mismatch_detected_at TEXT,
  verified_at TEXT
);

CREATE TABLE IF NOT EXISTS audit_log (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  timestamp TEXT NOT NULL,
  actor TEXT NOT NULL,
  tenant_id TEXT,
  action TEXT NOT NULL,
  resource_id TEXT NOT NULL,
  success INTEGER NOT NULL CHECK (success IN (0, 1)),
  error_code TEXT,
  before_state TEXT,
  after_state TEXT
);

CREATE TRIGGER IF NOT EXISTS trg_audit_log_no_update
BEFORE UPDATE ON audit_log
BEGIN
  SELECT RAISE(FAIL, 'audit_log is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_audit_tenant_time ON audit_log(tenant_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_time ON audit_log(timestamp);
";

const RUN_COLUMNS: &str = "checkpoint_id, run_id, tenant_id, provider_name, model, payload_json, \
     status, last_step, checkpoint_version, checkpoint_hash, created_at, updated_at, expires_at, \
     failure_reason";

/// Tunables for the SQLite store
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long a row lives after its last save
    pub retention: Duration,

    /// How long a writer waits on a locked database before failing
    pub busy_timeout: std::time::Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            retention: Duration::days(30),
            busy_timeout: std::time::Duration::from_millis(5000),
        }
    }
}

/// Checkpoint store on a single SQLite database
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl std::fmt::Debug for SqliteCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointStore")
            .field("clock", &self.clock)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl SqliteCheckpointStore {
    /// Open (and migrate) a database file
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CheckpointError::Store {
                    message: format!("failed to create {}: {}", parent.display(), e),
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(options.busy_timeout)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened checkpoint database");

        Self::from_connection(conn, options)
    }

    /// Private in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, StoreOptions::default())
    }

    fn from_connection(conn: Connection, options: StoreOptions) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA_V1)?;

        Ok(Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
            retention: options.retention,
        })
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CheckpointError::Store {
            message: "checkpoint connection mutex poisoned".to_string(),
        })
    }

    /// Mark a run FAILED or COMPLETED
    fn finish(
        &self,
        ctx: &IdentityContext,
        run_id: &str,
        target: RunStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        ctx.validate()?;
        validate_run_id(run_id)?;

        let action = match target {
            RunStatus::Completed => AuditAction::Complete,
            _ => AuditAction::Fail,
        };
        let now = self.clock.now();

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = match fetch_run(&tx, run_id, &ctx.tenant_id)? {
            Some(row) => row,
            None => {
                if run_exists(&tx, run_id)? {
                    record_cross_tenant(&tx, ctx, run_id, now)?;
                    tx.commit()?;
                }
                return Err(CheckpointError::NotFound {
                    run_id: run_id.to_string(),
                });
            }
        };

        let current = row.status()?;
        if !current.can_transition_to(target) {
            let err = CheckpointError::RunFinalized {
                run_id: run_id.to_string(),
                status: current.to_string(),
            };
            insert_audit(
                &tx,
                &AuditEntry::new(ctx, action, run_id, now)
                    .failed(err.code())
                    .with_states(Some(row.snapshot()), None),
            )?;
            tx.commit()?;
            return Err(err);
        }

        tx.execute(
            "UPDATE runs SET status = ?1, failure_reason = ?2, updated_at = ?3 WHERE run_id = ?4",
            params![target.as_str(), reason, format_ts(now), run_id],
        )?;

        let mut after = row.snapshot();
        after["status"] = json!(target.as_str());
        if let Some(reason) = reason {
            after["failure_reason"] = json!(reason);
        }
        insert_audit(
            &tx,
            &AuditEntry::new(ctx, action, run_id, now).with_states(Some(row.snapshot()), Some(after)),
        )?;
        tx.commit()?;

        info!(run_id, status = %target, "Run finished");
        Ok(())
    }
}

impl AuditLog for SqliteCheckpointStore {
    fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let conn = self.lock()?;
        insert_audit(&conn, entry)
    }

    fn audit_query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let mut sql = String::from(
            "SELECT seq, timestamp, actor, tenant_id, action, resource_id, success, error_code, \
             before_state, after_state FROM audit_log WHERE 1 = 1",
        );
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(ref tenant) = query.tenant_id {
            args.push(Box::new(tenant.clone()));
            sql.push_str(&format!(" AND tenant_id = ?{}", args.len()));
        }
        if let Some(ref actor) = query.actor {
            args.push(Box::new(actor.clone()));
            sql.push_str(&format!(" AND actor = ?{}", args.len()));
        }
        if let Some(action) = query.action {
            args.push(Box::new(action.as_str()));
            sql.push_str(&format!(" AND action = ?{}", args.len()));
        }
        if let Some(since) = query.since {
            args.push(Box::new(format_ts(since)));
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len()));
        }
        if let Some(until) = query.until {
            args.push(Box::new(format_ts(until)));
            sql.push_str(&format!(" AND timestamp < ?{}", args.len()));
        }
        sql.push_str(" ORDER BY timestamp DESC, seq DESC");
        if let Some(limit) = query.limit {
            args.push(Box::new(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", args.len()));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(refs.as_slice(), map_audit_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    #[instrument(skip(self))]
    fn purge_audit(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let purged = conn.execute(
            "DELETE FROM audit_log WHERE timestamp < ?1",
            params![format_ts(before)],
        )?;
        info!(purged, "Purged audit entries past retention");
        Ok(purged)
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    #[instrument(skip(self, ctx, request), fields(run_id = %request.run_id, tenant = %ctx.tenant_id))]
    fn save(&self, ctx: &IdentityContext, request: &SaveRequest<'_>) -> Result<SaveReceipt> {
        ctx.validate()?;
        request.validate()?;

        let now = self.clock.now();
        let hash = integrity::checkpoint_hash(request.payload, request.events)?;
        let payload_json = serde_json::to_string(request.payload)
            .map_err(|e| CheckpointError::Encoding(e.to_string()))?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = fetch_run(&tx, request.run_id, &ctx.tenant_id)?;
        let prepared = match existing {
            None if run_exists(&tx, request.run_id)? => Err((
                AuditAction::CrossTenantAccess,
                None,
                CheckpointError::DataIsolation {
                    run_id: request.run_id.to_string(),
                    tenant_id: ctx.tenant_id.clone(),
                },
            )),
            None => match request.expected_version {
                Some(expected) if expected != 0 => Err((
                    AuditAction::Create,
                    None,
                    CheckpointError::VersionConflict {
                        run_id: request.run_id.to_string(),
                        expected,
                        actual: 0,
                    },
                )),
                _ => Ok(None),
            },
            Some(row) => match check_update(&tx, &row, request) {
                Ok(stored_len) => Ok(Some((row, stored_len))),
                Err(err) => {
                    let before = row.snapshot();
                    Err((AuditAction::Checkpoint, Some(before), err))
                }
            },
        };

        let receipt = match prepared {
            Err((action, before, err)) => {
                // Nothing was written; record the rejected attempt and stop.
                insert_audit(
                    &tx,
                    &AuditEntry::new(ctx, action, request.run_id, now)
                        .failed(err.code())
                        .with_states(before, None),
                )?;
                tx.commit()?;
                warn!(code = err.code(), error = %err, "Checkpoint save rejected");
                return Err(err);
            }
            Ok(None) => {
                let checkpoint_id = Uuid::new_v4().to_string();
                let expires_at = now + self.retention;
                tx.execute(
                    "INSERT INTO runs (checkpoint_id, run_id, tenant_id, provider_name, model, \
                     payload_json, status, last_step, checkpoint_version, checkpoint_hash, \
                     created_at, updated_at, expires_at, failure_reason) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10, ?10, ?11, NULL)",
                    params![
                        checkpoint_id,
                        request.run_id,
                        ctx.tenant_id,
                        request.provider_name,
                        request.model,
                        payload_json,
                        RunStatus::Pending.as_str(),
                        request.last_step,
                        hash,
                        format_ts(now),
                        format_ts(expires_at),
                    ],
                )?;
                insert_events(&tx, request.run_id, request.events)?;
                tx.execute(
                    "INSERT INTO run_integrity (run_id, computed_hash, integrity_valid) \
                     VALUES (?1, ?2, 1)",
                    params![request.run_id, hash],
                )?;

                let after = snapshot(RunStatus::Pending.as_str(), 1, request.last_step, &hash);
                insert_audit(
                    &tx,
                    &AuditEntry::new(ctx, AuditAction::Create, request.run_id, now)
                        .with_states(None, Some(after)),
                )?;

                SaveReceipt {
                    checkpoint_id,
                    checkpoint_version: 1,
                    checkpoint_hash: hash,
                    created: true,
                }
            }
            Ok(Some((row, stored_len))) => {
                let next_version = row.checkpoint_version + 1;
                let expires_at = now + self.retention;
                let updated = tx.execute(
                    "UPDATE runs SET provider_name = ?1, model = ?2, status = ?3, last_step = ?4, \
                     checkpoint_version = ?5, checkpoint_hash = ?6, updated_at = ?7, \
                     expires_at = ?8 \
                     WHERE run_id = ?9 AND tenant_id = ?10 AND checkpoint_version = ?11",
                    params![
                        request.provider_name,
                        request.model,
                        RunStatus::InProgress.as_str(),
                        request.last_step,
                        next_version,
                        hash,
                        format_ts(now),
                        format_ts(expires_at),
                        request.run_id,
                        ctx.tenant_id,
                        row.checkpoint_version,
                    ],
                )?;
                if updated != 1 {
                    return Err(CheckpointError::VersionConflict {
                        run_id: request.run_id.to_string(),
                        expected: row.checkpoint_version as u64,
                        actual: row.checkpoint_version as u64 + 1,
                    });
                }

                insert_events(&tx, request.run_id, &request.events[stored_len..])?;
                tx.execute(
                    "UPDATE run_integrity SET computed_hash = ?1, integrity_valid = 1 \
                     WHERE run_id = ?2",
                    params![hash, request.run_id],
                )?;

                let after = snapshot(
                    RunStatus::InProgress.as_str(),
                    next_version,
                    request.last_step,
                    &hash,
                );
                insert_audit(
                    &tx,
                    &AuditEntry::new(ctx, AuditAction::Checkpoint, request.run_id, now)
                        .with_states(Some(row.snapshot()), Some(after)),
                )?;

                SaveReceipt {
                    checkpoint_id: row.checkpoint_id,
                    checkpoint_version: next_version as u64,
                    checkpoint_hash: hash,
                    created: false,
                }
            }
        };

        tx.commit()?;
        debug!(
            version = receipt.checkpoint_version,
            last_step = %request.last_step,
            events = request.events.len(),
            "Checkpoint saved"
        );
        Ok(receipt)
    }

    #[instrument(skip(self, ctx), fields(tenant = %ctx.tenant_id))]
    fn load(&self, ctx: &IdentityContext, run_id: &str) -> Result<Option<Checkpoint>> {
        ctx.validate()?;
        validate_run_id(run_id)?;

        let now = self.clock.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = match fetch_run(&tx, run_id, &ctx.tenant_id)? {
            Some(row) => row,
            None => {
                if run_exists(&tx, run_id)? {
                    record_cross_tenant(&tx, ctx, run_id, now)?;
                    tx.commit()?;
                    warn!("Cross-tenant checkpoint access refused");
                }
                return Ok(None);
            }
        };

        let expires_at = parse_ts(run_id, &row.expires_at)?;
        if expires_at < now {
            debug!(%expires_at, "Checkpoint expired");
            return Ok(None);
        }

        let content = decode_content(&tx, &row);
        let (payload, events) = match content {
            Ok(content) => content,
            Err(err) => {
                record_verification(&tx, run_id, None, false, now)?;
                tx.commit()?;
                return Err(err);
            }
        };

        let recomputed = integrity::checkpoint_hash(&payload, &events)?;
        let valid = integrity::verify(&row.checkpoint_hash, &recomputed);
        record_verification(&tx, run_id, Some(&recomputed), valid, now)?;
        tx.commit()?;

        if !valid {
            warn!(stored = %row.checkpoint_hash, %recomputed, "Checkpoint digest mismatch");
        }

        row.into_checkpoint(payload, events, valid).map(Some)
    }

    #[instrument(skip(self, ctx, recomputed_hash), fields(tenant = %ctx.tenant_id))]
    fn verify_integrity(
        &self,
        ctx: &IdentityContext,
        checkpoint_id: &str,
        recomputed_hash: &str,
    ) -> Result<bool> {
        ctx.validate()?;
        let now = self.clock.now();

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let found: Option<(String, String)> = tx
            .query_row(
                "SELECT run_id, checkpoint_hash FROM runs \
                 WHERE checkpoint_id = ?1 AND tenant_id = ?2",
                params![checkpoint_id, ctx.tenant_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((run_id, stored)) = found else {
            let other: Option<String> = tx
                .query_row(
                    "SELECT run_id FROM runs WHERE checkpoint_id = ?1",
                    params![checkpoint_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(run_id) = other {
                record_cross_tenant(&tx, ctx, &run_id, now)?;
                tx.commit()?;
            }
            return Err(CheckpointError::NotFound {
                run_id: checkpoint_id.to_string(),
            });
        };

        let valid = integrity::verify(&stored, recomputed_hash);
        record_verification(&tx, &run_id, Some(recomputed_hash), valid, now)?;
        tx.commit()?;
        Ok(valid)
    }

    fn current_version(
        &self,
        ctx: &IdentityContext,
        run_id: &str,
    ) -> Result<Option<(RunStatus, u64)>> {
        ctx.validate()?;
        validate_run_id(run_id)?;

        let now = self.clock.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(row) = fetch_run(&tx, run_id, &ctx.tenant_id)? {
            return Ok(Some((row.status()?, row.checkpoint_version as u64)));
        }
        if run_exists(&tx, run_id)? {
            record_cross_tenant(&tx, ctx, run_id, now)?;
            tx.commit()?;
            return Err(CheckpointError::DataIsolation {
                run_id: run_id.to_string(),
                tenant_id: ctx.tenant_id.clone(),
            });
        }
        Ok(None)
    }

    fn integrity_record(
        &self,
        ctx: &IdentityContext,
        run_id: &str,
    ) -> Result<Option<IntegrityRecord>> {
        ctx.validate()?;
        validate_run_id(run_id)?;

        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT i.computed_hash, i.verified_hash, i.integrity_valid, \
                 i.hash_mismatch_detected, i.mismatch_detected_at, i.verified_at \
                 FROM run_integrity i JOIN runs r ON r.run_id = i.run_id \
                 WHERE i.run_id = ?1 AND r.tenant_id = ?2",
                params![run_id, ctx.tenant_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((computed_hash, verified_hash, valid, mismatch, mismatch_at, verified_at)) = raw
        else {
            return Ok(None);
        };
        let parse = |raw: Option<String>| raw.map(|ts| parse_ts(run_id, &ts)).transpose();

        Ok(Some(IntegrityRecord {
            computed_hash,
            verified_hash,
            integrity_valid: valid,
            hash_mismatch_detected: mismatch,
            mismatch_detected_at: parse(mismatch_at)?,
            verified_at: parse(verified_at)?,
        }))
    }

    #[instrument(skip(self, ctx), fields(tenant = %ctx.tenant_id))]
    fn mark_completed(&self, ctx: &IdentityContext, run_id: &str) -> Result<()> {
        self.finish(ctx, run_id, RunStatus::Completed, None)
    }

    #[instrument(skip(self, ctx), fields(tenant = %ctx.tenant_id))]
    fn mark_failed(&self, ctx: &IdentityContext, run_id: &str, reason: &str) -> Result<()> {
        self.finish(ctx, run_id, RunStatus::Failed, Some(reason))
    }

    #[instrument(skip(self))]
    fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = format_ts(now);
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "DELETE FROM run_events WHERE run_id IN (SELECT run_id FROM runs WHERE expires_at < ?1)",
            params![cutoff],
        )?;
        tx.execute(
            "DELETE FROM run_integrity WHERE run_id IN (SELECT run_id FROM runs WHERE expires_at < ?1)",
            params![cutoff],
        )?;
        let deleted = tx.execute("DELETE FROM runs WHERE expires_at < ?1", params![cutoff])?;

        insert_audit(
            &tx,
            &AuditEntry::system(AuditAction::Cleanup, "runs", self.clock.now())
                .with_states(None, Some(json!({"deleted": deleted, "cutoff": cutoff}))),
        )?;
        tx.commit()?;

        info!(deleted, "Expired checkpoints removed");
        Ok(deleted)
    }

    fn list_runs(&self, ctx: &IdentityContext, limit: usize) -> Result<Vec<RunSummary>> {
        ctx.validate()?;
        let now = format_ts(self.clock.now());

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs WHERE tenant_id = ?1 AND expires_at >= ?2 \
             ORDER BY updated_at DESC, run_id LIMIT ?3",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![ctx.tenant_id, now, limit as i64], map_run_row)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_summary()?);
        }
        Ok(runs)
    }
}

/// Raw `runs` row
struct RunRow {
    checkpoint_id: String,
    run_id: String,
    tenant_id: String,
    provider_name: String,
    model: String,
    payload_json: String,
    status: String,
    last_step: String,
    checkpoint_version: i64,
    checkpoint_hash: String,
    created_at: String,
    updated_at: String,
    expires_at: String,
    failure_reason: Option<String>,
}

impl RunRow {
    fn status(&self) -> Result<RunStatus> {
        self.status
            .parse()
            .map_err(|e: String| corrupt(&self.run_id, e))
    }

    fn snapshot(&self) -> Value {
        snapshot(
            &self.status,
            self.checkpoint_version,
            &self.last_step,
            &self.checkpoint_hash,
        )
    }

    fn into_checkpoint(self, payload: Value, events: Vec<Event>, valid: bool) -> Result<Checkpoint> {
        let status = self.status()?;
        Ok(Checkpoint {
            created_at: parse_ts(&self.run_id, &self.created_at)?,
            updated_at: parse_ts(&self.run_id, &self.updated_at)?,
            expires_at: parse_ts(&self.run_id, &self.expires_at)?,
            checkpoint_id: self.checkpoint_id,
            run_id: self.run_id,
            tenant_id: self.tenant_id,
            provider_name: self.provider_name,
            model: self.model,
            payload,
            events,
            last_step: self.last_step,
            status,
            checkpoint_version: self.checkpoint_version as u64,
            checkpoint_hash: self.checkpoint_hash,
            integrity_valid: valid,
            failure_reason: self.failure_reason,
        })
    }

    fn into_summary(self) -> Result<RunSummary> {
        let status = self.status()?;
        Ok(RunSummary {
            updated_at: parse_ts(&self.run_id, &self.updated_at)?,
            expires_at: parse_ts(&self.run_id, &self.expires_at)?,
            run_id: self.run_id,
            provider_name: self.provider_name,
            model: self.model,
            status,
            last_step: self.last_step,
            checkpoint_version: self.checkpoint_version as u64,
        })
    }
}

fn map_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        checkpoint_id: row.get(0)?,
        run_id: row.get(1)?,
        tenant_id: row.get(2)?,
        provider_name: row.get(3)?,
        model: row.get(4)?,
        payload_json: row.get(5)?,
        status: row.get(6)?,
        last_step: row.get(7)?,
        checkpoint_version: row.get(8)?,
        checkpoint_hash: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        expires_at: row.get(12)?,
        failure_reason: row.get(13)?,
    })
}

/// Row lookup with the tenant predicate applied
fn fetch_run(conn: &Connection, run_id: &str, tenant_id: &str) -> Result<Option<RunRow>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM runs WHERE run_id = ?1 AND tenant_id = ?2",
                RUN_COLUMNS
            ),
            params![run_id, tenant_id],
            map_run_row,
        )
        .optional()?;
    Ok(row)
}

/// Existence check without the tenant predicate; only used to tell an
/// ordinary miss from a cross-tenant attempt, never returned to callers.
fn run_exists(conn: &Connection, run_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM runs WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn fetch_events(conn: &Connection, run_id: &str) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_index, event_json FROM run_events WHERE run_id = ?1 ORDER BY event_index",
    )?;
    let rows = stmt.query_map(params![run_id], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut events = Vec::new();
    for (position, row) in rows.enumerate() {
        let (index, json) = row?;
        if index != position as i64 {
            return Err(corrupt(run_id, format!("event index gap at {}", position)));
        }
        let event: Event = serde_json::from_str(&json)
            .map_err(|e| corrupt(run_id, format!("event {}: {}", index, e)))?;
        if event.index != index as u64 {
            return Err(corrupt(run_id, format!("event {} carries index {}", index, event.index)));
        }
        events.push(event);
    }
    Ok(events)
}

fn decode_content(conn: &Connection, row: &RunRow) -> Result<(Value, Vec<Event>)> {
    let payload: Value = serde_json::from_str(&row.payload_json)
        .map_err(|e| corrupt(&row.run_id, format!("payload: {}", e)))?;
    let events = fetch_events(conn, &row.run_id)?;
    Ok((payload, events))
}

/// Checks for an update against an existing row; returns how many events are
/// already stored.
fn check_update(conn: &Connection, row: &RunRow, request: &SaveRequest<'_>) -> Result<usize> {
    let status = row.status()?;
    if status.is_terminal() {
        return Err(CheckpointError::RunFinalized {
            run_id: row.run_id.clone(),
            status: status.to_string(),
        });
    }

    if let Some(expected) = request.expected_version {
        if expected != row.checkpoint_version as u64 {
            return Err(CheckpointError::VersionConflict {
                run_id: row.run_id.clone(),
                expected,
                actual: row.checkpoint_version as u64,
            });
        }
    }

    let (payload, stored) = decode_content(conn, row)?;
    if &payload != request.payload {
        return Err(CheckpointError::PayloadImmutable {
            run_id: row.run_id.clone(),
        });
    }

    if stored.len() > request.events.len() {
        return Err(CheckpointError::HistoryRewrite {
            run_id: row.run_id.clone(),
            index: request.events.len() as u64,
        });
    }
    for (index, (old, new)) in stored.iter().zip(request.events).enumerate() {
        if canonical::encode_value(old)? != canonical::encode_value(new)? {
            return Err(CheckpointError::HistoryRewrite {
                run_id: row.run_id.clone(),
                index: index as u64,
            });
        }
    }

    Ok(stored.len())
}

fn insert_events(conn: &Connection, run_id: &str, events: &[Event]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO run_events (run_id, event_index, name, event_json) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for event in events {
        let json =
            serde_json::to_string(event).map_err(|e| CheckpointError::Encoding(e.to_string()))?;
        stmt.execute(params![run_id, event.index as i64, event.name, json])?;
    }
    Ok(())
}

fn record_verification(
    conn: &Connection,
    run_id: &str,
    verified_hash: Option<&str>,
    valid: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    let ts = format_ts(now);
    conn.execute(
        "UPDATE run_integrity SET verified_hash = ?1, integrity_valid = ?2, verified_at = ?3, \
         hash_mismatch_detected = CASE WHEN ?2 = 0 THEN 1 ELSE hash_mismatch_detected END, \
         mismatch_detected_at = CASE WHEN ?2 = 0 THEN COALESCE(mismatch_detected_at, ?3) \
                                     ELSE mismatch_detected_at END \
         WHERE run_id = ?4",
        params![verified_hash, valid, ts, run_id],
    )?;
    Ok(())
}

fn record_cross_tenant(
    conn: &Connection,
    ctx: &IdentityContext,
    run_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let entry = AuditEntry::new(ctx, AuditAction::CrossTenantAccess, run_id, now)
        .failed("AGENCY_BOUNDARY_CROSSED");
    insert_audit(conn, &entry)
}

fn insert_audit(conn: &Connection, entry: &AuditEntry) -> Result<()> {
    let before = entry.before_state.as_ref().map(Value::to_string);
    let after = entry.after_state.as_ref().map(Value::to_string);
    conn.execute(
        "INSERT INTO audit_log (timestamp, actor, tenant_id, action, resource_id, success, \
         error_code, before_state, after_state) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            format_ts(entry.timestamp),
            entry.actor,
            entry.tenant_id,
            entry.action.as_str(),
            entry.resource_id,
            entry.success,
            entry.error_code,
            before,
            after,
        ],
    )?;
    Ok(())
}

/// Raw `audit_log` row
struct AuditRow {
    seq: i64,
    timestamp: String,
    actor: String,
    tenant_id: Option<String>,
    action: String,
    resource_id: String,
    success: bool,
    error_code: Option<String>,
    before_state: Option<String>,
    after_state: Option<String>,
}

impl AuditRow {
    fn into_entry(self) -> Result<AuditEntry> {
        let bad = |msg: String| CheckpointError::Store {
            message: format!("audit entry {}: {}", self.seq, msg),
        };
        let parse_state = |raw: &Option<String>| -> Result<Option<Value>> {
            raw.as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()
                .map_err(|e| bad(e.to_string()))
        };

        Ok(AuditEntry {
            seq: self.seq,
            timestamp: DateTime::parse_from_rfc3339(&self.timestamp)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| bad(e.to_string()))?,
            action: self.action.parse().map_err(|e: String| bad(e))?,
            before_state: parse_state(&self.before_state)?,
            after_state: parse_state(&self.after_state)?,
            actor: self.actor,
            tenant_id: self.tenant_id,
            resource_id: self.resource_id,
            success: self.success,
            error_code: self.error_code,
        })
    }
}

fn map_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRow> {
    Ok(AuditRow {
        seq: row.get(0)?,
        timestamp: row.get(1)?,
        actor: row.get(2)?,
        tenant_id: row.get(3)?,
        action: row.get(4)?,
        resource_id: row.get(5)?,
        success: row.get(6)?,
        error_code: row.get(7)?,
        before_state: row.get(8)?,
        after_state: row.get(9)?,
    })
}

fn snapshot(status: &str, version: i64, last_step: &str, hash: &str) -> Value {
    json!({
        "status": status,
        "checkpoint_version": version,
        "last_step": last_step,
        "checkpoint_hash": hash,
    })
}

fn corrupt(run_id: &str, message: impl Into<String>) -> CheckpointError {
    CheckpointError::Corrupt {
        run_id: run_id.to_string(),
        message: message.into(),
    }
}

/// Fixed-width UTC timestamps so text comparison matches time order
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(run_id: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(run_id, format!("timestamp '{}': {}", raw, e)))
}
