//! Command-line interface for runvault.
//!
//! Provides commands for running and resuming provider runs, inspecting and
//! replaying checkpoints, operator status changes, retention cleanup and
//! audit queries.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::adapters::ProviderRegistry;
use crate::config::{self, ENV_ACTOR, ENV_TENANT};
use crate::core::{
    AuditLog, CheckpointStore, Orchestrator, RunRequest, SqliteCheckpointStore,
};
use crate::domain::{AuditAction, AuditQuery, IdentityContext};

/// runvault - resumable, integrity-verified checkpoints for pipeline runs
#[derive(Parser, Debug)]
#[command(name = "runvault")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Tenant the caller acts for
    #[arg(long, global = true, env = ENV_TENANT)]
    pub tenant: Option<String>,

    /// Actor recorded in audit entries
    #[arg(long, global = true, env = ENV_ACTOR)]
    pub actor: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run (or resume) a provider pipeline
    Run {
        /// Provider plugin (see `runvault providers`)
        #[arg(short, long)]
        provider: String,

        /// Requested model
        #[arg(short, long, default_value = "gpt-demo")]
        model: String,

        /// Provider token
        #[arg(short, long, default_value = "")]
        token: String,

        /// JSON object to process (a resume reuses the stored one)
        #[arg(long, conflicts_with = "payload_file")]
        payload: Option<String>,

        /// Read the JSON payload from a file
        #[arg(long)]
        payload_file: Option<PathBuf>,

        /// Weighted model routing, e.g. "gpt-demo:0.7,gpt-fast:0.3"
        #[arg(short, long, default_value = "")]
        weights: String,

        /// Run ID (generated if not given)
        #[arg(long)]
        run_id: Option<String>,

        /// Continue from the run's checkpoint
        #[arg(long, requires = "run_id")]
        resume: bool,
    },

    /// Show a checkpoint and its integrity status
    Inspect {
        /// Run ID
        run_id: String,

        /// Print the full checkpoint as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the event log of a run
    Replay {
        /// Run ID
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Mark a run completed
    Complete {
        /// Run ID
        run_id: String,
    },

    /// Mark a run failed
    Fail {
        /// Run ID
        run_id: String,

        /// Why the run is being failed
        #[arg(short, long, default_value = "failed by operator")]
        reason: String,
    },

    /// Delete expired checkpoints and audit entries past retention
    Cleanup,

    /// Query the audit log
    Audit {
        /// Only entries by this actor
        #[arg(long)]
        by: Option<String>,

        /// Only this action (CREATE, CHECKPOINT, RESUME, ...)
        #[arg(long)]
        action: Option<AuditAction>,

        /// Entries at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Entries before this time (RFC 3339)
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        /// Include every tenant (and system entries)
        #[arg(long)]
        all_tenants: bool,

        /// Maximum number of entries to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// List available providers
    Providers,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let identity = Identity {
            tenant: self.tenant,
            actor: self.actor,
        };

        match self.command {
            Commands::Run {
                provider,
                model,
                token,
                payload,
                payload_file,
                weights,
                run_id,
                resume,
            } => {
                let payload = read_payload(payload, payload_file)?;
                let mut request = RunRequest::new(provider, model, payload)
                    .with_token(token)
                    .with_weights(weights);
                request.run_id = run_id;
                request.resume = resume;
                run(&identity, request).await
            }
            Commands::Inspect { run_id, json } => inspect(&identity, &run_id, json),
            Commands::Replay { run_id } => replay(&identity, &run_id),
            Commands::Runs { limit } => list_runs(&identity, limit),
            Commands::Complete { run_id } => complete(&identity, &run_id),
            Commands::Fail { run_id, reason } => fail(&identity, &run_id, &reason),
            Commands::Cleanup => cleanup(),
            Commands::Audit {
                by,
                action,
                since,
                until,
                all_tenants,
                limit,
            } => {
                let mut query = if all_tenants {
                    AuditQuery::default()
                } else {
                    AuditQuery::tenant(identity.context()?.tenant_id)
                };
                query.actor = by;
                query.action = action;
                query.since = since;
                query.until = until;
                query.limit = Some(limit);
                audit(&query)
            }
            Commands::Providers => list_providers(),
            Commands::Config => show_config(),
        }
    }
}

/// Identity as given on the command line, before config fallbacks
struct Identity {
    tenant: Option<String>,
    actor: Option<String>,
}

impl Identity {
    fn context(&self) -> Result<IdentityContext> {
        let cfg = config::config()?;

        let tenant = self
            .tenant
            .clone()
            .or_else(|| cfg.tenant.clone())
            .with_context(|| format!("No tenant given; use --tenant or {}", ENV_TENANT))?;
        let actor = self
            .actor
            .clone()
            .or_else(|| cfg.actor.clone())
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "cli".to_string());

        let ctx = IdentityContext::new(tenant, actor);
        ctx.validate()?;
        Ok(ctx)
    }
}

fn open_store() -> Result<Arc<SqliteCheckpointStore>> {
    let cfg = config::config()?;
    let store = SqliteCheckpointStore::open(&cfg.database, cfg.store_options())
        .with_context(|| format!("Failed to open checkpoint database: {}", cfg.database.display()))?;
    Ok(Arc::new(store))
}

fn read_payload(inline: Option<String>, file: Option<PathBuf>) -> Result<Value> {
    let text = match (inline, file) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read payload file: {}", path.display()))?,
        (None, None) => "{}".to_string(),
    };
    serde_json::from_str(&text).context("Payload is not valid JSON")
}

/// Run or resume a provider pipeline
async fn run(identity: &Identity, request: RunRequest) -> Result<()> {
    let ctx = identity.context()?;
    let cfg = config::config()?;

    let store: Arc<dyn CheckpointStore> = open_store()?;
    let orchestrator = Orchestrator::new(store, Arc::new(ProviderRegistry::with_defaults()))
        .with_retry(cfg.store.save_retry.clone());

    let result = orchestrator.run(&ctx, request).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.success {
        eprintln!(
            "\n[Run {} completed{}]",
            result.run_id,
            if result.resumed { " (resumed)" } else { "" }
        );
    } else {
        let reason = result
            .failure
            .as_ref()
            .map(|f| format!("{} at step '{}': {}", f.code, f.step, f.message))
            .unwrap_or_else(|| "unknown failure".to_string());
        eprintln!("\n[Run {} failed: {}]", result.run_id, reason);
        eprintln!("[Resume with: runvault run --provider <p> --run-id {} --resume]", result.run_id);
        std::process::exit(1);
    }

    Ok(())
}

/// Show a checkpoint (even a tampered one)
fn inspect(identity: &Identity, run_id: &str, json: bool) -> Result<()> {
    let ctx = identity.context()?;
    let store = open_store()?;

    let Some(cp) = store.load(&ctx, run_id)? else {
        anyhow::bail!("Run {} not found", run_id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&cp)?);
        return Ok(());
    }

    println!("Run ID:        {}", cp.run_id);
    println!("Checkpoint ID: {}", cp.checkpoint_id);
    println!("Provider:      {}", cp.provider_name);
    println!("Model:         {}", cp.model);
    println!("Status:        {}", cp.status);
    println!(
        "Last step:     {}",
        if cp.last_step.is_empty() { "(none)" } else { cp.last_step.as_str() }
    );
    println!("Version:       {}", cp.checkpoint_version);
    println!("Events:        {}", cp.events.len());
    println!("Hash:          {}", cp.checkpoint_hash);
    println!(
        "Integrity:     {}",
        if cp.integrity_valid { "valid" } else { "MISMATCH (resume will be refused)" }
    );
    if let Some(at) = store
        .integrity_record(&ctx, run_id)?
        .and_then(|record| record.mismatch_detected_at)
    {
        println!("Mismatch seen: {}", at);
    }
    println!("Updated:       {}", cp.updated_at);
    println!("Expires:       {}", cp.expires_at);
    if let Some(reason) = cp.failure_reason {
        println!("Failure:       {}", reason);
    }

    Ok(())
}

/// Print a run's events in order
fn replay(identity: &Identity, run_id: &str) -> Result<()> {
    let ctx = identity.context()?;
    let store = open_store()?;

    let Some(cp) = store.load(&ctx, run_id)? else {
        anyhow::bail!("Run {} not found", run_id);
    };

    println!("Replaying {} events for run {}:", cp.events.len(), cp.run_id);
    for event in &cp.events {
        println!(
            "  [{}] {} {} {}",
            event.index,
            event.timestamp.to_rfc3339(),
            event.name,
            Value::Object(event.data.clone())
        );
    }

    Ok(())
}

/// List recent runs
fn list_runs(identity: &Identity, limit: usize) -> Result<()> {
    let ctx = identity.context()?;
    let runs = open_store()?.list_runs(&ctx, limit)?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!(
        "{:<38} {:<10} {:<12} {:<14} {:>4}",
        "RUN ID", "PROVIDER", "STATUS", "LAST STEP", "VER"
    );
    println!("{}", "-".repeat(82));

    for run in runs {
        println!(
            "{:<38} {:<10} {:<12} {:<14} {:>4}",
            run.run_id, run.provider_name, run.status, run.last_step, run.checkpoint_version
        );
    }

    Ok(())
}

fn complete(identity: &Identity, run_id: &str) -> Result<()> {
    let ctx = identity.context()?;
    open_store()?.mark_completed(&ctx, run_id)?;
    eprintln!("[Run {} marked COMPLETED]", run_id);
    Ok(())
}

fn fail(identity: &Identity, run_id: &str, reason: &str) -> Result<()> {
    let ctx = identity.context()?;
    open_store()?.mark_failed(&ctx, run_id, reason)?;
    eprintln!("[Run {} marked FAILED: {}]", run_id, reason);
    Ok(())
}

/// Apply both retention policies
fn cleanup() -> Result<()> {
    let cfg = config::config()?;
    let store = open_store()?;
    let now = Utc::now();

    let runs = store.cleanup_expired(now)?;
    let entries = store.purge_audit(now - cfg.audit_retention())?;

    println!("Removed {} expired checkpoints", runs);
    println!("Purged {} audit entries older than {} days", entries, cfg.retention.audit_days);
    Ok(())
}

fn audit(query: &AuditQuery) -> Result<()> {
    let entries = open_store()?.audit_query(query)?;

    if entries.is_empty() {
        println!("No audit entries found");
        return Ok(());
    }

    println!(
        "{:<28} {:<20} {:<12} {:<20} {:<38} {}",
        "TIMESTAMP", "ACTION", "TENANT", "ACTOR", "RESOURCE", "RESULT"
    );
    println!("{}", "-".repeat(130));

    for entry in entries {
        let result = if entry.success {
            "ok".to_string()
        } else {
            entry.error_code.unwrap_or_else(|| "failed".to_string())
        };
        println!(
            "{:<28} {:<20} {:<12} {:<20} {:<38} {}",
            entry.timestamp.to_rfc3339(),
            entry.action,
            entry.tenant_id.as_deref().unwrap_or("-"),
            entry.actor,
            entry.resource_id,
            result
        );
    }

    Ok(())
}

fn list_providers() -> Result<()> {
    let registry = ProviderRegistry::with_defaults();
    println!("Available providers:");
    for name in registry.names() {
        println!("  {}", name);
    }
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("runvault configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    println!();
    println!("Retention:");
    println!("  Checkpoints: {} days", cfg.retention.checkpoint_days);
    println!("  Audit log:   {} days", cfg.retention.audit_days);
    println!();
    println!("Store:");
    println!("  Busy timeout:    {}ms", cfg.store.busy_timeout_ms);
    println!(
        "  Save retry:      {} attempts, {}ms initial, {}ms max, x{}",
        cfg.store.save_retry.max_attempts,
        cfg.store.save_retry.initial_delay_ms,
        cfg.store.save_retry.max_delay_ms,
        cfg.store.save_retry.backoff_multiplier
    );
    println!();
    println!("Identity defaults:");
    println!("  Tenant: {}", cfg.tenant.as_deref().unwrap_or("(none)"));
    println!("  Actor:  {}", cfg.actor.as_deref().unwrap_or("(none)"));

    Ok(())
}
