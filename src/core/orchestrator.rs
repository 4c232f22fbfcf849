//! Run orchestrator.
//!
//! Drives one run through the pipeline's steps, saving a checkpoint after
//! every step so an interrupted run can pick up at the next step boundary.
//!
//! - FRESH: no usable checkpoint, start from the first step
//! - RESUMING: checkpoint loaded, digest must verify before anything runs
//! - ACTIVE: executing steps, one save per step
//! - TERMINAL_SUCCESS / TERMINAL_FAILURE: the run is done

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{ProviderExecutor, ProviderRegistry, StepContext, StepExecutor};
use crate::domain::{
    error_event_name, AuditAction, AuditEntry, Checkpoint, Event, EventData, EventLedger,
    IdentityContext, RunResult, RunStatus, StepFailure,
};
use crate::error::{CheckpointError, ErrorClass, Result};

use super::integrity;
use super::pipeline::{Pipeline, RetryPolicy, STEP_MODEL_SELECT};
use super::store::{validate_run_id, CheckpointStore, SaveReceipt, SaveRequest};

/// Reason recorded on a run refused for a digest mismatch
pub const INTEGRITY_FAILURE_REASON: &str = "integrity mismatch";

/// Orchestrator lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Fresh,
    Resuming,
    Active,
    TerminalSuccess,
    TerminalFailure,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "FRESH",
            Self::Resuming => "RESUMING",
            Self::Active => "ACTIVE",
            Self::TerminalSuccess => "TERMINAL_SUCCESS",
            Self::TerminalFailure => "TERMINAL_FAILURE",
        }
    }

    /// Whether the orchestrator may move from `self` to `next`
    pub fn can_transition_to(&self, next: RunState) -> bool {
        matches!(
            (self, next),
            (Self::Fresh, Self::Resuming)
                | (Self::Fresh, Self::Active)
                | (Self::Fresh, Self::TerminalFailure)
                | (Self::Resuming, Self::Active)
                | (Self::Resuming, Self::TerminalSuccess)
                | (Self::Resuming, Self::TerminalFailure)
                | (Self::Active, Self::TerminalSuccess)
                | (Self::Active, Self::TerminalFailure)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the state of one `run` call
struct Lifecycle<'a> {
    run_id: &'a str,
    state: RunState,
}

impl<'a> Lifecycle<'a> {
    fn new(run_id: &'a str) -> Self {
        Self {
            run_id,
            state: RunState::Fresh,
        }
    }

    fn enter(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "{} -> {}",
            self.state,
            next
        );
        debug!(run_id = %self.run_id, from = %self.state, to = %next, "Run state change");
        self.state = next;
    }
}

/// A request to start or resume a run
#[derive(Clone, Serialize, Deserialize)]
pub struct RunRequest {
    /// Run to resume, or the id to create; generated when absent
    #[serde(default)]
    pub run_id: Option<String>,

    pub provider: String,
    pub model: String,

    /// Provider credential; never persisted or logged
    #[serde(default, skip_serializing)]
    pub token: String,

    /// Input snapshot (a JSON object). On resume the stored payload is used;
    /// an empty object stands for it, anything else must match it.
    pub payload: Value,

    /// Weighted routing, e.g. `"gpt-demo:0.7,gpt-fast:0.3"`
    #[serde(default)]
    pub weights: String,

    /// Continue from an existing checkpoint when one exists
    #[serde(default)]
    pub resume: bool,
}

impl fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunRequest")
            .field("run_id", &self.run_id)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("token", &"<redacted>")
            .field("weights", &self.weights)
            .field("resume", &self.resume)
            .finish_non_exhaustive()
    }
}

impl RunRequest {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, payload: Value) -> Self {
        Self {
            run_id: None,
            provider: provider.into(),
            model: model.into(),
            token: String::new(),
            payload,
            weights: String::new(),
            resume: false,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_weights(mut self, weights: impl Into<String>) -> Self {
        self.weights = weights.into();
        self
    }

    pub fn resuming(mut self) -> Self {
        self.resume = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ref run_id) = self.run_id {
            validate_run_id(run_id)?;
        }
        if self.provider.trim().is_empty() {
            return Err(CheckpointError::validation(
                "PROVIDER_EMPTY",
                "provider name must not be empty",
            ));
        }
        if !self.payload.is_object() {
            return Err(CheckpointError::validation(
                "PAYLOAD_NOT_OBJECT",
                "payload must be a JSON object",
            ));
        }
        Ok(())
    }
}

/// What the steps run on: the request for a fresh run, the verified
/// checkpoint for a resumed one
struct RunInput {
    provider: String,
    model: String,
    payload: Value,
}

/// Where the ACTIVE phase starts
struct Resumption {
    input: RunInput,
    ledger: EventLedger,
    last_step: String,
    version: Option<u64>,
    resumed: bool,
}

impl Resumption {
    fn fresh(request: &RunRequest) -> Self {
        Self {
            input: RunInput {
                provider: request.provider.clone(),
                model: request.model.clone(),
                payload: request.payload.clone(),
            },
            ledger: EventLedger::new(),
            last_step: String::new(),
            version: Some(0),
            resumed: false,
        }
    }
}

/// Main run orchestrator
pub struct Orchestrator {
    store: Arc<dyn CheckpointStore>,
    executor: Arc<dyn StepExecutor>,
    pipeline: Pipeline,
    retry: RetryPolicy,
}

impl Orchestrator {
    /// Orchestrator for the default provider pipeline
    pub fn new(store: Arc<dyn CheckpointStore>, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            store,
            executor: Arc::new(ProviderExecutor::new(registry)),
            pipeline: Pipeline::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Orchestrator for a custom step sequence
    pub fn with_executor(
        store: Arc<dyn CheckpointStore>,
        executor: Arc<dyn StepExecutor>,
        pipeline: Pipeline,
    ) -> Result<Self> {
        pipeline.validate()?;
        Ok(Self {
            store,
            executor,
            pipeline,
            retry: RetryPolicy::default(),
        })
    }

    /// Retry policy for transient save failures
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Execute or resume a run
    #[instrument(
        skip(self, ctx, request),
        fields(tenant = %ctx.tenant_id, provider = %request.provider, run_id = tracing::field::Empty)
    )]
    pub async fn run(&self, ctx: &IdentityContext, request: RunRequest) -> Result<RunResult> {
        ctx.validate()?;
        request.validate()?;

        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::Span::current().record("run_id", run_id.as_str());

        let requested = Resumption::fresh(&request);
        self.executor
            .preflight(&step_context(&run_id, &request, &requested.input, &requested.ledger))
            .map_err(|e| CheckpointError::validation(e.code(), e.to_string()))?;

        let mut lifecycle = Lifecycle::new(&run_id);

        let resumed = if request.resume {
            match self.resume_from_checkpoint(ctx, &run_id, &request, &mut lifecycle)? {
                ResumeOutcome::Continue(resumption) => Some(resumption),
                ResumeOutcome::Finished(result) => return Ok(result),
                ResumeOutcome::NoCheckpoint => {
                    info!("No checkpoint to resume, starting fresh");
                    None
                }
            }
        } else {
            None
        };

        let resumption = match resumed {
            Some(resumption) => resumption,
            None => {
                self.ensure_unclaimed(ctx, &run_id, &mut lifecycle).await?;
                requested
            }
        };

        lifecycle.enter(RunState::Active);
        self.execute_steps(ctx, &run_id, &request, resumption, &mut lifecycle)
            .await
    }

    /// RESUMING: load, verify, decide where to continue
    fn resume_from_checkpoint(
        &self,
        ctx: &IdentityContext,
        run_id: &str,
        request: &RunRequest,
        lifecycle: &mut Lifecycle<'_>,
    ) -> Result<ResumeOutcome> {
        let checkpoint = match self.store.load(ctx, run_id) {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return Ok(ResumeOutcome::NoCheckpoint),
            Err(err) if err.class() == ErrorClass::Terminal => {
                lifecycle.enter(RunState::Resuming);
                lifecycle.enter(RunState::TerminalFailure);
                self.refuse_resume(ctx, run_id, &err, None)?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        lifecycle.enter(RunState::Resuming);
        let before = resume_snapshot(&checkpoint);

        if let Err(err) = integrity::ensure_valid(
            run_id,
            &checkpoint.checkpoint_hash,
            &checkpoint.payload,
            &checkpoint.events,
        ) {
            lifecycle.enter(RunState::TerminalFailure);
            error!(code = err.code(), "Checkpoint failed integrity verification");
            self.refuse_resume(ctx, run_id, &err, Some(before))?;
            return Err(err);
        }

        match checkpoint.status {
            RunStatus::Completed => {
                lifecycle.enter(RunState::TerminalSuccess);
                info!("Run already completed, returning recorded result");
                return Ok(ResumeOutcome::Finished(RunResult {
                    run_id: run_id.to_string(),
                    success: true,
                    output: output_of(&checkpoint.events),
                    events: checkpoint.events,
                    resumed: true,
                    failure: None,
                }));
            }
            RunStatus::Failed => {
                lifecycle.enter(RunState::TerminalFailure);
                let err = CheckpointError::RunFinalized {
                    run_id: run_id.to_string(),
                    status: checkpoint.status.to_string(),
                };
                self.store.append_audit(
                    &AuditEntry::new(ctx, AuditAction::Resume, run_id, Utc::now())
                        .failed(err.code())
                        .with_states(Some(before), None),
                )?;
                return Err(err);
            }
            RunStatus::Pending | RunStatus::InProgress => {}
        }

        if checkpoint.provider_name != request.provider {
            return Err(CheckpointError::validation(
                "PROVIDER_MISMATCH",
                format!(
                    "run {} was started with provider '{}'",
                    run_id, checkpoint.provider_name
                ),
            ));
        }

        // An empty request payload means "use the stored one"
        let payload_given = request.payload.as_object().is_some_and(|p| !p.is_empty());
        if payload_given && request.payload != checkpoint.payload {
            return Err(CheckpointError::PayloadImmutable {
                run_id: run_id.to_string(),
            });
        }

        if let Err(err) = self.pipeline.resume_index(run_id, &checkpoint.last_step) {
            lifecycle.enter(RunState::TerminalFailure);
            self.refuse_resume(ctx, run_id, &err, Some(before))?;
            return Err(err);
        }

        self.store.append_audit(
            &AuditEntry::new(ctx, AuditAction::Resume, run_id, Utc::now())
                .with_states(Some(before), None),
        )?;
        info!(
            last_step = %checkpoint.last_step,
            version = checkpoint.checkpoint_version,
            "Resuming run"
        );

        Ok(ResumeOutcome::Continue(Resumption {
            input: RunInput {
                provider: checkpoint.provider_name,
                model: checkpoint.model,
                payload: checkpoint.payload,
            },
            ledger: EventLedger::from_events(checkpoint.events),
            last_step: checkpoint.last_step,
            version: Some(checkpoint.checkpoint_version),
            resumed: true,
        }))
    }

    /// FRESH: refuse an id that already has a row before any step runs
    async fn ensure_unclaimed(
        &self,
        ctx: &IdentityContext,
        run_id: &str,
        lifecycle: &mut Lifecycle<'_>,
    ) -> Result<()> {
        let current = self
            .with_store_retry("version check", || self.store.current_version(ctx, run_id))
            .await;

        let err = match current {
            Ok(None) => return Ok(()),
            Ok(Some((status, _))) if status.is_terminal() => CheckpointError::RunFinalized {
                run_id: run_id.to_string(),
                status: status.to_string(),
            },
            Ok(Some((_, version))) => CheckpointError::VersionConflict {
                run_id: run_id.to_string(),
                expected: 0,
                actual: version,
            },
            Err(err) => {
                lifecycle.enter(RunState::TerminalFailure);
                return Err(err);
            }
        };

        lifecycle.enter(RunState::TerminalFailure);
        warn!(code = err.code(), "Run id already in use");
        self.store.append_audit(
            &AuditEntry::new(ctx, AuditAction::Create, run_id, Utc::now()).failed(err.code()),
        )?;
        Err(err)
    }

    /// Record a refused resume and force the run to FAILED
    fn refuse_resume(
        &self,
        ctx: &IdentityContext,
        run_id: &str,
        err: &CheckpointError,
        before: Option<Value>,
    ) -> Result<()> {
        self.store.append_audit(
            &AuditEntry::new(ctx, AuditAction::Resume, run_id, Utc::now())
                .failed(err.code())
                .with_states(before, None),
        )?;

        let reason = match err {
            CheckpointError::IntegrityMismatch { .. } => INTEGRITY_FAILURE_REASON.to_string(),
            other => other.code().to_lowercase(),
        };
        match self.store.mark_failed(ctx, run_id, &reason) {
            Ok(()) | Err(CheckpointError::RunFinalized { .. }) => Ok(()),
            Err(mark_err) => {
                // The refusal itself is what the caller needs to see.
                warn!(error = %mark_err, "Could not mark refused run as failed");
                Ok(())
            }
        }
    }

    /// ACTIVE: run the remaining steps, saving after each
    async fn execute_steps(
        &self,
        ctx: &IdentityContext,
        run_id: &str,
        request: &RunRequest,
        resumption: Resumption,
        lifecycle: &mut Lifecycle<'_>,
    ) -> Result<RunResult> {
        let Resumption {
            input,
            mut ledger,
            mut last_step,
            mut version,
            resumed,
        } = resumption;

        let start = self.pipeline.resume_index(run_id, &last_step)?;

        for step in &self.pipeline.steps[start..] {
            let outcome = self
                .executor
                .execute(step, &step_context(run_id, request, &input, &ledger))
                .await;

            match outcome {
                Ok(data) => {
                    ledger = ledger.record(step.as_str(), data);
                    last_step = step.clone();
                    let receipt = self
                        .save_checkpoint(ctx, run_id, &input, &ledger, &last_step, version)
                        .await?;
                    version = Some(receipt.checkpoint_version);
                    debug!(%step, version = receipt.checkpoint_version, "Step checkpointed");
                }
                Err(step_err) => {
                    let message = step_err.to_string();
                    let mut data = EventData::new();
                    data.insert("error".to_string(), json!(message));
                    ledger = ledger.record(error_event_name(step), data);

                    self.save_checkpoint(ctx, run_id, &input, &ledger, &last_step, version)
                        .await?;

                    lifecycle.enter(RunState::TerminalFailure);
                    error!(%step, code = step_err.code(), error = %message, "Step failed");

                    return Ok(RunResult {
                        run_id: run_id.to_string(),
                        success: false,
                        output: json!({ "error": message }),
                        events: ledger.into_vec(),
                        resumed,
                        failure: Some(StepFailure {
                            step: step.clone(),
                            class: step_err.class(),
                            code: step_err.code().to_string(),
                            message,
                        }),
                    });
                }
            }
        }

        self.with_store_retry("completion", || self.store.mark_completed(ctx, run_id))
            .await?;
        lifecycle.enter(RunState::TerminalSuccess);
        info!(events = ledger.len(), resumed, "Run completed successfully");

        let events = ledger.into_vec();
        Ok(RunResult {
            run_id: run_id.to_string(),
            success: true,
            output: output_of(&events),
            events,
            resumed,
            failure: None,
        })
    }

    /// Save the current ledger, retrying transient failures
    async fn save_checkpoint(
        &self,
        ctx: &IdentityContext,
        run_id: &str,
        input: &RunInput,
        ledger: &EventLedger,
        last_step: &str,
        expected_version: Option<u64>,
    ) -> Result<SaveReceipt> {
        let model = ledger
            .last_named(STEP_MODEL_SELECT)
            .and_then(|e| e.data_str("chosen"))
            .unwrap_or(input.model.as_str());

        let save = SaveRequest {
            run_id,
            provider_name: &input.provider,
            model,
            payload: &input.payload,
            events: ledger.events(),
            last_step,
            expected_version,
        };

        self.with_store_retry("checkpoint save", || self.store.save(ctx, &save))
            .await
    }

    /// Run a store call with backoff on transient failures
    async fn with_store_retry<T>(
        &self,
        operation: &str,
        mut call: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match call() {
                Ok(value) => return Ok(value),
                Err(err) if err.class() == ErrorClass::Transient && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Store busy, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(operation, attempt, code = err.code(), error = %err, "Store call failed");
                    return Err(err);
                }
            }
        }
    }

    /// Read-only view of a checkpoint, returned even when its digest is bad
    pub fn inspect(&self, ctx: &IdentityContext, run_id: &str) -> Result<Option<Checkpoint>> {
        self.store.load(ctx, run_id)
    }

    /// Recorded event history of a run
    pub fn replay(&self, ctx: &IdentityContext, run_id: &str) -> Result<Vec<Event>> {
        self.store
            .load(ctx, run_id)?
            .map(|checkpoint| checkpoint.events)
            .ok_or_else(|| CheckpointError::NotFound {
                run_id: run_id.to_string(),
            })
    }
}

enum ResumeOutcome {
    Continue(Resumption),
    Finished(RunResult),
    NoCheckpoint,
}

fn step_context<'a>(
    run_id: &'a str,
    request: &'a RunRequest,
    input: &'a RunInput,
    ledger: &'a EventLedger,
) -> StepContext<'a> {
    StepContext {
        run_id,
        provider: &input.provider,
        model: &input.model,
        token: &request.token,
        weights: &request.weights,
        payload: &input.payload,
        ledger,
    }
}

fn resume_snapshot(checkpoint: &Checkpoint) -> Value {
    json!({
        "status": checkpoint.status.as_str(),
        "checkpoint_version": checkpoint.checkpoint_version,
        "last_step": checkpoint.last_step,
        "checkpoint_hash": checkpoint.checkpoint_hash,
        "integrity_valid": checkpoint.integrity_valid,
    })
}

/// Output of a run: the `output` of the last successful step that has one,
/// else the data of the last successful step.
pub fn output_of(events: &[Event]) -> Value {
    let mut completed = events.iter().rev().filter(|e| !e.is_error());
    let Some(last) = completed.clone().next() else {
        return Value::Null;
    };
    completed
        .find_map(|e| e.data.get("output").cloned())
        .unwrap_or_else(|| Value::Object(last.data.clone()))
}
