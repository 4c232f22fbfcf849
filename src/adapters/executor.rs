//! Step executors.
//!
//! The orchestrator knows step names only; what a step does is up to the
//! executor. `ProviderExecutor` runs the default `auth → model_select → call`
//! pipeline against the provider registry.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::core::pipeline::{STEP_AUTH, STEP_CALL, STEP_MODEL_SELECT};
use crate::domain::{EventData, EventLedger};

use super::{routing, ProviderError, ProviderRegistry};

/// What a step sees of the run
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub run_id: &'a str,
    pub provider: &'a str,
    pub model: &'a str,
    pub token: &'a str,
    pub weights: &'a str,
    pub payload: &'a Value,

    /// Events recorded so far (including those restored on resume)
    pub ledger: &'a EventLedger,
}

/// Executes one named step and returns the data for its event
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Reject a run before any step executes
    fn preflight(&self, _ctx: &StepContext<'_>) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn execute(&self, step: &str, ctx: &StepContext<'_>) -> Result<EventData, ProviderError>;
}

/// Executor for the built-in provider pipeline
#[derive(Debug, Clone)]
pub struct ProviderExecutor {
    registry: Arc<ProviderRegistry>,
}

impl ProviderExecutor {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// Model picked by an earlier `model_select`, else the requested one
    fn chosen_model<'a>(ctx: &StepContext<'a>) -> &'a str {
        ctx.ledger
            .last_named(STEP_MODEL_SELECT)
            .and_then(|e| e.data_str("chosen"))
            .unwrap_or(ctx.model)
    }
}

#[async_trait]
impl StepExecutor for ProviderExecutor {
    fn preflight(&self, ctx: &StepContext<'_>) -> Result<(), ProviderError> {
        self.registry.get(ctx.provider).map(|_| ())
    }

    async fn execute(&self, step: &str, ctx: &StepContext<'_>) -> Result<EventData, ProviderError> {
        let provider = self.registry.get(ctx.provider)?;
        let mut data = EventData::new();

        match step {
            STEP_AUTH => {
                provider.authenticate(ctx.token).await?;
                data.insert("provider".to_string(), json!(ctx.provider));
            }
            STEP_MODEL_SELECT => {
                let chosen = routing::select_model(ctx.run_id, ctx.model, ctx.weights);
                debug!(run_id = %ctx.run_id, requested = %ctx.model, %chosen, "Model selected");
                data.insert("requested".to_string(), json!(ctx.model));
                data.insert("chosen".to_string(), json!(chosen));
                data.insert("weights".to_string(), json!(ctx.weights));
            }
            STEP_CALL => {
                // Sessions are not checkpointed; a resumed run logs in again.
                let client = provider.authenticate(ctx.token).await?;
                let model = Self::chosen_model(ctx);
                let output = client.call(model, ctx.payload).await?;
                data.insert("provider".to_string(), json!(ctx.provider));
                data.insert("model".to_string(), json!(model));
                data.insert("output".to_string(), Value::Object(output));
            }
            other => return Err(ProviderError::UnknownStep(other.to_string())),
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(ledger: &'a EventLedger, payload: &'a Value, provider: &'a str) -> StepContext<'a> {
        StepContext {
            run_id: "R1",
            provider,
            model: "gpt-demo",
            token: "t",
            weights: "gpt-fast:1",
            payload,
            ledger,
        }
    }

    #[tokio::test]
    async fn test_provider_steps() {
        let executor = ProviderExecutor::new(Arc::new(ProviderRegistry::with_defaults()));
        let payload = json!({"q": "hi"});

        let ledger = EventLedger::new();
        let auth = executor.execute("auth", &ctx(&ledger, &payload, "mock")).await.unwrap();
        assert_eq!(auth["provider"], "mock");

        let ledger = ledger.record("auth", auth);
        let select = executor
            .execute("model_select", &ctx(&ledger, &payload, "mock"))
            .await
            .unwrap();
        assert_eq!(select["chosen"], "gpt-fast");

        let ledger = ledger.record("model_select", select);
        let call = executor.execute("call", &ctx(&ledger, &payload, "mock")).await.unwrap();
        assert_eq!(call["model"], "gpt-fast");
        assert_eq!(call["output"]["echo"], payload);
    }

    #[tokio::test]
    async fn test_unknown_step_and_provider() {
        let executor = ProviderExecutor::new(Arc::new(ProviderRegistry::with_defaults()));
        let payload = json!({});
        let ledger = EventLedger::new();

        let err = executor
            .execute("publish", &ctx(&ledger, &payload, "mock"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_STEP");

        let err = executor.preflight(&ctx(&ledger, &payload, "nope")).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_PROVIDER");
    }
}
