//! Adapter interfaces for external systems.
//!
//! Providers are the services a run sends work to. Each one authenticates a
//! token and hands back a client; the registry holding them is built once and
//! passed to the orchestrator explicitly.

pub mod executor;
pub mod kilo;
pub mod mock;
pub mod routing;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::ErrorClass;

pub use executor::{ProviderExecutor, StepContext, StepExecutor};
pub use kilo::KiloProvider;
pub use mock::MockProvider;

/// Failures reported by providers and step executors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("{provider}: {reason}")]
    Unauthorized { provider: String, reason: String },

    #[error("{provider} call failed: {message}")]
    CallFailed { provider: String, message: String },

    #[error("no handler for step '{0}'")]
    UnknownStep(String),
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::CallFailed { .. } => ErrorClass::Transient,
            _ => ErrorClass::Validation,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownProvider(_) => "UNKNOWN_PROVIDER",
            Self::Unauthorized { .. } => "PROVIDER_AUTH_FAILED",
            Self::CallFailed { .. } => "PROVIDER_CALL_FAILED",
            Self::UnknownStep(_) => "UNKNOWN_STEP",
        }
    }
}

/// An authenticated session with a provider
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Send the run payload; the result is always a JSON object
    async fn call(&self, model: &str, payload: &Value) -> Result<Map<String, Value>, ProviderError>;
}

/// A provider plugin
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name used on the command line (`--provider <name>`)
    fn name(&self) -> &str;

    /// Exchange a token for a ready client
    async fn authenticate(&self, token: &str) -> Result<Box<dyn ProviderClient>, ProviderError>;
}

/// Named providers available to a process
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.providers.keys()).finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `mock` and `kilo` providers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(MockProvider);
        registry.register(KiloProvider);
        registry
    }

    /// Add a provider, replacing any existing one with the same name
    pub fn register(&mut self, provider: impl Provider + 'static) -> &mut Self {
        self.providers
            .insert(provider.name().to_string(), Arc::new(provider));
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["kilo", "mock"]);
        assert!(registry.get("mock").is_ok());
    }

    #[test]
    fn test_unknown_provider() {
        let registry = ProviderRegistry::with_defaults();
        let err = registry.get("flux-etl").err().unwrap();
        assert_eq!(err.code(), "UNKNOWN_PROVIDER");
        assert_eq!(err.class(), ErrorClass::Validation);
        assert_eq!(err.to_string(), "unknown provider: flux-etl");
    }
}
