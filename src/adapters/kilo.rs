//! Kilo AI provider (demo credentials only).

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{Provider, ProviderClient, ProviderError};

/// The only token the demo service accepts
pub const KILO_DEMO_TOKEN: &str = "kilo-demo-token";

#[derive(Debug, Clone, Copy, Default)]
pub struct KiloProvider;

#[async_trait]
impl Provider for KiloProvider {
    fn name(&self) -> &str {
        "kilo"
    }

    async fn authenticate(&self, token: &str) -> Result<Box<dyn ProviderClient>, ProviderError> {
        if token != KILO_DEMO_TOKEN {
            return Err(ProviderError::Unauthorized {
                provider: self.name().to_string(),
                reason: "invalid token".to_string(),
            });
        }
        Ok(Box::new(KiloClient))
    }
}

struct KiloClient;

#[async_trait]
impl ProviderClient for KiloClient {
    async fn call(&self, _model: &str, payload: &Value) -> Result<Map<String, Value>, ProviderError> {
        let mut out = Map::new();
        out.insert("processed".to_string(), json!(true));
        out.insert("service".to_string(), json!("kilo"));
        out.insert("payload".to_string(), payload.clone());
        Ok(out)
    }
}
