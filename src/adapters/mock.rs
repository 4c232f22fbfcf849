//! Echo provider for local runs and tests.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{Provider, ProviderClient, ProviderError};

/// Accepts any non-empty token and echoes the payload back
#[derive(Debug, Clone, Copy, Default)]
pub struct MockProvider;

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn authenticate(&self, token: &str) -> Result<Box<dyn ProviderClient>, ProviderError> {
        if token.is_empty() {
            return Err(ProviderError::Unauthorized {
                provider: self.name().to_string(),
                reason: "missing token".to_string(),
            });
        }
        Ok(Box::new(MockClient))
    }
}

struct MockClient;

#[async_trait]
impl ProviderClient for MockClient {
    async fn call(&self, _model: &str, payload: &Value) -> Result<Map<String, Value>, ProviderError> {
        let mut out = Map::new();
        out.insert("echo".to_string(), payload.clone());
        out.insert("provider".to_string(), json!("mock"));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo() {
        let client = MockProvider.authenticate("anything").await.unwrap();
        let out = client.call("gpt-demo", &json!({"k": 1})).await.unwrap();
        assert_eq!(out["echo"], json!({"k": 1}));
        assert_eq!(out["provider"], "mock");
    }

    #[tokio::test]
    async fn test_missing_token() {
        let err = MockProvider.authenticate("").await.err().unwrap();
        assert_eq!(err.to_string(), "mock: missing token");
    }
}
