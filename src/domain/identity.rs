//! Caller identity.
//!
//! The pair is supplied already verified by whatever sits in front of the
//! store (a gateway, a token verifier). Nothing here checks signatures.

use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, Result};

/// Verified `(tenant, actor)` pair attached to every store call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityContext {
    pub tenant_id: String,
    pub actor_id: String,
}

impl IdentityContext {
    pub fn new(tenant_id: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            actor_id: actor_id.into(),
        }
    }

    /// Reject empty identities before they reach the store
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(CheckpointError::validation(
                "TENANT_ID_EMPTY",
                "tenant id must not be empty",
            ));
        }
        if self.actor_id.trim().is_empty() {
            return Err(CheckpointError::validation(
                "ACTOR_ID_EMPTY",
                "actor id must not be empty",
            ));
        }
        Ok(())
    }
}
