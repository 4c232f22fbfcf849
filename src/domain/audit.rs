//! Audit log entries and queries.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::identity::IdentityContext;

/// Kind of mutating operation recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    /// First save of a run
    Create,

    /// Save against an existing row
    Checkpoint,

    /// Load for resume
    Resume,

    Complete,
    Fail,

    /// Expiry sweep; one entry per sweep
    Cleanup,

    /// A caller asked for a row owned by another tenant
    CrossTenantAccess,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Checkpoint => "CHECKPOINT",
            Self::Resume => "RESUME",
            Self::Complete => "COMPLETE",
            Self::Fail => "FAIL",
            Self::Cleanup => "CLEANUP",
            Self::CrossTenantAccess => "CROSS_TENANT_ACCESS",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Ok(Self::Create),
            "CHECKPOINT" => Ok(Self::Checkpoint),
            "RESUME" => Ok(Self::Resume),
            "COMPLETE" => Ok(Self::Complete),
            "FAIL" => Ok(Self::Fail),
            "CLEANUP" => Ok(Self::Cleanup),
            "CROSS_TENANT_ACCESS" => Ok(Self::CrossTenantAccess),
            other => Err(format!("unknown audit action '{}'", other)),
        }
    }
}

/// One immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Insertion sequence, assigned by the store
    #[serde(default)]
    pub seq: i64,

    pub timestamp: DateTime<Utc>,

    /// Who performed the operation
    pub actor: String,

    /// Owning tenant; `None` for system-wide operations such as cleanup
    pub tenant_id: Option<String>,

    pub action: AuditAction,

    /// Run id (or aggregate label for cleanup)
    pub resource_id: String,

    pub success: bool,
    pub error_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_state: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_state: Option<Value>,
}

impl AuditEntry {
    /// A successful entry attributed to the caller
    pub fn new(
        ctx: &IdentityContext,
        action: AuditAction,
        resource_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            seq: 0,
            timestamp,
            actor: ctx.actor_id.clone(),
            tenant_id: Some(ctx.tenant_id.clone()),
            action,
            resource_id: resource_id.into(),
            success: true,
            error_code: None,
            before_state: None,
            after_state: None,
        }
    }

    /// An entry recorded by the system itself
    pub fn system(
        action: AuditAction,
        resource_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            seq: 0,
            timestamp,
            actor: SYSTEM_ACTOR.to_string(),
            tenant_id: None,
            action,
            resource_id: resource_id.into(),
            success: true,
            error_code: None,
            before_state: None,
            after_state: None,
        }
    }

    /// Mark the entry as a rejected attempt
    pub fn failed(mut self, error_code: impl Into<String>) -> Self {
        self.success = false;
        self.error_code = Some(error_code.into());
        self
    }

    pub fn with_states(mut self, before: Option<Value>, after: Option<Value>) -> Self {
        self.before_state = before;
        self.after_state = after;
        self
    }
}

/// Actor name used for entries written by the store itself
pub const SYSTEM_ACTOR: &str = "system";

/// Read-only filter over the audit log; every field is optional
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditQuery {
    pub tenant_id: Option<String>,
    pub actor: Option<String>,
    pub action: Option<AuditAction>,

    /// Inclusive lower bound
    pub since: Option<DateTime<Utc>>,

    /// Exclusive upper bound
    pub until: Option<DateTime<Utc>>,

    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Default::default()
        }
    }

    pub fn with_action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }
}
