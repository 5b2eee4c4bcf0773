//! Security event model shared by the audit pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Event severity. `Info` is routine, `Critical` pages someone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Kinds of security-relevant events emitted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    AccessGranted,
    AccessDenied,
    RoleAssigned,
    PermissionGranted,
    PermissionRevoked,
    SessionCreated,
    SessionTerminated,
    TokensRefreshed,
    RateLimitExceeded,
    AccountLockout,
    IpBlocked,
    SuspiciousActivity,
    MfaVerificationSucceeded,
    MfaVerificationFailed,
    MfaEnabled,
    MfaDisabled,
    BackupCodesRegenerated,
}

impl SecurityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventKind::AccessGranted => "access_granted",
            SecurityEventKind::AccessDenied => "access_denied",
            SecurityEventKind::RoleAssigned => "role_assigned",
            SecurityEventKind::PermissionGranted => "permission_granted",
            SecurityEventKind::PermissionRevoked => "permission_revoked",
            SecurityEventKind::SessionCreated => "session_created",
            SecurityEventKind::SessionTerminated => "session_terminated",
            SecurityEventKind::TokensRefreshed => "tokens_refreshed",
            SecurityEventKind::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventKind::AccountLockout => "account_lockout",
            SecurityEventKind::IpBlocked => "ip_blocked",
            SecurityEventKind::SuspiciousActivity => "suspicious_activity",
            SecurityEventKind::MfaVerificationSucceeded => "mfa_verification_succeeded",
            SecurityEventKind::MfaVerificationFailed => "mfa_verification_failed",
            SecurityEventKind::MfaEnabled => "mfa_enabled",
            SecurityEventKind::MfaDisabled => "mfa_disabled",
            SecurityEventKind::BackupCodesRegenerated => "backup_codes_regenerated",
        }
    }
}

/// Audit log entry handed to the audit sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub kind: SecurityEventKind,
    pub severity: Severity,
    /// User or identifier the event is about, when known.
    pub actor: Option<String>,
    pub action: String,
    pub resource: Option<String>,
    pub outcome: String,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, severity: Severity, action: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            actor: None,
            action: action.into(),
            resource: None,
            outcome: "success".to_string(),
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = outcome.into();
        self
    }

    pub fn meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}
