//! MFA challenge model - short-lived, single-use verification challenges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Supported verification methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MfaMethod {
    Totp,
    Sms,
    Email,
    BackupCodes,
}

impl MfaMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MfaMethod::Totp => "totp",
            MfaMethod::Sms => "sms",
            MfaMethod::Email => "email",
            MfaMethod::BackupCodes => "backup_codes",
        }
    }
}

/// MFA challenge entity.
///
/// SMS/email challenges store only the sha256 of the one-time code; TOTP and
/// backup-code challenges carry no per-challenge secret and are validated
/// against the user's enrollment instead.
#[derive(Debug, Clone)]
pub struct MfaChallenge {
    pub id: Uuid,
    pub user_id: String,
    pub method: MfaMethod,
    pub code_hash: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub expires_at: DateTime<Utc>,
    pub verified: bool,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl MfaChallenge {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// A user's MFA enrollment, persisted by the identity store.
///
/// The TOTP secret and backup codes are opaque to this core; at-rest
/// protection is the identity store's concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MfaEnrollment {
    pub enabled: bool,
    pub totp_secret: Option<String>,
    pub backup_codes: Vec<String>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
}

/// Material produced when a user begins MFA enrollment.
#[derive(Debug, Clone)]
pub struct MfaSetup {
    pub totp_secret: String,
    pub provisioning_uri: String,
    pub manual_entry_key: String,
    pub backup_codes: Vec<String>,
    pub methods: Vec<MfaMethod>,
}

/// Outcome of one verification attempt.
#[derive(Debug, Clone)]
pub struct MfaVerification {
    pub success: bool,
    pub method: MfaMethod,
    pub remaining_attempts: u32,
    pub backup_code_used: Option<String>,
    pub error: Option<String>,
}

impl MfaVerification {
    pub fn failure(method: MfaMethod, remaining_attempts: u32, error: impl Into<String>) -> Self {
        Self {
            success: false,
            method,
            remaining_attempts,
            backup_code_used: None,
            error: Some(error.into()),
        }
    }
}
