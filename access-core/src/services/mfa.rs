//! MFA challenge coordinator.
//!
//! Issues and verifies short-lived, single-use verification challenges.
//! SMS and email challenges store only a hash of their one-time code; TOTP
//! and backup-code challenges validate against the user's enrollment.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use crate::config::MfaConfig;
use crate::models::{
    MfaChallenge, MfaEnrollment, MfaMethod, MfaSetup, MfaVerification, SecurityEvent,
    SecurityEventKind, Severity,
};

use super::audit::AuditService;
use super::directory::IdentityStore;
use super::error::CoreError;
use super::notify::{NotificationChannel, NotificationDispatcher};

/// Expired challenges are swept this often.
const CHALLENGE_SWEEP_SECS: u64 = 60;

const ALPHANUMERIC: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const HEX_UPPER: &[u8] = b"0123456789ABCDEF";

/// A user's current MFA posture.
#[derive(Debug, Clone)]
pub struct MfaStatus {
    pub enabled: bool,
    pub methods: Vec<MfaMethod>,
    pub backup_codes_remaining: usize,
}

struct MfaState {
    config: MfaConfig,
    identity: Arc<dyn IdentityStore>,
    audit: AuditService,
    notifier: Arc<dyn NotificationDispatcher>,
    challenges: DashMap<Uuid, MfaChallenge>,
}

pub struct MfaCoordinator {
    state: Arc<MfaState>,
    sweeper: JoinHandle<()>,
}

impl MfaCoordinator {
    /// Build the coordinator and start its expiry sweeper. Must be called
    /// within a tokio runtime.
    pub fn new(
        config: MfaConfig,
        identity: Arc<dyn IdentityStore>,
        audit: AuditService,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        let state = Arc::new(MfaState {
            config,
            identity,
            audit,
            notifier,
            challenges: DashMap::new(),
        });
        let sweeper = Self::spawn_challenge_sweeper(state.clone());
        Self { state, sweeper }
    }

    pub fn shutdown(&self) {
        self.sweeper.abort();
    }

    /// Issue a challenge for a user.
    ///
    /// Evicts the user's oldest challenge when at the concurrency cap.
    /// SMS/email codes are dispatched best-effort; a delivery failure does
    /// not fail issuance.
    pub async fn create_challenge(
        &self,
        user_id: &str,
        method: MfaMethod,
        metadata: Map<String, Value>,
    ) -> Result<Uuid, CoreError> {
        let state = &self.state;
        self.cleanup_user_challenges(user_id);

        let (code, code_hash, max_attempts) = match method {
            MfaMethod::Sms => {
                let code = generate_numeric_code(state.config.sms_code_length);
                let hash = hash_code(&code);
                (Some(code), Some(hash), state.config.sms_max_attempts)
            }
            MfaMethod::Email => {
                let code = generate_alphanumeric_code(state.config.email_code_length);
                let hash = hash_code(&code);
                (Some(code), Some(hash), state.config.email_max_attempts)
            }
            MfaMethod::Totp | MfaMethod::BackupCodes => (None, None, state.config.max_attempts),
        };

        let challenge = MfaChallenge {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            method,
            code_hash,
            attempts: 0,
            max_attempts,
            expires_at: Utc::now() + Duration::minutes(state.config.challenge_expiry_minutes),
            verified: false,
            metadata,
            created_at: Utc::now(),
        };
        let challenge_id = challenge.id;
        state.challenges.insert(challenge_id, challenge);

        if let Some(code) = code {
            self.dispatch_code(user_id, method, &code).await;
        }

        tracing::info!(
            challenge_id = %challenge_id,
            user_id = %user_id,
            method = method.as_str(),
            "MFA challenge created"
        );
        Ok(challenge_id)
    }

    /// Verify a challenge attempt.
    ///
    /// Every call spends an attempt. Success consumes the challenge; a
    /// consumed backup code is removed from the user's set. Soft failures
    /// (wrong code, missing/expired challenge) come back in the result;
    /// only dependency failures surface as errors.
    pub async fn verify_challenge(
        &self,
        challenge_id: Uuid,
        method: MfaMethod,
        token: &str,
    ) -> Result<MfaVerification, CoreError> {
        let state = &self.state;

        // Spend the attempt under the map guard, verify outside it.
        let challenge = {
            let mut entry = match state.challenges.get_mut(&challenge_id) {
                Some(entry) => entry,
                None => {
                    return Ok(MfaVerification::failure(
                        method,
                        0,
                        "Challenge not found or expired",
                    ))
                }
            };
            if entry.is_expired() {
                drop(entry);
                state.challenges.remove(&challenge_id);
                return Ok(MfaVerification::failure(method, 0, "Challenge has expired"));
            }
            if entry.is_exhausted() {
                return Ok(MfaVerification::failure(
                    entry.method,
                    0,
                    "Maximum attempts exceeded",
                ));
            }
            entry.attempts += 1;
            entry.clone()
        };

        let mut backup_code_used = None;
        let valid = match challenge.method {
            MfaMethod::Totp => {
                let enrollment = state.identity.mfa_enrollment(&challenge.user_id).await?;
                match enrollment.filter(|e| e.enabled).and_then(|e| e.totp_secret) {
                    Some(secret) => self.verify_totp_code(&secret, token),
                    None => false,
                }
            }
            MfaMethod::Sms | MfaMethod::Email => match &challenge.code_hash {
                Some(stored) => constant_time_eq(&hash_code(token), stored),
                None => false,
            },
            MfaMethod::BackupCodes => {
                let enrollment = state.identity.mfa_enrollment(&challenge.user_id).await?;
                let candidate = format_backup_code(&token.to_uppercase());
                match enrollment.filter(|e| e.enabled) {
                    Some(enrollment) => {
                        let matched = enrollment.backup_codes.iter().any(|c| *c == candidate);
                        if matched {
                            backup_code_used = Some(candidate);
                        }
                        matched
                    }
                    None => false,
                }
            }
        };

        let remaining_attempts = challenge.remaining_attempts();

        if valid {
            state.challenges.remove(&challenge_id);

            if let Some(code) = &backup_code_used {
                if let Err(e) = state
                    .identity
                    .remove_backup_code(&challenge.user_id, code)
                    .await
                {
                    tracing::error!(
                        error = %e,
                        user_id = %challenge.user_id,
                        "Failed to remove consumed backup code"
                    );
                }
            }

            state.audit.report(
                SecurityEvent::new(
                    SecurityEventKind::MfaVerificationSucceeded,
                    Severity::Medium,
                    "mfa_verification",
                )
                .actor(&challenge.user_id)
                .meta("method", json!(challenge.method.as_str()))
                .meta("challenge_id", json!(challenge_id.to_string())),
            );

            Ok(MfaVerification {
                success: true,
                method: challenge.method,
                remaining_attempts,
                backup_code_used,
                error: None,
            })
        } else {
            state.audit.report(
                SecurityEvent::new(
                    SecurityEventKind::MfaVerificationFailed,
                    Severity::Medium,
                    "mfa_verification",
                )
                .actor(&challenge.user_id)
                .outcome("failure")
                .meta("method", json!(challenge.method.as_str()))
                .meta("challenge_id", json!(challenge_id.to_string()))
                .meta("attempts", json!(challenge.attempts)),
            );

            Ok(MfaVerification::failure(
                challenge.method,
                remaining_attempts,
                "Invalid verification code",
            ))
        }
    }

    /// Generate enrollment material for a user: a fresh TOTP secret, its
    /// provisioning URI, and a set of backup codes. Nothing is persisted
    /// until [`enable_mfa`](Self::enable_mfa) verifies the first code.
    pub async fn generate_setup(&self, user_id: &str) -> Result<MfaSetup, CoreError> {
        let state = &self.state;
        let user = state
            .identity
            .get_user(user_id)
            .await?
            .ok_or(CoreError::UserNotFound)?;

        let secret = Secret::generate_secret();
        let encoded = secret.to_encoded().to_string();
        let secret_bytes = secret
            .to_bytes()
            .map_err(|e| anyhow::anyhow!("TOTP secret generation failed: {:?}", e))?;

        let totp = TOTP::new(
            Algorithm::SHA1,
            state.config.totp_digits,
            state.config.totp_skew,
            state.config.totp_period,
            secret_bytes,
            Some(state.config.issuer.clone()),
            user.email.clone(),
        )
        .map_err(|e| anyhow::anyhow!("TOTP init failed: {}", e))?;

        let backup_codes = self.generate_backup_codes();

        let mut methods = vec![MfaMethod::Totp, MfaMethod::BackupCodes];
        if user.phone_number.is_some() {
            methods.push(MfaMethod::Sms);
        }
        methods.push(MfaMethod::Email);

        Ok(MfaSetup {
            provisioning_uri: totp.get_url(),
            manual_entry_key: format_manual_entry(&encoded),
            totp_secret: encoded,
            backup_codes,
            methods,
        })
    }

    /// Enroll a user after they prove possession of the TOTP secret.
    /// Returns false when the verification code does not match.
    pub async fn enable_mfa(
        &self,
        user_id: &str,
        totp_secret: &str,
        verification_code: &str,
        backup_codes: Vec<String>,
        phone_number: Option<String>,
    ) -> Result<bool, CoreError> {
        let state = &self.state;

        if !self.verify_totp_code(totp_secret, verification_code) {
            return Ok(false);
        }

        let user = state
            .identity
            .get_user(user_id)
            .await?
            .ok_or(CoreError::UserNotFound)?;

        let enrollment = MfaEnrollment {
            enabled: true,
            totp_secret: Some(totp_secret.to_string()),
            backup_codes,
            phone_number,
            email: Some(user.email),
        };
        state
            .identity
            .store_mfa_enrollment(user_id, enrollment)
            .await?;

        state.audit.report(
            SecurityEvent::new(SecurityEventKind::MfaEnabled, Severity::Medium, "mfa_enabled")
                .actor(user_id),
        );
        tracing::info!(user_id = %user_id, "MFA enabled");
        Ok(true)
    }

    /// Disable MFA after verifying a current TOTP code.
    pub async fn disable_mfa(
        &self,
        user_id: &str,
        verification_code: &str,
    ) -> Result<bool, CoreError> {
        let state = &self.state;
        let enrollment = state.identity.mfa_enrollment(user_id).await?;
        let secret = match enrollment.filter(|e| e.enabled).and_then(|e| e.totp_secret) {
            Some(secret) => secret,
            None => return Err(CoreError::MfaNotEnrolled),
        };

        if !self.verify_totp_code(&secret, verification_code) {
            return Ok(false);
        }

        state.identity.clear_mfa_enrollment(user_id).await?;

        state.audit.report(
            SecurityEvent::new(
                SecurityEventKind::MfaDisabled,
                Severity::Medium,
                "mfa_disabled",
            )
            .actor(user_id),
        );
        tracing::info!(user_id = %user_id, "MFA disabled");
        Ok(true)
    }

    /// Replace the user's backup codes after verifying a current TOTP code.
    pub async fn regenerate_backup_codes(
        &self,
        user_id: &str,
        verification_code: &str,
    ) -> Result<Option<Vec<String>>, CoreError> {
        let state = &self.state;
        let mut enrollment = state
            .identity
            .mfa_enrollment(user_id)
            .await?
            .filter(|e| e.enabled)
            .ok_or(CoreError::MfaNotEnrolled)?;
        let secret = enrollment
            .totp_secret
            .clone()
            .ok_or(CoreError::MfaNotEnrolled)?;

        if !self.verify_totp_code(&secret, verification_code) {
            return Ok(None);
        }

        let codes = self.generate_backup_codes();
        enrollment.backup_codes = codes.clone();
        state
            .identity
            .store_mfa_enrollment(user_id, enrollment)
            .await?;

        state.audit.report(
            SecurityEvent::new(
                SecurityEventKind::BackupCodesRegenerated,
                Severity::Medium,
                "backup_codes_regenerated",
            )
            .actor(user_id)
            .meta("codes_count", json!(codes.len())),
        );
        Ok(Some(codes))
    }

    /// Current MFA posture for a user.
    pub async fn mfa_status(&self, user_id: &str) -> Result<MfaStatus, CoreError> {
        let user = self
            .state
            .identity
            .get_user(user_id)
            .await?
            .ok_or(CoreError::UserNotFound)?;

        let enrollment = user.mfa.filter(|e| e.enabled);
        match enrollment {
            Some(enrollment) => {
                let mut methods = vec![MfaMethod::Totp];
                if !enrollment.backup_codes.is_empty() {
                    methods.push(MfaMethod::BackupCodes);
                }
                if enrollment.phone_number.is_some() {
                    methods.push(MfaMethod::Sms);
                }
                methods.push(MfaMethod::Email);
                Ok(MfaStatus {
                    enabled: true,
                    backup_codes_remaining: enrollment.backup_codes.len(),
                    methods,
                })
            }
            None => Ok(MfaStatus {
                enabled: false,
                methods: Vec::new(),
                backup_codes_remaining: 0,
            }),
        }
    }

    /// How many live challenges a user has (visible for tests).
    pub fn pending_challenges(&self, user_id: &str) -> usize {
        self.state
            .challenges
            .iter()
            .filter(|c| c.user_id == user_id && !c.is_expired())
            .count()
    }

    fn verify_totp_code(&self, secret: &str, code: &str) -> bool {
        let config = &self.state.config;
        let secret_bytes = match Secret::Encoded(secret.to_string()).to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = ?e, "Unreadable TOTP secret");
                return false;
            }
        };

        let totp = match TOTP::new(
            Algorithm::SHA1,
            config.totp_digits,
            config.totp_skew,
            config.totp_period,
            secret_bytes,
            None,
            String::new(),
        ) {
            Ok(totp) => totp,
            Err(e) => {
                tracing::warn!(error = %e, "TOTP construction failed");
                return false;
            }
        };

        totp.check_current(code).unwrap_or(false)
    }

    /// Drop the user's spent/expired challenges; if still at the cap, evict
    /// the oldest.
    fn cleanup_user_challenges(&self, user_id: &str) {
        let state = &self.state;
        state
            .challenges
            .retain(|_, c| !(c.user_id == user_id && (c.is_expired() || c.verified)));

        let mut remaining: Vec<(Uuid, chrono::DateTime<Utc>)> = state
            .challenges
            .iter()
            .filter(|c| c.user_id == user_id)
            .map(|c| (c.id, c.created_at))
            .collect();

        if remaining.len() >= state.config.max_concurrent_challenges {
            remaining.sort_by_key(|(_, created_at)| *created_at);
            if let Some((oldest, _)) = remaining.first() {
                state.challenges.remove(oldest);
            }
        }
    }

    async fn dispatch_code(&self, user_id: &str, method: MfaMethod, code: &str) {
        let state = &self.state;
        let user = match state.identity.get_user(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::warn!(user_id = %user_id, "No user to dispatch MFA code to");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, user_id = %user_id, "User lookup for MFA dispatch failed");
                return;
            }
        };

        let issuer = &state.config.issuer;
        let result = match method {
            MfaMethod::Sms => match &user.phone_number {
                Some(phone) => {
                    let message = format!(
                        "Your {} verification code is: {}. Valid for {} minutes.",
                        issuer, code, state.config.challenge_expiry_minutes
                    );
                    state
                        .notifier
                        .send(NotificationChannel::Sms, phone, &message)
                        .await
                }
                None => {
                    tracing::warn!(user_id = %user_id, "SMS challenge for user without phone number");
                    return;
                }
            },
            MfaMethod::Email => {
                let message = format!(
                    "Your {} verification code is: {}. Valid for {} minutes. \
                     If you didn't request this code, please ignore this message.",
                    issuer, code, state.config.challenge_expiry_minutes
                );
                state
                    .notifier
                    .send(NotificationChannel::Email, &user.email, &message)
                    .await
            }
            _ => return,
        };

        if let Err(e) = result {
            tracing::error!(
                error = %e,
                user_id = %user_id,
                method = method.as_str(),
                "Failed to dispatch MFA code"
            );
        }
    }

    fn generate_backup_codes(&self) -> Vec<String> {
        let config = &self.state.config;
        (0..config.backup_code_count)
            .map(|_| {
                let mut rng = rand::thread_rng();
                let raw: String = (0..config.backup_code_length)
                    .map(|_| HEX_UPPER[rng.gen_range(0..HEX_UPPER.len())] as char)
                    .collect();
                format_backup_code(&raw)
            })
            .collect()
    }

    fn spawn_challenge_sweeper(state: Arc<MfaState>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(CHALLENGE_SWEEP_SECS));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                state.challenges.retain(|_, c| !c.is_expired());
            }
        })
    }
}

impl Drop for MfaCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn generate_numeric_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

fn generate_alphanumeric_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| ALPHANUMERIC[rng.gen_range(0..ALPHANUMERIC.len())] as char)
        .collect()
}

fn hash_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// "ABCD1234" -> "ABCD-1234". Codes shorter than 4 pass through.
fn format_backup_code(code: &str) -> String {
    if code.len() >= 4 && !code.contains('-') {
        format!("{}-{}", &code[..4], &code[4..])
    } else {
        code.to_string()
    }
}

fn format_manual_entry(secret: &str) -> String {
    secret
        .as_bytes()
        .chunks(4)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(" ")
}
