//! Session lifecycle manager.
//!
//! Creates, validates, refreshes, and terminates authenticated sessions,
//! with device fingerprinting, risk scoring, and a concurrency cap. The hot
//! path works against an in-process cache; the durable store is written
//! through and used as the cache-miss fallback.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::models::{
    CreateSessionOptions, DeviceInput, SecurityEvent, SecurityEventKind, Session, SessionFlag,
    SessionFlagKind, Severity,
};
use crate::utils::device;

use super::audit::AuditService;
use super::directory::IdentityStore;
use super::error::CoreError;
use super::notify::{GeoResolver, NotificationChannel, NotificationDispatcher};
use super::session_store::SessionStore;
use super::tokens::{CredentialService, IssuedCredentials};

/// Cache sweep cadence.
const CACHE_SWEEP_SECS: u64 = 60;
/// Activity-log prune cadence and retention.
const ACTIVITY_PRUNE_SECS: u64 = 60 * 60;
const ACTIVITY_RETENTION_HOURS: i64 = 24;

/// Why a session ended. Terminal either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Expired,
    Logout,
    ConcurrentLimit,
    SuspiciousActivity,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Expired => "expired",
            TerminationReason::Logout => "logout",
            TerminationReason::ConcurrentLimit => "concurrent_limit",
            TerminationReason::SuspiciousActivity => "suspicious_activity",
        }
    }

    fn severity(&self) -> Severity {
        match self {
            TerminationReason::SuspiciousActivity => Severity::High,
            _ => Severity::Info,
        }
    }
}

/// Result of validating an access credential.
#[derive(Debug, Clone)]
pub struct SessionValidation {
    pub session: Session,
    /// The credential is within its refresh-advice window; the caller
    /// should mint a new pair soon.
    pub refresh_advised: bool,
}

struct SessionState {
    config: SessionConfig,
    credentials: CredentialService,
    store: Arc<dyn SessionStore>,
    identity: Arc<dyn IdentityStore>,
    audit: AuditService,
    notifier: Arc<dyn NotificationDispatcher>,
    geo: Arc<dyn GeoResolver>,
    cache: DashMap<Uuid, Session>,
    /// Fingerprint trust cache: fingerprint -> last seen.
    known_devices: DashMap<String, DateTime<Utc>>,
    /// Validation timestamps per session, for the rapid-activity heuristic.
    activity: DashMap<Uuid, Vec<DateTime<Utc>>>,
}

pub struct SessionManager {
    state: Arc<SessionState>,
    sweepers: Vec<JoinHandle<()>>,
}

impl SessionManager {
    /// Build the manager and start its background sweepers. Must be called
    /// within a tokio runtime.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SessionConfig,
        credentials: CredentialService,
        store: Arc<dyn SessionStore>,
        identity: Arc<dyn IdentityStore>,
        audit: AuditService,
        notifier: Arc<dyn NotificationDispatcher>,
        geo: Arc<dyn GeoResolver>,
    ) -> Self {
        let state = Arc::new(SessionState {
            config,
            credentials,
            store,
            identity,
            audit,
            notifier,
            geo,
            cache: DashMap::new(),
            known_devices: DashMap::new(),
            activity: DashMap::new(),
        });

        let sweepers = vec![
            Self::spawn_cache_sweeper(state.clone()),
            Self::spawn_activity_pruner(state.clone()),
        ];

        Self { state, sweepers }
    }

    /// Stop the background sweepers. Requests in flight are unaffected.
    pub fn shutdown(&self) {
        for task in &self.sweepers {
            task.abort();
        }
    }

    /// Create a new session for a user.
    ///
    /// Enforces the concurrent-session cap by evicting the least recently
    /// active session, scores the new session's risk, and issues an
    /// access/refresh credential pair. A persistence failure fails the
    /// whole call.
    pub async fn create_session(
        &self,
        user_id: &str,
        device_input: DeviceInput,
        options: CreateSessionOptions,
    ) -> Result<(Session, IssuedCredentials), CoreError> {
        let state = &self.state;
        let now = Utc::now();
        let profile = device::build_profile(&device_input);

        let active = state.store.find_active_sessions_by_user(user_id).await?;
        let at_capacity = active.len() >= state.config.max_concurrent_sessions;
        if at_capacity {
            // Least recently active is last in the store's ordering.
            if let Some(oldest) = active.last() {
                self.terminate_session(oldest.id, TerminationReason::ConcurrentLimit)
                    .await?;
            }
        }

        let mut risk_score: u32 = 0;
        let mut flags = Vec::new();

        let known_device = state.known_devices.contains_key(&profile.fingerprint);
        if !known_device && !options.bypass_device_check {
            risk_score += 30;
            flags.push(SessionFlag::new(
                SessionFlagKind::NewDevice,
                Severity::Medium,
                "Login from unrecognized device",
            ));
        }

        if !device::is_private_ip(&profile.ip_address) {
            risk_score += 10;
        }

        if at_capacity {
            risk_score += 20;
            flags.push(SessionFlag::new(
                SessionFlagKind::ConcurrentSession,
                Severity::Medium,
                format!("User has {} concurrent sessions", active.len()),
            ));
        }

        // Location anomaly carries no weight yet: there is no per-user geo
        // history to compare against.
        let _ = options.geo_location;

        let risk_score = risk_score.min(100) as u8;

        let expires_at = if options.remember_me {
            now + Duration::days(state.config.refresh_timeout_days)
        } else {
            now + Duration::hours(state.config.session_timeout_hours)
        };

        let location = if state.config.enable_location_tracking {
            match state.geo.resolve(&profile.ip_address).await {
                Ok(location) => location,
                Err(e) => {
                    tracing::debug!(error = %e, ip = %profile.ip_address, "Geo lookup failed");
                    None
                }
            }
        } else {
            None
        };

        let session_id = Uuid::new_v4();
        let access_token = state.credentials.issue_access_token(user_id, session_id)?;
        let (refresh_token, refresh_hash) = state.credentials.mint_refresh_token();

        let session = Session {
            id: session_id,
            user_id: user_id.to_string(),
            device: profile,
            created_at: now,
            last_activity: now,
            expires_at,
            is_active: true,
            risk_score,
            flags,
            location,
            refresh_hash,
        };

        // Creation must be durable; a store failure fails the call.
        state.store.insert_session(&session).await?;

        state.cache.insert(session_id, session.clone());
        if state.config.enable_device_fingerprinting {
            state
                .known_devices
                .insert(session.device.fingerprint.clone(), now);
        }

        let severity = if risk_score > state.config.high_risk_audit_threshold {
            Severity::High
        } else {
            Severity::Info
        };
        state.audit.report(
            SecurityEvent::new(SecurityEventKind::SessionCreated, severity, "session_created")
                .actor(user_id)
                .meta("session_id", json!(session_id.to_string()))
                .meta("device_fingerprint", json!(session.device.fingerprint))
                .meta("risk_score", json!(risk_score))
                .meta(
                    "flags",
                    json!(session
                        .flags
                        .iter()
                        .map(|f| f.kind.as_str())
                        .collect::<Vec<_>>()),
                )
                .meta("remember_me", json!(options.remember_me)),
        );

        if risk_score > state.config.alert_threshold {
            self.dispatch_high_risk_alert(&session);
        }

        tracing::info!(
            session_id = %session_id,
            user_id = %user_id,
            risk_score = risk_score,
            "Session created"
        );

        let credentials = IssuedCredentials {
            access_token,
            refresh_token,
            expires_in: state.credentials.access_token_expiry_seconds(),
        };
        Ok((session, credentials))
    }

    /// Validate an access credential and return its session.
    ///
    /// Expired and inactive sessions are rejected; a session validating
    /// faster than the suspicious-activity threshold is flagged and killed
    /// as a side effect. Background persistence failures never fail a
    /// validation that already passed.
    pub async fn validate_session(&self, token: &str) -> Result<SessionValidation, CoreError> {
        let state = &self.state;
        let claims = state
            .credentials
            .decode_access_token(token)
            .map_err(|_| CoreError::InvalidCredential)?;
        let session_id =
            Uuid::parse_str(&claims.sid).map_err(|_| CoreError::InvalidCredential)?;

        let mut session = match state.cache.get(&session_id) {
            Some(cached) => cached.clone(),
            None => match state.store.find_session(session_id).await? {
                Some(stored) => {
                    state.cache.insert(session_id, stored.clone());
                    stored
                }
                None => return Err(CoreError::SessionNotFound),
            },
        };

        if session.is_expired() {
            self.terminate_session(session_id, TerminationReason::Expired)
                .await?;
            return Err(CoreError::SessionExpired);
        }
        if !session.is_active {
            return Err(CoreError::SessionInactive);
        }

        if self.record_activity(session_id) > state.config.suspicious_activity_per_minute {
            session.add_flag(SessionFlag::new(
                SessionFlagKind::UnusualActivity,
                Severity::High,
                "Unusually high activity rate",
            ));
            if let Err(e) = state.store.update_session_activity(&session).await {
                tracing::warn!(error = %e, session_id = %session_id, "Failed to persist session flag");
            }
            self.terminate_session(session_id, TerminationReason::SuspiciousActivity)
                .await?;
            return Err(CoreError::SessionTerminated(
                TerminationReason::SuspiciousActivity.as_str().to_string(),
            ));
        }

        session.touch();
        state.cache.insert(session_id, session.clone());
        if let Err(e) = state.store.update_session_activity(&session).await {
            // Background bump only; the validation stands.
            tracing::warn!(error = %e, session_id = %session_id, "Failed to persist session activity");
        }

        Ok(SessionValidation {
            refresh_advised: state.credentials.refresh_advised(&claims),
            session,
        })
    }

    /// Rotate a session's credential pair using its refresh credential.
    ///
    /// The old refresh credential becomes permanently unfindable even if it
    /// was never used.
    pub async fn refresh_session(
        &self,
        refresh_token: &str,
    ) -> Result<(Session, IssuedCredentials), CoreError> {
        let state = &self.state;
        let hash = CredentialService::hash_refresh_token(refresh_token);

        let mut session = state
            .store
            .find_session_by_refresh_hash(&hash)
            .await?
            .ok_or(CoreError::InvalidCredential)?;

        if session.is_expired() || !session.is_active {
            return Err(CoreError::InvalidCredential);
        }

        let access_token = state
            .credentials
            .issue_access_token(&session.user_id, session.id)?;
        let (refresh_token, refresh_hash) = state.credentials.mint_refresh_token();

        // Rotation is the durable part; if it fails the old pair stays valid.
        state
            .store
            .update_refresh_hash(session.id, &refresh_hash)
            .await?;

        session.refresh_hash = refresh_hash;
        session.touch();
        state.cache.insert(session.id, session.clone());
        if let Err(e) = state.store.update_session_activity(&session).await {
            tracing::warn!(error = %e, session_id = %session.id, "Failed to persist session activity");
        }

        state.audit.report(
            SecurityEvent::new(
                SecurityEventKind::TokensRefreshed,
                Severity::Info,
                "tokens_refreshed",
            )
            .actor(&session.user_id)
            .meta("session_id", json!(session.id.to_string()))
            .meta("device_fingerprint", json!(session.device.fingerprint)),
        );

        tracing::info!(session_id = %session.id, "Session refreshed");

        let credentials = IssuedCredentials {
            access_token,
            refresh_token,
            expires_in: state.credentials.access_token_expiry_seconds(),
        };
        Ok((session, credentials))
    }

    /// Terminate a session. Idempotent: terminating an already-inactive or
    /// unknown session succeeds quietly.
    pub async fn terminate_session(
        &self,
        session_id: Uuid,
        reason: TerminationReason,
    ) -> Result<(), CoreError> {
        let state = &self.state;
        state.store.mark_inactive(session_id).await?;

        let session = state.cache.remove(&session_id).map(|(_, s)| s);
        state.activity.remove(&session_id);

        let mut event = SecurityEvent::new(
            SecurityEventKind::SessionTerminated,
            reason.severity(),
            "session_terminated",
        )
        .meta("session_id", json!(session_id.to_string()))
        .meta("reason", json!(reason.as_str()));

        if let Some(session) = &session {
            event = event
                .actor(&session.user_id)
                .meta("device_fingerprint", json!(session.device.fingerprint))
                .meta(
                    "session_duration_secs",
                    json!((Utc::now() - session.created_at).num_seconds()),
                );
        }
        state.audit.report(event);

        tracing::info!(session_id = %session_id, reason = reason.as_str(), "Session terminated");
        Ok(())
    }

    /// Active sessions for a user, most recently active first.
    pub async fn user_sessions(&self, user_id: &str) -> Result<Vec<Session>, CoreError> {
        Ok(self.state.store.find_active_sessions_by_user(user_id).await?)
    }

    /// Terminate every active session for a user except `keep`. Returns the
    /// number terminated.
    pub async fn terminate_other_sessions(
        &self,
        user_id: &str,
        keep: Uuid,
    ) -> Result<usize, CoreError> {
        let sessions = self.user_sessions(user_id).await?;
        let mut terminated = 0;
        for session in sessions {
            if session.id != keep {
                self.terminate_session(session.id, TerminationReason::Logout)
                    .await?;
                terminated += 1;
            }
        }

        if terminated > 0 {
            self.state.audit.report(
                SecurityEvent::new(
                    SecurityEventKind::SessionTerminated,
                    Severity::Medium,
                    "multiple_sessions_terminated",
                )
                .actor(user_id)
                .meta("terminated_count", json!(terminated))
                .meta("kept_session_id", json!(keep.to_string())),
            );
        }

        Ok(terminated)
    }

    /// Record a validation and return how many landed in the last minute.
    fn record_activity(&self, session_id: Uuid) -> usize {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(60);
        let mut entry = self.state.activity.entry(session_id).or_default();
        entry.retain(|t| *t > cutoff);
        entry.push(now);
        entry.len()
    }

    /// High-risk sessions alert the user out of band. Never blocks creation.
    fn dispatch_high_risk_alert(&self, session: &Session) {
        let state = self.state.clone();
        let user_id = session.user_id.clone();
        let risk_score = session.risk_score;
        let device = session.device.device.clone();

        tokio::spawn(async move {
            let target = match state.identity.get_user(&user_id).await {
                Ok(Some(user)) => user.email,
                _ => {
                    tracing::warn!(user_id = %user_id, "No alert target for high-risk session");
                    return;
                }
            };

            let payload = format!(
                "A new sign-in to your account from a {} device was scored {} / 100. \
                 If this was not you, terminate your sessions now.",
                device, risk_score
            );
            if let Err(e) = state
                .notifier
                .send(NotificationChannel::Email, &target, &payload)
                .await
            {
                tracing::error!(error = %e, user_id = %user_id, "Failed to send high-risk alert");
            }
        });
    }

    fn spawn_cache_sweeper(state: Arc<SessionState>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(CACHE_SWEEP_SECS));
            ticker.tick().await;
            loop {
                ticker.tick().await;

                // Collect first: no store I/O under a shard lock.
                let expired: Vec<Uuid> = state
                    .cache
                    .iter()
                    .filter(|entry| entry.value().is_expired())
                    .map(|entry| *entry.key())
                    .collect();

                for session_id in expired {
                    state.cache.remove(&session_id);
                    if let Err(e) = state.store.mark_inactive(session_id).await {
                        tracing::warn!(error = %e, session_id = %session_id, "Sweep failed to mark session inactive");
                    }
                }
            }
        })
    }

    fn spawn_activity_pruner(state: Arc<SessionState>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(ACTIVITY_PRUNE_SECS));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cutoff = Utc::now() - Duration::hours(ACTIVITY_RETENTION_HOURS);
                state.activity.retain(|_, timestamps| {
                    timestamps.retain(|t| *t > cutoff);
                    !timestamps.is_empty()
                });
            }
        })
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
