use access_core::config::CoreConfig;
use access_core::models::{CreateSessionOptions, DeviceInput, Role, Session, SessionFlagKind};
use access_core::services::{
    CoreError, CredentialService, MemoryAuditSink, MemoryDirectory, MemoryDispatcher,
    MemorySessionStore, SessionStore, StaticGeoResolver, TerminationReason, UserRecord,
};
use access_core::{Collaborators, SecurityCore};
use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

struct Harness {
    core: SecurityCore,
    store: Arc<MemorySessionStore>,
}

fn setup() -> Harness {
    let directory = Arc::new(MemoryDirectory::new());
    directory.insert_user(UserRecord::new("player-1", "player@example.com", Role::Player));

    let store = Arc::new(MemorySessionStore::new());
    let core = SecurityCore::new(
        CoreConfig::default(),
        Collaborators {
            identity: directory.clone(),
            permissions: directory,
            sessions: store.clone(),
            audit: Arc::new(MemoryAuditSink::new()),
            notifier: Arc::new(MemoryDispatcher::new()),
            geo: Arc::new(StaticGeoResolver::new(None)),
        },
    );

    Harness { core, store }
}

fn device(ip: &str) -> DeviceInput {
    DeviceInput {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/120.0".to_string(),
        ip_address: ip.to_string(),
        screen_resolution: Some("1920x1080".to_string()),
        timezone: Some("America/New_York".to_string()),
        language: Some("en-US".to_string()),
    }
}

#[tokio::test]
async fn created_session_validates_with_issued_credentials() {
    let h = setup();

    let (session, credentials) = h
        .core
        .sessions
        .create_session("player-1", device("10.0.0.2"), CreateSessionOptions::default())
        .await
        .unwrap();

    let validation = h
        .core
        .sessions
        .validate_session(&credentials.access_token)
        .await
        .unwrap();
    assert_eq!(validation.session.id, session.id);
    assert_eq!(validation.session.user_id, "player-1");
    assert!(!validation.refresh_advised);
}

#[tokio::test]
async fn unseen_device_and_external_ip_raise_risk() {
    let h = setup();

    let (session, _) = h
        .core
        .sessions
        .create_session("player-1", device("203.0.113.5"), CreateSessionOptions::default())
        .await
        .unwrap();

    // Unseen device (+30) plus non-private IP (+10).
    assert_eq!(session.risk_score, 40);
    assert!(session
        .flags
        .iter()
        .any(|f| f.kind == SessionFlagKind::NewDevice));
}

#[tokio::test]
async fn known_device_on_private_network_scores_zero() {
    let h = setup();

    let (first, _) = h
        .core
        .sessions
        .create_session("player-1", device("10.0.0.2"), CreateSessionOptions::default())
        .await
        .unwrap();
    // Drop the first session so the second is below the concurrency signal.
    h.core
        .sessions
        .terminate_session(first.id, TerminationReason::Logout)
        .await
        .unwrap();

    let (session, _) = h
        .core
        .sessions
        .create_session("player-1", device("10.0.0.2"), CreateSessionOptions::default())
        .await
        .unwrap();
    assert_eq!(session.risk_score, 0);
    assert!(session.flags.is_empty());
}

#[tokio::test]
async fn sixth_session_evicts_least_recently_active() {
    let h = setup();

    let mut ids = Vec::new();
    for _ in 0..5 {
        let (session, _) = h
            .core
            .sessions
            .create_session("player-1", device("10.0.0.2"), CreateSessionOptions::default())
            .await
            .unwrap();
        ids.push(session.id);
    }

    let (sixth, _) = h
        .core
        .sessions
        .create_session("player-1", device("10.0.0.2"), CreateSessionOptions::default())
        .await
        .unwrap();

    let active = h
        .store
        .find_active_sessions_by_user("player-1")
        .await
        .unwrap();
    assert_eq!(active.len(), 5);

    // The first session was the least recently active and is gone.
    assert!(!active.iter().any(|s| s.id == ids[0]));
    assert!(active.iter().any(|s| s.id == sixth.id));
    assert!(sixth
        .flags
        .iter()
        .any(|f| f.kind == SessionFlagKind::ConcurrentSession));
}

#[tokio::test]
async fn refresh_rotates_and_invalidates_old_credential() {
    let h = setup();

    let (_, credentials) = h
        .core
        .sessions
        .create_session("player-1", device("10.0.0.2"), CreateSessionOptions::default())
        .await
        .unwrap();

    let (_, rotated) = h
        .core
        .sessions
        .refresh_session(&credentials.refresh_token)
        .await
        .unwrap();
    assert_ne!(rotated.refresh_token, credentials.refresh_token);

    // The old refresh credential is permanently unfindable.
    let err = h
        .core
        .sessions
        .refresh_session(&credentials.refresh_token)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidCredential));

    // The rotated pair keeps working.
    assert!(h
        .core
        .sessions
        .validate_session(&rotated.access_token)
        .await
        .is_ok());
    assert!(h
        .core
        .sessions
        .refresh_session(&rotated.refresh_token)
        .await
        .is_ok());
}

#[tokio::test]
async fn expired_session_is_rejected_and_terminated() {
    let h = setup();
    let config = CoreConfig::default();
    let credentials = CredentialService::new(&config.tokens);

    // Plant an already-expired session directly in the durable store; the
    // manager's cache has never seen it.
    let (session, _) = h
        .core
        .sessions
        .create_session("player-1", device("10.0.0.2"), CreateSessionOptions::default())
        .await
        .unwrap();
    let expired_id = Uuid::new_v4();
    let expired = Session {
        id: expired_id,
        expires_at: Utc::now() - Duration::hours(1),
        ..session
    };
    h.store.insert_session(&expired).await.unwrap();

    let token = credentials.issue_access_token("player-1", expired_id).unwrap();
    let err = h.core.sessions.validate_session(&token).await.unwrap_err();
    assert!(matches!(err, CoreError::SessionExpired));

    let stored = h.store.find_session(expired_id).await.unwrap().unwrap();
    assert!(!stored.is_active);
}

#[tokio::test]
async fn terminated_session_stops_validating() {
    let h = setup();

    let (session, credentials) = h
        .core
        .sessions
        .create_session("player-1", device("10.0.0.2"), CreateSessionOptions::default())
        .await
        .unwrap();

    h.core
        .sessions
        .terminate_session(session.id, TerminationReason::Logout)
        .await
        .unwrap();
    // Idempotent.
    h.core
        .sessions
        .terminate_session(session.id, TerminationReason::Logout)
        .await
        .unwrap();

    let err = h
        .core
        .sessions
        .validate_session(&credentials.access_token)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::SessionInactive));
}

#[tokio::test]
async fn rapid_validation_kills_the_session() {
    let h = setup();
    let threshold = CoreConfig::default().sessions.suspicious_activity_per_minute;

    let (session, credentials) = h
        .core
        .sessions
        .create_session("player-1", device("10.0.0.2"), CreateSessionOptions::default())
        .await
        .unwrap();

    for _ in 0..threshold {
        h.core
            .sessions
            .validate_session(&credentials.access_token)
            .await
            .unwrap();
    }

    let err = h
        .core
        .sessions
        .validate_session(&credentials.access_token)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::SessionTerminated(_)));

    let stored = h.store.find_session(session.id).await.unwrap().unwrap();
    assert!(!stored.is_active);
}

#[tokio::test]
async fn terminate_other_sessions_keeps_only_current() {
    let h = setup();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let (session, _) = h
            .core
            .sessions
            .create_session("player-1", device("10.0.0.2"), CreateSessionOptions::default())
            .await
            .unwrap();
        ids.push(session.id);
    }

    let terminated = h
        .core
        .sessions
        .terminate_other_sessions("player-1", ids[2])
        .await
        .unwrap();
    assert_eq!(terminated, 2);

    let active = h.core.sessions.user_sessions("player-1").await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, ids[2]);
}

#[tokio::test]
async fn garbage_credentials_fail_closed() {
    let h = setup();

    let err = h
        .core
        .sessions
        .validate_session("not-a-token")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidCredential));

    let err = h
        .core
        .sessions
        .refresh_session("not-a-refresh-token")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidCredential));
}
