use access_core::config::CoreConfig;
use access_core::models::{AccessContext, PermissionOverride, Role};
use access_core::services::{
    AuditService, MemoryAuditSink, MemoryDirectory, PolicyEngine, UserRecord,
};
use chrono::{Duration, Utc};
use std::sync::Arc;

fn setup() -> (PolicyEngine, Arc<MemoryDirectory>, Arc<MemoryAuditSink>) {
    let directory = Arc::new(MemoryDirectory::new());
    directory.insert_user(UserRecord::new("admin-1", "admin@example.com", Role::Admin));
    directory.insert_user(UserRecord::new("comm-1", "comm@example.com", Role::Commissioner));
    directory.insert_user(UserRecord::new("player-1", "player@example.com", Role::Player));
    directory.insert_user(UserRecord::new("viewer-1", "viewer@example.com", Role::Viewer));
    directory.insert_user(UserRecord::new("susp-1", "susp@example.com", Role::Suspended));

    let sink = Arc::new(MemoryAuditSink::new());
    let engine = PolicyEngine::new(
        directory.clone(),
        directory.clone(),
        AuditService::new(sink.clone()),
    );
    (engine, directory, sink)
}

// Keep the config import exercised alongside the engine defaults.
#[test]
fn config_defaults_available() {
    assert_eq!(CoreConfig::default().sessions.max_concurrent_sessions, 5);
}

#[tokio::test]
async fn admin_wildcard_grants_everything() {
    let (engine, _, _) = setup();

    let decision = engine
        .check_access(&AccessContext::new("admin-1", "leagues", "delete"))
        .await;
    assert!(decision.granted);
    assert_eq!(decision.applied_rule.as_deref(), Some("*:*"));
}

#[tokio::test]
async fn suspended_user_is_always_denied() {
    let (engine, _, _) = setup();

    let decision = engine
        .check_access(&AccessContext::new("susp-1", "players", "read"))
        .await;
    assert!(!decision.granted);
    assert!(decision.reason.contains("suspended"));
}

#[tokio::test]
async fn unknown_user_fails_closed() {
    let (engine, _, _) = setup();

    let decision = engine
        .check_access(&AccessContext::new("nobody", "players", "read"))
        .await;
    assert!(!decision.granted);
    assert_eq!(decision.reason, "User not found");
}

#[tokio::test]
async fn effective_permissions_superset_of_role_declarations() {
    let (engine, _, _) = setup();

    for (user_id, role) in [
        ("admin-1", Role::Admin),
        ("comm-1", Role::Commissioner),
        ("player-1", Role::Player),
        ("viewer-1", Role::Viewer),
    ] {
        let effective = engine.effective_permissions(user_id).await.unwrap();
        let declared = engine.role_definition(role).unwrap().permissions.clone();

        for permission in declared {
            for action in &permission.actions {
                assert!(
                    effective.iter().any(|p| p.covers(&permission.resource, action)),
                    "{:?} lost {}:{}",
                    role,
                    permission.resource,
                    action
                );
            }
        }
    }
}

#[tokio::test]
async fn override_grants_access_beyond_role() {
    let (engine, _, _) = setup();

    // Viewers have no analytics permission at all.
    let decision = engine
        .check_access(&AccessContext::new("viewer-1", "analytics", "read"))
        .await;
    assert!(!decision.granted);

    engine
        .grant_override(PermissionOverride {
            user_id: "viewer-1".to_string(),
            resource: "analytics".to_string(),
            actions: vec!["read".to_string()],
            conditions: Vec::new(),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            granted_by: "admin-1".to_string(),
            reason: "temporary analyst duty".to_string(),
            granted_at: Utc::now(),
        })
        .await
        .unwrap();

    let decision = engine
        .check_access(&AccessContext::new("viewer-1", "analytics", "read"))
        .await;
    assert!(decision.granted);
}

#[tokio::test]
async fn expiring_override_is_observable_on_next_check() {
    let (engine, _, _) = setup();

    engine
        .grant_override(PermissionOverride {
            user_id: "viewer-1".to_string(),
            resource: "reports".to_string(),
            actions: vec!["read".to_string()],
            conditions: Vec::new(),
            expires_at: None,
            granted_by: "admin-1".to_string(),
            reason: "audit support".to_string(),
            granted_at: Utc::now(),
        })
        .await
        .unwrap();

    let decision = engine
        .check_access(&AccessContext::new("viewer-1", "reports", "read"))
        .await;
    assert!(decision.granted);

    // Re-granting with a past expiry must take effect on the very next
    // check, despite the permission cache.
    engine
        .grant_override(PermissionOverride {
            user_id: "viewer-1".to_string(),
            resource: "reports".to_string(),
            actions: vec!["read".to_string()],
            conditions: Vec::new(),
            expires_at: Some(Utc::now() - Duration::seconds(1)),
            granted_by: "admin-1".to_string(),
            reason: "expired".to_string(),
            granted_at: Utc::now(),
        })
        .await
        .unwrap();

    let decision = engine
        .check_access(&AccessContext::new("viewer-1", "reports", "read"))
        .await;
    assert!(!decision.granted);
}

#[tokio::test]
async fn revoking_override_invalidates_cache() {
    let (engine, _, _) = setup();

    engine
        .grant_override(PermissionOverride {
            user_id: "viewer-1".to_string(),
            resource: "projections".to_string(),
            actions: vec!["read".to_string()],
            conditions: Vec::new(),
            expires_at: None,
            granted_by: "admin-1".to_string(),
            reason: "trial".to_string(),
            granted_at: Utc::now(),
        })
        .await
        .unwrap();
    assert!(
        engine
            .check_access(&AccessContext::new("viewer-1", "projections", "read"))
            .await
            .granted
    );

    let removed = engine
        .revoke_override("viewer-1", "projections", "admin-1")
        .await
        .unwrap();
    assert!(removed);

    assert!(
        !engine
            .check_access(&AccessContext::new("viewer-1", "projections", "read"))
            .await
            .granted
    );
}

#[tokio::test]
async fn role_assignment_takes_effect_immediately() {
    let (engine, _, _) = setup();

    assert!(
        !engine
            .check_access(&AccessContext::new("viewer-1", "analytics", "create"))
            .await
            .granted
    );

    // Warm the cache, then change the role; the cache must not serve the
    // old role's permissions afterwards.
    engine.effective_permissions("viewer-1").await.unwrap();
    engine
        .assign_role("viewer-1", Role::Analyst, "admin-1", Some("promotion"))
        .await
        .unwrap();

    assert!(
        engine
            .check_access(&AccessContext::new("viewer-1", "analytics", "create"))
            .await
            .granted
    );
}

#[tokio::test]
async fn private_league_denial_mentions_visibility_not_ownership() {
    let (engine, _, _) = setup();

    let ctx = AccessContext::new("viewer-1", "leagues", "read")
        .with_league("l1")
        .with_fact("public", false);
    let decision = engine.check_access(&ctx).await;

    assert!(!decision.granted);
    assert!(decision.reason.contains("not public"));
    assert!(!decision.reason.to_lowercase().contains("own"));
}

#[tokio::test]
async fn owner_condition_gates_team_updates() {
    let (engine, _, _) = setup();

    let ctx = AccessContext::new("player-1", "teams", "update").with_owner("player-1");
    assert!(engine.check_access(&ctx).await.granted);

    let ctx = AccessContext::new("player-1", "teams", "update").with_owner("someone-else");
    let decision = engine.check_access(&ctx).await;
    assert!(!decision.granted);
    assert!(decision.reason.contains("own"));
}

#[tokio::test]
async fn scan_stops_at_first_resource_match_even_when_conditions_fail() {
    let (engine, _, _) = setup();

    // A wildcard override would grant teams:update unconditionally, but the
    // player role's own teams permission is scanned first and its ownership
    // condition decides the outcome.
    engine
        .grant_override(PermissionOverride {
            user_id: "player-1".to_string(),
            resource: "*".to_string(),
            actions: vec!["*".to_string()],
            conditions: Vec::new(),
            expires_at: None,
            granted_by: "admin-1".to_string(),
            reason: "escalation".to_string(),
            granted_at: Utc::now(),
        })
        .await
        .unwrap();

    let ctx = AccessContext::new("player-1", "teams", "update").with_owner("someone-else");
    let decision = engine.check_access(&ctx).await;
    assert!(!decision.granted);
    assert!(decision.reason.contains("own"));

    // The wildcard still applies to resources the role says nothing about.
    let decision = engine
        .check_access(&AccessContext::new("player-1", "settings", "update"))
        .await;
    assert!(decision.granted);
}

#[tokio::test]
async fn bulk_check_reports_per_resource() {
    let (engine, _, _) = setup();

    let results = engine
        .check_bulk_access(
            "viewer-1",
            &[
                ("players".to_string(), "read".to_string(), None),
                ("analytics".to_string(), "create".to_string(), None),
            ],
        )
        .await;

    assert_eq!(results.len(), 2);
    assert!(results[0].granted);
    assert!(!results[1].granted);
}

#[tokio::test]
async fn decisions_are_audited() {
    let (engine, _, sink) = setup();

    engine
        .check_access(&AccessContext::new("viewer-1", "players", "read"))
        .await;
    engine
        .check_access(&AccessContext::new("viewer-1", "analytics", "create"))
        .await;

    // Audit writes are fire-and-forget; give the spawned tasks a beat.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let events = sink.snapshot();
    assert!(events.iter().any(|e| e.outcome == "granted"));
    assert!(events.iter().any(|e| e.outcome == "denied"));
}
