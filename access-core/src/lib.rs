//! Access-control security core.
//!
//! Decides, for every inbound request, whether it may proceed, which
//! identity it proceeds as, and whether that identity is behaving normally
//! enough to keep its session alive. Four components cooperate:
//!
//! - [`services::SecurityGuard`] - rate limiting, IP blocking, lockout;
//!   consulted first on every request.
//! - [`services::SessionManager`] - session creation, validation, refresh
//!   rotation, and termination.
//! - [`services::PolicyEngine`] - role/permission evaluation with
//!   conditions and per-user overrides.
//! - [`services::MfaCoordinator`] - single-use verification challenges for
//!   session elevation.
//!
//! Persistence, audit logging, notification delivery, and geolocation are
//! collaborators injected as trait objects; the core owns only in-memory
//! state.

pub mod config;
pub mod models;
pub mod observability;
pub mod services;
pub mod utils;

use std::sync::Arc;

use config::CoreConfig;
use services::{
    AuditService, AuditSink, CredentialService, GeoResolver, IdentityStore, MfaCoordinator,
    NotificationDispatcher, PermissionStore, PolicyEngine, SecurityGuard, SessionManager,
    SessionStore,
};

/// External collaborators the core is wired against, injected once at
/// process startup.
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityStore>,
    pub permissions: Arc<dyn PermissionStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn NotificationDispatcher>,
    pub geo: Arc<dyn GeoResolver>,
}

/// The assembled security core. Construct one per process and pass it
/// through the request-handling path explicitly.
pub struct SecurityCore {
    pub config: CoreConfig,
    pub guard: SecurityGuard,
    pub policy: PolicyEngine,
    pub sessions: SessionManager,
    pub mfa: MfaCoordinator,
}

impl SecurityCore {
    /// Wire the four components against their collaborators and start the
    /// background sweepers. Must be called within a tokio runtime.
    pub fn new(config: CoreConfig, collaborators: Collaborators) -> Self {
        let audit = AuditService::new(collaborators.audit);
        let credentials = CredentialService::new(&config.tokens);

        let guard = SecurityGuard::new(config.guard.clone(), audit.clone());
        let policy = PolicyEngine::new(
            collaborators.identity.clone(),
            collaborators.permissions,
            audit.clone(),
        );
        let sessions = SessionManager::new(
            config.sessions.clone(),
            credentials,
            collaborators.sessions,
            collaborators.identity.clone(),
            audit.clone(),
            collaborators.notifier.clone(),
            collaborators.geo,
        );
        let mfa = MfaCoordinator::new(
            config.mfa.clone(),
            collaborators.identity,
            audit,
            collaborators.notifier,
        );

        tracing::info!("Security core initialized");
        Self {
            config,
            guard,
            policy,
            sessions,
            mfa,
        }
    }

    /// Stop all background sweepers. In-flight calls are unaffected.
    pub fn shutdown(&self) {
        self.guard.shutdown();
        self.sessions.shutdown();
        self.mfa.shutdown();
    }
}
