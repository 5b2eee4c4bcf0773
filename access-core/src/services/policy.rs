//! Role-based policy engine.
//!
//! Evaluates authorization decisions from a precomputed role table,
//! per-user overrides, and named condition predicates. Decisions are
//! values: this service never returns an error past its boundary, and any
//! internal failure resolves to a denial.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{
    AccessContext, AccessDecision, Condition, Permission, PermissionOverride, Role,
    RoleDefinition, SecurityEvent, SecurityEventKind, Severity,
};

use super::audit::AuditService;
use super::directory::{IdentityStore, PermissionStore};
use super::error::CoreError;

/// Effective permissions are cached per user for this long.
const PERMISSION_CACHE_TTL: i64 = 5 * 60;

/// Typed cache key, one entry per user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UserKey(String);

struct CachedPermissions {
    permissions: Vec<Permission>,
    expires_at: DateTime<Utc>,
}

/// Outcome of one entry in a bulk permission check.
#[derive(Debug, Clone)]
pub struct BulkAccessResult {
    pub resource: String,
    pub action: String,
    pub granted: bool,
    pub reason: String,
}

struct ConditionFailure {
    reason: &'static str,
    suggestions: Vec<String>,
}

pub struct PolicyEngine {
    identity: Arc<dyn IdentityStore>,
    permissions: Arc<dyn PermissionStore>,
    audit: AuditService,
    definitions: Vec<RoleDefinition>,
    /// Per-role permission sets, inheritance already expanded.
    role_table: HashMap<Role, Vec<Permission>>,
    cache: DashMap<UserKey, CachedPermissions>,
}

impl PolicyEngine {
    pub fn new(
        identity: Arc<dyn IdentityStore>,
        permissions: Arc<dyn PermissionStore>,
        audit: AuditService,
    ) -> Self {
        let definitions = role_definitions();
        let role_table = build_role_table(&definitions);
        tracing::info!(roles = definitions.len(), "Policy engine initialized");

        Self {
            identity,
            permissions,
            audit,
            definitions,
            role_table,
            cache: DashMap::new(),
        }
    }

    /// Decide whether the context's caller may perform the requested action.
    ///
    /// First-match policy: the first effective permission covering the
    /// resource/action pair decides the outcome. If that permission's
    /// conditions fail, the check denies without falling through to later
    /// permissions on the same resource.
    pub async fn check_access(&self, ctx: &AccessContext) -> AccessDecision {
        let role = match self.identity.get_user_role(&ctx.user_id).await {
            Ok(Some(role)) => role,
            Ok(None) => {
                let decision = AccessDecision::denied("User not found")
                    .with_suggestions(vec!["Verify user account exists".to_string()]);
                self.report_decision(ctx, &decision);
                return decision;
            }
            Err(e) => {
                tracing::error!(error = %e, user_id = %ctx.user_id, "Role lookup failed");
                return AccessDecision::denied("Access check failed")
                    .with_suggestions(vec!["Try again or contact support".to_string()]);
            }
        };

        if role == Role::Suspended {
            let decision = AccessDecision::denied("Account is suspended")
                .with_suggestions(vec!["Contact support to resolve suspension".to_string()]);
            self.report_decision(ctx, &decision);
            return decision;
        }

        let effective = match self.effective_permissions(&ctx.user_id).await {
            Ok(effective) => effective,
            Err(e) => {
                tracing::error!(error = %e, user_id = %ctx.user_id, "Permission resolution failed");
                return AccessDecision::denied("Access check failed")
                    .with_suggestions(vec!["Try again or contact support".to_string()]);
            }
        };

        for permission in &effective {
            if !permission.covers(&ctx.resource, &ctx.action) {
                continue;
            }

            let applied_rule = format!("{}:{}", permission.resource, permission.actions.join(","));
            let decision = match evaluate_conditions(&permission.conditions, ctx) {
                Ok(()) => AccessDecision::granted(applied_rule),
                Err(failure) => AccessDecision::denied(failure.reason)
                    .with_rule(applied_rule)
                    .with_suggestions(failure.suggestions),
            };
            self.report_decision(ctx, &decision);
            return decision;
        }

        let decision = AccessDecision::denied(format!(
            "No permission found for {} on {}",
            ctx.action, ctx.resource
        ))
        .with_suggestions(self.denial_suggestions(ctx, role));
        self.report_decision(ctx, &decision);
        decision
    }

    /// Run several permission checks for one user.
    pub async fn check_bulk_access(
        &self,
        user_id: &str,
        checks: &[(String, String, Option<String>)],
    ) -> Vec<BulkAccessResult> {
        let mut results = Vec::with_capacity(checks.len());
        for (resource, action, resource_id) in checks {
            let mut ctx = AccessContext::new(user_id, resource, action);
            ctx.resource_id = resource_id.clone();
            let decision = self.check_access(&ctx).await;
            results.push(BulkAccessResult {
                resource: resource.clone(),
                action: action.clone(),
                granted: decision.granted,
                reason: decision.reason,
            });
        }
        results
    }

    /// Resolve a user's effective permissions: role table expanded through
    /// inheritance, unioned with non-expired overrides, deduplicated by
    /// resource with actions and conditions unioned.
    pub async fn effective_permissions(
        &self,
        user_id: &str,
    ) -> Result<Vec<Permission>, CoreError> {
        let key = UserKey(user_id.to_string());
        if let Some(cached) = self.cache.get(&key) {
            if cached.expires_at > Utc::now() {
                return Ok(cached.permissions.clone());
            }
        }

        let role = self.identity.get_user_role(user_id).await?;
        let role_permissions = role
            .and_then(|r| self.role_table.get(&r))
            .cloned()
            .unwrap_or_default();

        let overrides = self.permissions.list_overrides(user_id).await?;
        let override_permissions = overrides.into_iter().map(|o| Permission {
            resource: o.resource,
            actions: o.actions,
            conditions: o.conditions,
        });

        let effective =
            merge_permissions(role_permissions.into_iter().chain(override_permissions));

        self.cache.insert(
            key,
            CachedPermissions {
                permissions: effective.clone(),
                expires_at: Utc::now() + Duration::seconds(PERMISSION_CACHE_TTL),
            },
        );

        Ok(effective)
    }

    /// Assign a role to a user. The user's permission cache is invalidated
    /// before this returns, so no later check can read the old role's
    /// permissions.
    pub async fn assign_role(
        &self,
        user_id: &str,
        role: Role,
        assigned_by: &str,
        reason: Option<&str>,
    ) -> Result<(), CoreError> {
        self.identity.assign_role(user_id, role).await?;

        self.audit.report(
            SecurityEvent::new(SecurityEventKind::RoleAssigned, Severity::Medium, "assign_role")
                .actor(user_id)
                .meta("new_role", json!(role.as_str()))
                .meta("assigned_by", json!(assigned_by))
                .meta("reason", json!(reason)),
        );

        self.invalidate_user(user_id);
        tracing::info!(user_id = %user_id, role = role.as_str(), "Role assigned");
        Ok(())
    }

    /// Grant a temporary permission override. Merges with role permissions,
    /// does not replace them.
    pub async fn grant_override(&self, grant: PermissionOverride) -> Result<(), CoreError> {
        let user_id = grant.user_id.clone();
        let resource = grant.resource.clone();

        self.audit.report(
            SecurityEvent::new(
                SecurityEventKind::PermissionGranted,
                Severity::Medium,
                "grant_override",
            )
            .actor(&user_id)
            .resource(&resource)
            .meta("actions", json!(grant.actions))
            .meta("granted_by", json!(grant.granted_by))
            .meta("expires_at", json!(grant.expires_at))
            .meta("reason", json!(grant.reason)),
        );

        self.permissions.upsert_override(grant).await?;
        self.invalidate_user(&user_id);
        tracing::info!(user_id = %user_id, resource = %resource, "Permission override granted");
        Ok(())
    }

    /// Revoke a permission override. Returns whether one existed.
    pub async fn revoke_override(
        &self,
        user_id: &str,
        resource: &str,
        revoked_by: &str,
    ) -> Result<bool, CoreError> {
        let removed = self.permissions.delete_override(user_id, resource).await?;

        if removed {
            self.audit.report(
                SecurityEvent::new(
                    SecurityEventKind::PermissionRevoked,
                    Severity::Medium,
                    "revoke_override",
                )
                .actor(user_id)
                .resource(resource)
                .meta("revoked_by", json!(revoked_by)),
            );
            tracing::info!(user_id = %user_id, resource = %resource, "Permission override revoked");
        }

        self.invalidate_user(user_id);
        Ok(removed)
    }

    /// All role definitions, highest priority first.
    pub fn roles(&self) -> Vec<&RoleDefinition> {
        let mut defs: Vec<&RoleDefinition> = self.definitions.iter().collect();
        defs.sort_by(|a, b| b.priority.cmp(&a.priority));
        defs
    }

    pub fn role_definition(&self, role: Role) -> Option<&RoleDefinition> {
        self.definitions.iter().find(|d| d.role == role)
    }

    fn invalidate_user(&self, user_id: &str) {
        self.cache.remove(&UserKey(user_id.to_string()));
    }

    fn report_decision(&self, ctx: &AccessContext, decision: &AccessDecision) {
        let (kind, severity, outcome) = if decision.granted {
            (SecurityEventKind::AccessGranted, Severity::Low, "granted")
        } else {
            (SecurityEventKind::AccessDenied, Severity::Medium, "denied")
        };

        self.audit.report(
            SecurityEvent::new(kind, severity, ctx.action.clone())
                .actor(&ctx.user_id)
                .resource(&ctx.resource)
                .outcome(outcome)
                .meta("resource_id", json!(ctx.resource_id))
                .meta("applied_rule", json!(decision.applied_rule))
                .meta("reason", json!(decision.reason)),
        );
    }

    fn denial_suggestions(&self, ctx: &AccessContext, role: Role) -> Vec<String> {
        let mut suggestions = Vec::new();

        if role == Role::Viewer {
            suggestions.push("Request elevated permissions from an administrator".to_string());
        }
        if ctx.action == "update" || ctx.action == "delete" {
            suggestions.push("You may only have read access to this resource".to_string());
        }
        if ctx.resource == "leagues" || ctx.resource == "teams" {
            suggestions.push("Join the league or team to gain access".to_string());
        }

        suggestions
    }
}

/// Evaluate a permission's conditions against the context. All must pass.
fn evaluate_conditions(
    conditions: &[Condition],
    ctx: &AccessContext,
) -> Result<(), ConditionFailure> {
    for condition in conditions {
        match condition {
            Condition::Owner => {
                if ctx.owner_id.as_deref() != Some(ctx.user_id.as_str()) {
                    return Err(ConditionFailure {
                        reason: "You can only access your own resources",
                        suggestions: vec!["Access your own resources instead".to_string()],
                    });
                }
            }
            Condition::SameLeague => {
                // No league in the context means nothing to check.
                if ctx.league_id.is_some() && ctx.fact("same_league") != Some(true) {
                    return Err(ConditionFailure {
                        reason: "You must be in the same league to access this resource",
                        suggestions: vec!["Join the league to gain access".to_string()],
                    });
                }
            }
            Condition::Member => {
                let is_member = ctx.fact("member").or_else(|| ctx.fact("same_league"));
                if ctx.league_id.is_some() && is_member != Some(true) {
                    return Err(ConditionFailure {
                        reason: "You must be a member of this league",
                        suggestions: vec!["Request to join the league".to_string()],
                    });
                }
            }
            Condition::CommissionerOf => {
                if ctx.league_id.is_none() || ctx.fact("commissioner_of") != Some(true) {
                    return Err(ConditionFailure {
                        reason: "You must be a commissioner of this league",
                        suggestions: vec!["Contact current commissioner for access".to_string()],
                    });
                }
            }
            Condition::Public => {
                // Absent visibility fact means the resource is public.
                if !ctx.fact("public").unwrap_or(true) {
                    return Err(ConditionFailure {
                        reason: "This resource is not public",
                        suggestions: vec!["Request access from resource owner".to_string()],
                    });
                }
            }
            Condition::Participant => {
                if ctx.resource_id.is_none() || ctx.fact("participant") != Some(true) {
                    return Err(ConditionFailure {
                        reason: "You must be a participant in this activity",
                        suggestions: vec!["Get invited to participate".to_string()],
                    });
                }
            }
        }
    }
    Ok(())
}

/// Deduplicate permissions by resource, unioning actions and conditions.
/// Insertion order is preserved so earlier (role) grants stay ahead of
/// later (override) grants in the scan order.
fn merge_permissions(permissions: impl Iterator<Item = Permission>) -> Vec<Permission> {
    let mut merged: Vec<Permission> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for permission in permissions {
        match index.get(&permission.resource) {
            Some(&i) => {
                let existing = &mut merged[i];
                for action in permission.actions {
                    if !existing.actions.contains(&action) {
                        existing.actions.push(action);
                    }
                }
                for condition in permission.conditions {
                    if !existing.conditions.contains(&condition) {
                        existing.conditions.push(condition);
                    }
                }
            }
            None => {
                index.insert(permission.resource.clone(), merged.len());
                merged.push(permission);
            }
        }
    }

    merged
}

/// Static role definitions. Highest-priority roles first inside each
/// expansion so their grants win the first-match scan.
fn role_definitions() -> Vec<RoleDefinition> {
    use Condition::*;

    vec![
        RoleDefinition {
            role: Role::Admin,
            description: "System administrator with full access",
            priority: Role::Admin.priority(),
            permissions: vec![Permission::new("*", &["*"])],
            inherits_from: Vec::new(),
        },
        RoleDefinition {
            role: Role::Commissioner,
            description: "League commissioner with management privileges",
            priority: Role::Commissioner.priority(),
            permissions: vec![
                Permission::new("leagues", &["read", "update", "manage", "delete"])
                    .with_conditions(&[CommissionerOf]),
                Permission::new("teams", &["read", "update", "manage", "transfer"])
                    .with_conditions(&[SameLeague]),
                Permission::new("trades", &["read", "approve", "veto", "reverse"])
                    .with_conditions(&[SameLeague]),
                Permission::new("waivers", &["read", "manage", "process", "override"])
                    .with_conditions(&[SameLeague]),
                Permission::new("settings", &["read", "update"])
                    .with_conditions(&[CommissionerOf]),
                Permission::new("reports", &["read", "generate", "export"])
                    .with_conditions(&[SameLeague]),
                Permission::new("users", &["read", "invite", "remove"])
                    .with_conditions(&[SameLeague]),
            ],
            inherits_from: Vec::new(),
        },
        RoleDefinition {
            role: Role::Player,
            description: "Fantasy team owner with team management rights",
            priority: Role::Player.priority(),
            permissions: vec![
                Permission::new("teams", &["read", "update"]).with_conditions(&[Owner]),
                Permission::new("lineups", &["read", "update", "set"]).with_conditions(&[Owner]),
                Permission::new("trades", &["read", "create", "accept", "reject", "counter"])
                    .with_conditions(&[Participant]),
                Permission::new("waivers", &["read", "create", "cancel"])
                    .with_conditions(&[Owner]),
                Permission::new("draft", &["read", "pick"]).with_conditions(&[Participant]),
                Permission::new("messages", &["read", "create", "reply"])
                    .with_conditions(&[SameLeague]),
                Permission::new("players", &["read"]),
                Permission::new("stats", &["read"]),
                Permission::new("leagues", &["read"]).with_conditions(&[Member]),
            ],
            inherits_from: Vec::new(),
        },
        RoleDefinition {
            role: Role::Analyst,
            description: "Data analyst with advanced statistics access",
            priority: Role::Analyst.priority(),
            permissions: vec![
                Permission::new("players", &["read", "analyze"]),
                Permission::new("stats", &["read", "export", "aggregate"]),
                Permission::new("analytics", &["read", "generate", "create"]),
                Permission::new("reports", &["read", "generate"]),
                Permission::new("projections", &["read", "create", "update"]),
                Permission::new("leagues", &["read"]),
                Permission::new("teams", &["read"]),
            ],
            inherits_from: Vec::new(),
        },
        RoleDefinition {
            role: Role::Viewer,
            description: "Read-only access to public information",
            priority: Role::Viewer.priority(),
            permissions: vec![
                Permission::new("leagues", &["read"]).with_conditions(&[Public]),
                Permission::new("players", &["read"]),
                Permission::new("stats", &["read"]).with_conditions(&[Public]),
                Permission::new("teams", &["read"]).with_conditions(&[Public]),
            ],
            inherits_from: Vec::new(),
        },
        RoleDefinition {
            role: Role::Suspended,
            description: "Suspended user with no access",
            priority: Role::Suspended.priority(),
            permissions: Vec::new(),
            inherits_from: Vec::new(),
        },
    ]
}

/// Expand each role's permissions through inheritance into a flat table,
/// resolved once at construction. Inherited contributions are visited
/// highest priority first so their grants take precedence in the scan.
fn build_role_table(definitions: &[RoleDefinition]) -> HashMap<Role, Vec<Permission>> {
    let by_role: HashMap<Role, &RoleDefinition> =
        definitions.iter().map(|d| (d.role, d)).collect();

    definitions
        .iter()
        .map(|def| (def.role, merge_permissions(expand_role(def, &by_role).into_iter())))
        .collect()
}

fn expand_role(
    def: &RoleDefinition,
    by_role: &HashMap<Role, &RoleDefinition>,
) -> Vec<Permission> {
    let mut permissions = def.permissions.clone();

    let mut parents = def.inherits_from.clone();
    parents.sort_by(|a, b| b.priority().cmp(&a.priority()));
    for parent in parents {
        if let Some(parent_def) = by_role.get(&parent) {
            permissions.extend(expand_role(parent_def, by_role));
        }
    }

    permissions
}
