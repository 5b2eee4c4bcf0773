//! Authorization model - roles, permissions, and access decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// User roles, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Commissioner,
    Player,
    Analyst,
    Viewer,
    Suspended,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Commissioner => "commissioner",
            Role::Player => "player",
            Role::Analyst => "analyst",
            Role::Viewer => "viewer",
            Role::Suspended => "suspended",
        }
    }

    /// Fixed priority used for inheritance tie-breaks. Higher wins.
    pub fn priority(&self) -> u16 {
        match self {
            Role::Admin => 1000,
            Role::Commissioner => 800,
            Role::Player => 600,
            Role::Analyst => 400,
            Role::Viewer => 200,
            Role::Suspended => 0,
        }
    }

    /// All roles, highest priority first.
    pub fn all() -> [Role; 6] {
        [
            Role::Admin,
            Role::Commissioner,
            Role::Player,
            Role::Analyst,
            Role::Viewer,
            Role::Suspended,
        ]
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "commissioner" => Ok(Role::Commissioner),
            "player" => Ok(Role::Player),
            "analyst" => Ok(Role::Analyst),
            "viewer" => Ok(Role::Viewer),
            "suspended" => Ok(Role::Suspended),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named condition predicates attached to a permission.
///
/// Each variant is evaluated against the [`AccessContext`] at check time,
/// never pre-computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// The caller must own the resource.
    Owner,
    /// The caller must belong to the league the resource lives in.
    SameLeague,
    /// The caller must be the commissioner of the league.
    CommissionerOf,
    /// The resource must be publicly visible.
    Public,
    /// The caller must be a member of the league.
    Member,
    /// The caller must be a participant in the activity (trade, draft).
    Participant,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Owner => "owner",
            Condition::SameLeague => "same_league",
            Condition::CommissionerOf => "commissioner_of",
            Condition::Public => "public",
            Condition::Member => "member",
            Condition::Participant => "participant",
        }
    }
}

/// A grant of actions on a resource, optionally gated by conditions.
///
/// `resource = "*"` and an action of `"*"` are wildcards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub actions: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Permission {
    pub fn new(resource: &str, actions: &[&str]) -> Self {
        Self {
            resource: resource.to_string(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
            conditions: Vec::new(),
        }
    }

    pub fn with_conditions(mut self, conditions: &[Condition]) -> Self {
        self.conditions = conditions.to_vec();
        self
    }

    /// Check whether this permission covers the requested resource/action.
    pub fn covers(&self, resource: &str, action: &str) -> bool {
        if self.resource != "*" && self.resource != resource {
            return false;
        }
        self.actions.iter().any(|a| a == "*" || a == action)
    }
}

/// Declarative definition of a role: its permissions and inheritance.
#[derive(Debug, Clone)]
pub struct RoleDefinition {
    pub role: Role,
    pub description: &'static str,
    pub priority: u16,
    pub permissions: Vec<Permission>,
    pub inherits_from: Vec<Role>,
}

/// A user-scoped, resource-scoped permission grant that merges with role
/// permissions. Carries an audit trail and an optional expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionOverride {
    pub user_id: String,
    pub resource: String,
    pub actions: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub expires_at: Option<DateTime<Utc>>,
    pub granted_by: String,
    pub reason: String,
    pub granted_at: DateTime<Utc>,
}

impl PermissionOverride {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => at <= Utc::now(),
            None => false,
        }
    }
}

/// The complete input to one authorization decision. Immutable per check.
///
/// `metadata` carries boolean facts the outer layer has already resolved
/// (league membership, commissioner status, public visibility, participant
/// status) so condition evaluation never leaves the context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessContext {
    pub user_id: String,
    pub resource: String,
    pub action: String,
    pub resource_id: Option<String>,
    pub owner_id: Option<String>,
    pub league_id: Option<String>,
    pub team_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AccessContext {
    pub fn new(user_id: &str, resource: &str, action: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            action: action.to_string(),
            resource_id: None,
            owner_id: None,
            league_id: None,
            team_id: None,
            metadata: Map::new(),
        }
    }

    pub fn with_resource_id(mut self, resource_id: &str) -> Self {
        self.resource_id = Some(resource_id.to_string());
        self
    }

    pub fn with_owner(mut self, owner_id: &str) -> Self {
        self.owner_id = Some(owner_id.to_string());
        self
    }

    pub fn with_league(mut self, league_id: &str) -> Self {
        self.league_id = Some(league_id.to_string());
        self
    }

    pub fn with_fact(mut self, key: &str, value: bool) -> Self {
        self.metadata.insert(key.to_string(), Value::Bool(value));
        self
    }

    /// Look up a resolved boolean fact in the context metadata.
    pub fn fact(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(Value::as_bool)
    }
}

/// Outcome of a single authorization check.
#[derive(Debug, Clone, Serialize)]
pub struct AccessDecision {
    pub granted: bool,
    pub reason: String,
    pub applied_rule: Option<String>,
    pub suggestions: Vec<String>,
}

impl AccessDecision {
    pub fn granted(applied_rule: String) -> Self {
        Self {
            granted: true,
            reason: "Permission granted".to_string(),
            applied_rule: Some(applied_rule),
            suggestions: Vec::new(),
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            granted: false,
            reason: reason.into(),
            applied_rule: None,
            suggestions: Vec::new(),
        }
    }

    pub fn with_rule(mut self, applied_rule: String) -> Self {
        self.applied_rule = Some(applied_rule);
        self
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }
}
