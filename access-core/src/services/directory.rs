//! Identity and permission store collaborators.
//!
//! The core never talks to a database directly; it resolves users, roles,
//! and per-user overrides through these traits. `MemoryDirectory` backs the
//! test suites.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::{MfaEnrollment, PermissionOverride, Role};

/// User record as the identity store sees it.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub role: Role,
    pub locked_until: Option<DateTime<Utc>>,
    pub phone_number: Option<String>,
    pub mfa: Option<MfaEnrollment>,
}

impl UserRecord {
    pub fn new(id: &str, email: &str, role: Role) -> Self {
        Self {
            id: id.to_string(),
            email: email.to_string(),
            role,
            locked_until: None,
            phone_number: None,
            mfa: None,
        }
    }
}

/// Read/write contract against the platform's user directory.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, anyhow::Error>;

    async fn get_user_role(&self, user_id: &str) -> Result<Option<Role>, anyhow::Error>;

    async fn assign_role(&self, user_id: &str, role: Role) -> Result<(), anyhow::Error>;

    async fn mfa_enrollment(&self, user_id: &str) -> Result<Option<MfaEnrollment>, anyhow::Error>;

    async fn store_mfa_enrollment(
        &self,
        user_id: &str,
        enrollment: MfaEnrollment,
    ) -> Result<(), anyhow::Error>;

    async fn clear_mfa_enrollment(&self, user_id: &str) -> Result<(), anyhow::Error>;

    /// Remove exactly one consumed backup code from the user's set.
    async fn remove_backup_code(&self, user_id: &str, code: &str) -> Result<(), anyhow::Error>;
}

/// Contract against the per-user permission override table.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// List only the overrides whose expiry is unset or in the future.
    async fn list_overrides(&self, user_id: &str)
        -> Result<Vec<PermissionOverride>, anyhow::Error>;

    /// Insert or replace the override for `(user, resource)`.
    async fn upsert_override(&self, grant: PermissionOverride) -> Result<(), anyhow::Error>;

    /// Returns whether an override existed.
    async fn delete_override(&self, user_id: &str, resource: &str)
        -> Result<bool, anyhow::Error>;
}

/// In-memory directory used by tests and examples.
#[derive(Default)]
pub struct MemoryDirectory {
    users: Mutex<HashMap<String, UserRecord>>,
    overrides: Mutex<HashMap<(String, String), PermissionOverride>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: UserRecord) {
        self.users
            .lock()
            .expect("directory mutex poisoned")
            .insert(user.id.clone(), user);
    }
}

#[async_trait]
impl IdentityStore for MemoryDirectory {
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, anyhow::Error> {
        let users = self
            .users
            .lock()
            .map_err(|e| anyhow::anyhow!("directory mutex poisoned: {}", e))?;
        Ok(users.get(user_id).cloned())
    }

    async fn get_user_role(&self, user_id: &str) -> Result<Option<Role>, anyhow::Error> {
        Ok(self.get_user(user_id).await?.map(|u| u.role))
    }

    async fn assign_role(&self, user_id: &str, role: Role) -> Result<(), anyhow::Error> {
        let mut users = self
            .users
            .lock()
            .map_err(|e| anyhow::anyhow!("directory mutex poisoned: {}", e))?;
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| anyhow::anyhow!("user not found: {}", user_id))?;
        user.role = role;
        Ok(())
    }

    async fn mfa_enrollment(&self, user_id: &str) -> Result<Option<MfaEnrollment>, anyhow::Error> {
        Ok(self.get_user(user_id).await?.and_then(|u| u.mfa))
    }

    async fn store_mfa_enrollment(
        &self,
        user_id: &str,
        enrollment: MfaEnrollment,
    ) -> Result<(), anyhow::Error> {
        let mut users = self
            .users
            .lock()
            .map_err(|e| anyhow::anyhow!("directory mutex poisoned: {}", e))?;
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| anyhow::anyhow!("user not found: {}", user_id))?;
        user.mfa = Some(enrollment);
        Ok(())
    }

    async fn clear_mfa_enrollment(&self, user_id: &str) -> Result<(), anyhow::Error> {
        let mut users = self
            .users
            .lock()
            .map_err(|e| anyhow::anyhow!("directory mutex poisoned: {}", e))?;
        if let Some(user) = users.get_mut(user_id) {
            user.mfa = None;
        }
        Ok(())
    }

    async fn remove_backup_code(&self, user_id: &str, code: &str) -> Result<(), anyhow::Error> {
        let mut users = self
            .users
            .lock()
            .map_err(|e| anyhow::anyhow!("directory mutex poisoned: {}", e))?;
        if let Some(enrollment) = users.get_mut(user_id).and_then(|u| u.mfa.as_mut()) {
            enrollment.backup_codes.retain(|c| c != code);
        }
        Ok(())
    }
}

#[async_trait]
impl PermissionStore for MemoryDirectory {
    async fn list_overrides(
        &self,
        user_id: &str,
    ) -> Result<Vec<PermissionOverride>, anyhow::Error> {
        let overrides = self
            .overrides
            .lock()
            .map_err(|e| anyhow::anyhow!("directory mutex poisoned: {}", e))?;
        Ok(overrides
            .values()
            .filter(|o| o.user_id == user_id && !o.is_expired())
            .cloned()
            .collect())
    }

    async fn upsert_override(&self, grant: PermissionOverride) -> Result<(), anyhow::Error> {
        let mut overrides = self
            .overrides
            .lock()
            .map_err(|e| anyhow::anyhow!("directory mutex poisoned: {}", e))?;
        overrides.insert((grant.user_id.clone(), grant.resource.clone()), grant);
        Ok(())
    }

    async fn delete_override(
        &self,
        user_id: &str,
        resource: &str,
    ) -> Result<bool, anyhow::Error> {
        let mut overrides = self
            .overrides
            .lock()
            .map_err(|e| anyhow::anyhow!("directory mutex poisoned: {}", e))?;
        Ok(overrides
            .remove(&(user_id.to_string(), resource.to_string()))
            .is_some())
    }
}
