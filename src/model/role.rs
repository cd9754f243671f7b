use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Permission names seeded for a fresh installation, as `resource:action:scope`.
pub mod system_permissions {
    pub const USERS_CREATE_GLOBAL: &str = "users:create:global";
    pub const USERS_READ_GLOBAL: &str = "users:read:global";
    pub const USERS_READ_OWN: &str = "users:read:own";
    pub const USERS_UPDATE_GLOBAL: &str = "users:update:global";
    pub const USERS_UPDATE_OWN: &str = "users:update:own";
    pub const USERS_DELETE_GLOBAL: &str = "users:delete:global";
    pub const ROLES_CREATE_GLOBAL: &str = "roles:create:global";
    pub const ROLES_READ_GLOBAL: &str = "roles:read:global";
    pub const ROLES_UPDATE_GLOBAL: &str = "roles:update:global";
    pub const ROLES_DELETE_GLOBAL: &str = "roles:delete:global";
    pub const ROLES_ASSIGN_GLOBAL: &str = "roles:assign:global";
    pub const SESSIONS_READ_OWN: &str = "sessions:read:own";
    pub const SESSIONS_REVOKE_OWN: &str = "sessions:revoke:own";
    pub const SESSIONS_REVOKE_GLOBAL: &str = "sessions:revoke:global";
    pub const AUDIT_READ_GLOBAL: &str = "audit:read:global";
    pub const SETTINGS_UPDATE_GLOBAL: &str = "settings:update:global";

    pub const ALL: &[&str] = &[
        USERS_CREATE_GLOBAL,
        USERS_READ_GLOBAL,
        USERS_READ_OWN,
        USERS_UPDATE_GLOBAL,
        USERS_UPDATE_OWN,
        USERS_DELETE_GLOBAL,
        ROLES_CREATE_GLOBAL,
        ROLES_READ_GLOBAL,
        ROLES_UPDATE_GLOBAL,
        ROLES_DELETE_GLOBAL,
        ROLES_ASSIGN_GLOBAL,
        SESSIONS_READ_OWN,
        SESSIONS_REVOKE_OWN,
        SESSIONS_REVOKE_GLOBAL,
        AUDIT_READ_GLOBAL,
        SETTINGS_UPDATE_GLOBAL,
    ];
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: Uuid,
    pub name: String,
    pub resource: String,
    pub action: String,
    pub scope: String,
    pub description: Option<String>,
    pub is_active: bool,
}

impl Permission {
    /// Build a permission from its `resource:action:scope` name.
    ///
    /// Returns `None` unless the name has exactly three non-empty segments.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.trim().split(':');
        let resource = parts.next().filter(|part| !part.is_empty())?;
        let action = parts.next().filter(|part| !part.is_empty())?;
        let scope = parts.next().filter(|part| !part.is_empty())?;
        if parts.next().is_some() {
            return None;
        }
        let (resource, action, scope) = (
            resource.to_lowercase(),
            action.to_lowercase(),
            scope.to_lowercase(),
        );
        Some(Self {
            id: Uuid::now_v7(),
            name: format!("{resource}:{action}:{scope}"),
            resource,
            action,
            scope,
            description: None,
            is_active: true,
        })
    }

    /// Identity used for deduplication.
    #[must_use]
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.resource, &self.action, &self.scope)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub normalized_name: String,
    pub description: Option<String>,
    pub parent_role_id: Option<Uuid>,
    /// When set, the role also carries every permission of its parent chain.
    pub is_inherited: bool,
    pub is_system_role: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Role {
    #[must_use]
    pub fn new(name: &str, now: DateTime<Utc>) -> Self {
        let name = name.trim().to_string();
        Self {
            id: Uuid::now_v7(),
            normalized_name: name.to_uppercase(),
            name,
            description: None,
            parent_role_id: None,
            is_inherited: false,
            is_system_role: false,
            is_active: true,
            created_at: now,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    #[must_use]
    pub fn inherited(mut self) -> Self {
        self.is_inherited = true;
        self
    }

    #[must_use]
    pub fn system(mut self) -> Self {
        self.is_system_role = true;
        self
    }
}

/// Grant of a permission to a role. Revocation flips `is_active`; rows are kept for audit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePermission {
    pub role_id: Uuid,
    pub permission_id: Uuid,
    pub granted_by: Option<Uuid>,
    pub granted_at: DateTime<Utc>,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub conditions: Option<serde_json::Value>,
}

impl RolePermission {
    #[must_use]
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRole {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub granted_by: Option<Uuid>,
    pub granted_at: DateTime<Utc>,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserRole {
    #[must_use]
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |at| at > now)
    }
}
