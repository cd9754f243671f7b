//! Role administration and per-user permission lookups on top of [`RoleStore`].

use anyhow::Context;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::clock::Clock;
use super::permissions::{EffectiveAccess, PermissionResolver, RoleGraphError};
use crate::model::{system_permissions, Permission, Role, RolePermission, UserRole};
use crate::store::{ParentUpdate, RoleStore};

#[derive(Debug, Error)]
pub enum RoleAdminError {
    #[error(transparent)]
    Graph(#[from] RoleGraphError),
    #[error("invalid permission name {0:?}, expected resource:action:scope")]
    InvalidPermissionName(String),
    #[error("role {0} already exists")]
    DuplicateRole(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct RoleDirectory {
    store: Arc<dyn RoleStore>,
    clock: Arc<dyn Clock>,
    resolver: PermissionResolver,
}

impl RoleDirectory {
    #[must_use]
    pub fn new(store: Arc<dyn RoleStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            resolver: PermissionResolver,
        }
    }

    /// # Errors
    /// Fails if a role with the same normalized name exists or the store fails.
    pub async fn create_role(&self, role: Role) -> Result<Role, RoleAdminError> {
        let graph = self.store.load_role_graph().await?;
        if graph.role_named(&role.name).is_some() {
            return Err(RoleAdminError::DuplicateRole(role.normalized_name));
        }
        self.store.insert_role(&role).await?;
        info!(role_id = %role.id, role = %role.name, "Role created");
        Ok(role)
    }

    /// # Errors
    /// Fails for malformed names or if the store rejects the insert.
    pub async fn create_permission(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<Permission, RoleAdminError> {
        let mut permission = Permission::parse(name)
            .ok_or_else(|| RoleAdminError::InvalidPermissionName(name.to_string()))?;
        permission.description = description.map(ToString::to_string);
        self.store.insert_permission(&permission).await?;
        Ok(permission)
    }

    /// Insert every built-in permission that is not stored yet. Returns how many were added.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn seed_system_permissions(&self) -> Result<usize, RoleAdminError> {
        let graph = self.store.load_role_graph().await?;
        let mut added = 0;
        for name in system_permissions::ALL {
            if graph.permission_named(name).is_some() {
                continue;
            }
            let permission = Permission::parse(name)
                .ok_or_else(|| RoleAdminError::InvalidPermissionName((*name).to_string()))?;
            self.store
                .insert_permission(&permission)
                .await
                .with_context(|| format!("failed to seed permission {name}"))?;
            added += 1;
        }
        Ok(added)
    }

    /// Make `parent` the parent of `child`. The cycle check and the write happen atomically in
    /// the store.
    ///
    /// # Errors
    /// Fails with [`RoleGraphError::Cycle`] and friends, or on store failure.
    pub async fn attach_parent(&self, child: Uuid, parent: Uuid) -> Result<(), RoleAdminError> {
        match self.store.attach_parent(child, parent).await? {
            ParentUpdate::Attached => {
                info!(child = %child, parent = %parent, "Parent role attached");
                Ok(())
            }
            ParentUpdate::Rejected(err) => Err(err.into()),
        }
    }

    /// # Errors
    /// Returns an error if the store fails.
    pub async fn detach_parent(&self, child: Uuid) -> Result<bool, RoleAdminError> {
        Ok(self.store.detach_parent(child).await?)
    }

    /// Grant (or re-grant) a permission to a role.
    ///
    /// # Errors
    /// Fails for unknown ids, conditions that are not a JSON object, or store failure.
    pub async fn grant_permission(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        granted_by: Option<Uuid>,
        conditions: Option<serde_json::Value>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<RolePermission, RoleAdminError> {
        let grant = RolePermission {
            role_id,
            permission_id,
            granted_by,
            granted_at: self.clock.now(),
            is_active: true,
            expires_at,
            conditions,
        };
        let graph = self.store.load_role_graph().await?;
        graph.check_grant(&grant)?;
        self.store.grant_permission(&grant).await?;
        Ok(grant)
    }

    /// # Errors
    /// Fails for an unknown role or store failure.
    pub async fn assign_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        granted_by: Option<Uuid>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<UserRole, RoleAdminError> {
        let graph = self.store.load_role_graph().await?;
        if graph.role(role_id).is_none() {
            return Err(RoleGraphError::UnknownRole(role_id).into());
        }
        let assignment = UserRole {
            user_id,
            role_id,
            granted_by,
            granted_at: self.clock.now(),
            is_active: true,
            expires_at,
        };
        self.store.assign_role(&assignment).await?;
        info!(user_id = %user_id, role_id = %role_id, "Role assigned");
        Ok(assignment)
    }

    /// Soft revoke. Returns `false` if the user did not hold the role.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn revoke_role(&self, user_id: Uuid, role_id: Uuid) -> Result<bool, RoleAdminError> {
        let revoked = self.store.revoke_role(user_id, role_id).await?;
        if revoked {
            info!(user_id = %user_id, role_id = %role_id, "Role revoked");
        }
        Ok(revoked)
    }

    /// Roles and permissions a user holds right now.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn effective_access(&self, user_id: Uuid) -> anyhow::Result<EffectiveAccess> {
        let graph = self.store.load_role_graph().await?;
        let assignments = self.store.user_roles(user_id).await?;
        Ok(self
            .resolver
            .effective_access(&graph, &assignments, self.clock.now()))
    }

    /// # Errors
    /// Returns an error if the store fails.
    pub async fn has_permission(&self, user_id: Uuid, name: &str) -> anyhow::Result<bool> {
        Ok(self.effective_access(user_id).await?.has_permission(name))
    }
}
