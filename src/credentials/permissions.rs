//! Role graph and effective permission resolution.
//!
//! Roles form a forest through `parent_role_id`. The graph is held as an id-indexed snapshot
//! and walked by lookup, never through object references. Cycles are rejected when a parent is
//! attached; resolution walks parent chains assuming the stored graph is acyclic.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Permission, Role, RolePermission, UserRole};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoleGraphError {
    #[error("unknown role: {0}")]
    UnknownRole(Uuid),
    #[error("unknown permission: {0}")]
    UnknownPermission(Uuid),
    #[error("role {0} cannot be its own parent")]
    SelfParent(Uuid),
    #[error("attaching {parent} as parent of {child} would create a cycle")]
    Cycle { child: Uuid, parent: Uuid },
    #[error("grant conditions must be a JSON object: {0}")]
    InvalidConditions(String),
}

/// Snapshot of roles, permissions and role grants loaded from a store.
#[derive(Clone, Debug, Default)]
pub struct RoleGraph {
    roles: HashMap<Uuid, Role>,
    permissions: HashMap<Uuid, Permission>,
    grants: HashMap<Uuid, Vec<RolePermission>>,
}

impl RoleGraph {
    #[must_use]
    pub fn new(roles: Vec<Role>, permissions: Vec<Permission>, grants: Vec<RolePermission>) -> Self {
        let mut graph = Self {
            roles: roles.into_iter().map(|role| (role.id, role)).collect(),
            permissions: permissions
                .into_iter()
                .map(|permission| (permission.id, permission))
                .collect(),
            grants: HashMap::new(),
        };
        for grant in grants {
            graph.grants.entry(grant.role_id).or_default().push(grant);
        }
        graph
    }

    #[must_use]
    pub fn role(&self, id: Uuid) -> Option<&Role> {
        self.roles.get(&id)
    }

    #[must_use]
    pub fn permission(&self, id: Uuid) -> Option<&Permission> {
        self.permissions.get(&id)
    }

    /// Case-insensitive lookup by `resource:action:scope` name.
    #[must_use]
    pub fn permission_named(&self, name: &str) -> Option<&Permission> {
        let name = name.trim();
        self.permissions
            .values()
            .find(|permission| permission.name.eq_ignore_ascii_case(name))
    }

    /// Lookup by normalized (uppercase) role name.
    #[must_use]
    pub fn role_named(&self, name: &str) -> Option<&Role> {
        let normalized = name.trim().to_uppercase();
        self.roles
            .values()
            .find(|role| role.normalized_name == normalized)
    }

    /// Ids from `role_id` upwards, starting with the role itself.
    fn ancestry(&self, role_id: Uuid) -> Vec<Uuid> {
        let mut chain = Vec::new();
        let mut cursor = Some(role_id);
        while let Some(id) = cursor {
            // A corrupt snapshot must not spin forever.
            if chain.contains(&id) || chain.len() > self.roles.len() {
                break;
            }
            chain.push(id);
            cursor = self.roles.get(&id).and_then(|role| role.parent_role_id);
        }
        chain
    }

    /// Validate making `parent` the parent of `child`.
    ///
    /// # Errors
    /// Fails if either role is unknown, if they are the same role, or if `child` is already an
    /// ancestor of `parent`.
    pub fn check_parent(&self, child: Uuid, parent: Uuid) -> Result<(), RoleGraphError> {
        if !self.roles.contains_key(&child) {
            return Err(RoleGraphError::UnknownRole(child));
        }
        if !self.roles.contains_key(&parent) {
            return Err(RoleGraphError::UnknownRole(parent));
        }
        if child == parent {
            return Err(RoleGraphError::SelfParent(child));
        }
        if self.ancestry(parent).contains(&child) {
            return Err(RoleGraphError::Cycle { child, parent });
        }
        Ok(())
    }

    /// Validate a new grant before it is stored.
    ///
    /// # Errors
    /// Fails for unknown ids or conditions that are not a JSON object.
    pub fn check_grant(&self, grant: &RolePermission) -> Result<(), RoleGraphError> {
        if !self.roles.contains_key(&grant.role_id) {
            return Err(RoleGraphError::UnknownRole(grant.role_id));
        }
        if !self.permissions.contains_key(&grant.permission_id) {
            return Err(RoleGraphError::UnknownPermission(grant.permission_id));
        }
        validate_conditions(grant.conditions.as_ref())
    }

    fn active_permissions_of(
        &self,
        role_id: Uuid,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = &Permission> + '_ {
        self.grants
            .get(&role_id)
            .into_iter()
            .flatten()
            .filter(move |grant| grant.is_effective(now))
            .filter_map(move |grant| self.permissions.get(&grant.permission_id))
            .filter(|permission| permission.is_active)
    }

    /// Roles contributing permissions for one held role: the role, then each parent for as
    /// long as the child in hand is marked `is_inherited`.
    fn contributing_roles(&self, role_id: Uuid) -> Vec<&Role> {
        let mut roles = Vec::new();
        for id in self.ancestry(role_id) {
            let Some(role) = self.roles.get(&id) else {
                break;
            };
            if !role.is_active {
                break;
            }
            roles.push(role);
            if !role.is_inherited {
                break;
            }
        }
        roles
    }
}

/// Structural check for the opaque grant conditions blob. Contents are not interpreted.
///
/// # Errors
/// Returns `InvalidConditions` unless the value is absent or a JSON object.
pub fn validate_conditions(conditions: Option<&serde_json::Value>) -> Result<(), RoleGraphError> {
    match conditions {
        None | Some(serde_json::Value::Object(_)) => Ok(()),
        Some(other) => Err(RoleGraphError::InvalidConditions(other.to_string())),
    }
}

/// Parse a raw conditions string as sent by an administrator.
///
/// # Errors
/// Returns `InvalidConditions` for malformed JSON or non-object values.
pub fn parse_conditions(raw: &str) -> Result<serde_json::Value, RoleGraphError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|err| RoleGraphError::InvalidConditions(err.to_string()))?;
    validate_conditions(Some(&value))?;
    Ok(value)
}

/// Resolved access for one user at one instant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EffectiveAccess {
    pub roles: Vec<String>,
    pub permissions: Vec<Permission>,
}

impl EffectiveAccess {
    #[must_use]
    pub fn permission_names(&self) -> Vec<String> {
        self.permissions
            .iter()
            .map(|permission| permission.name.clone())
            .collect()
    }

    /// Case-insensitive name membership.
    #[must_use]
    pub fn has_permission(&self, name: &str) -> bool {
        let name = name.trim();
        self.permissions
            .iter()
            .any(|permission| permission.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PermissionResolver;

impl PermissionResolver {
    /// Union of permissions reachable from the active, unexpired role assignments, deduplicated
    /// by `(resource, action, scope)` and sorted by name.
    #[must_use]
    pub fn effective_access(
        &self,
        graph: &RoleGraph,
        assignments: &[UserRole],
        now: DateTime<Utc>,
    ) -> EffectiveAccess {
        let mut role_names = Vec::new();
        let mut seen_roles = HashSet::new();
        let mut permissions: BTreeMap<(String, String, String), Permission> = BTreeMap::new();

        for assignment in assignments.iter().filter(|a| a.is_effective(now)) {
            if !seen_roles.insert(assignment.role_id) {
                continue;
            }
            let contributing = graph.contributing_roles(assignment.role_id);
            if let Some(held) = contributing.first() {
                role_names.push(held.name.clone());
            }
            for role in contributing {
                for permission in graph.active_permissions_of(role.id, now) {
                    let (resource, action, scope) = permission.key();
                    permissions
                        .entry((resource.to_string(), action.to_string(), scope.to_string()))
                        .or_insert_with(|| permission.clone());
                }
            }
        }

        role_names.sort();
        let mut permissions: Vec<Permission> = permissions.into_values().collect();
        permissions.sort_by(|a, b| a.name.cmp(&b.name));
        EffectiveAccess {
            roles: role_names,
            permissions,
        }
    }

    #[must_use]
    pub fn has_permission(
        &self,
        graph: &RoleGraph,
        assignments: &[UserRole],
        name: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.effective_access(graph, assignments, now)
            .has_permission(name)
    }
}
