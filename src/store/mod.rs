//! Persistence boundary for users, sessions and the role graph.
//!
//! The credential core only talks to these traits. `MemoryStore` backs development and tests;
//! `PgStore` is the production implementation on PostgreSQL.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::credentials::lockout::LockoutPolicy;
use crate::credentials::permissions::{RoleGraph, RoleGraphError};
use crate::model::{
    Permission, Role, RolePermission, Session, SessionStatus, User, UserRole, UserStatus,
    VerificationToken,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertUserOutcome {
    Created,
    EmailTaken,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenSweep {
    pub email_verification: u64,
    pub password_reset: u64,
}

#[derive(Debug)]
pub enum ParentUpdate {
    Attached,
    Rejected(RoleGraphError),
}

/// Lockout counters as stored after a failed password check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailedLogin {
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

/// Clears the lockout after a good password. Applied only while `password_changed_at` still
/// matches the value read before the password was checked.
#[derive(Clone, Debug)]
pub struct SuccessfulLogin {
    pub user_id: Uuid,
    pub password_changed_at: Option<DateTime<Utc>>,
    /// Replacement hash at the current cost, if the stored one is weaker.
    pub rehashed_password: Option<String>,
    pub now: DateTime<Utc>,
}

/// Sets a new password through a reset token. Applied only while `token` is the user's live
/// reset token, which makes the token single use.
#[derive(Clone, Debug)]
pub struct PasswordReset {
    pub user_id: Uuid,
    pub token: String,
    pub password_hash: String,
    pub changed_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

/// Compare-and-swap of a refresh token. Applied only if the session is still active and its
/// refresh hash still equals `current_hash`.
#[derive(Clone, Debug)]
pub struct RefreshRotation {
    pub session_id: Uuid,
    pub current_hash: Vec<u8>,
    pub next_hash: Vec<u8>,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub last_ip: String,
    pub now: DateTime<Utc>,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert_user(&self, user: &User) -> Result<InsertUserOutcome>;

    /// Count one failed password check and apply `lockout` to the new count, atomically.
    /// Returns `None` if the user does not exist.
    async fn record_failed_login(
        &self,
        user_id: Uuid,
        lockout: &LockoutPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<FailedLogin>>;

    /// Returns `false` when the password changed since it was checked.
    async fn record_successful_login(&self, login: &SuccessfulLogin) -> Result<bool>;

    /// Returns `false` when the token is no longer live.
    async fn reset_password(&self, reset: &PasswordReset) -> Result<bool>;

    /// Activate a pending account and consume its verification token. Returns `false` when the
    /// token is no longer live or the account is not pending.
    async fn confirm_email(&self, user_id: Uuid, token: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Replace the email verification token. Returns `false` if the user does not exist.
    async fn set_email_verification(
        &self,
        user_id: Uuid,
        token: &VerificationToken,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Replace the password reset token. Returns `false` if the user does not exist.
    async fn set_password_reset(
        &self,
        user_id: Uuid,
        token: &VerificationToken,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Returns `false` if the user does not exist.
    async fn set_user_status(
        &self,
        user_id: Uuid,
        status: UserStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>>;

    /// `email` is expected to be normalized.
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn find_user_by_verification_token(&self, token: &str) -> Result<Option<User>>;

    async fn find_user_by_password_reset_token(&self, token: &str) -> Result<Option<User>>;

    async fn email_exists(&self, email: &str) -> Result<bool>;

    /// Clear expired verification and reset tokens in one pass.
    async fn clear_expired_tokens(&self, now: DateTime<Utc>) -> Result<TokenSweep>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns `false` when either token hash is already taken.
    async fn insert_session(&self, session: &Session) -> Result<bool>;

    async fn find_session_by_token_hash(&self, hash: &[u8]) -> Result<Option<Session>>;

    async fn find_session_by_refresh_hash(&self, hash: &[u8]) -> Result<Option<Session>>;

    /// Whether any earlier session of `user_id` carried this device fingerprint.
    async fn fingerprint_seen(&self, user_id: Uuid, fingerprint: &str) -> Result<bool>;

    /// Returns `false` when the swap lost a race or the session is no longer active.
    async fn rotate_refresh_token(&self, rotation: &RefreshRotation) -> Result<bool>;

    /// Move one active session to a terminal status. Returns `false` if it was not active.
    async fn close_session(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Close every active session of a user except `keep`, as one write.
    async fn close_user_sessions(
        &self,
        user_id: Uuid,
        keep: Option<Uuid>,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Expire every active session past either expiry, as one write.
    async fn expire_stale_sessions(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn load_role_graph(&self) -> Result<RoleGraph>;

    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<UserRole>>;

    async fn insert_role(&self, role: &Role) -> Result<()>;

    async fn insert_permission(&self, permission: &Permission) -> Result<()>;

    /// Attach `parent` above `child` after a cycle check made under the same lock or transaction.
    async fn attach_parent(&self, child: Uuid, parent: Uuid) -> Result<ParentUpdate>;

    async fn detach_parent(&self, child: Uuid) -> Result<bool>;

    /// Insert or replace the grant for `(role_id, permission_id)`.
    async fn grant_permission(&self, grant: &RolePermission) -> Result<()>;

    /// Insert or replace the assignment for `(user_id, role_id)`.
    async fn assign_role(&self, assignment: &UserRole) -> Result<()>;

    /// Soft revoke; the row stays for audit. Returns `false` if nothing active matched.
    async fn revoke_role(&self, user_id: Uuid, role_id: Uuid) -> Result<bool>;
}

/// The three stores a deployment runs with, usually backed by the same object.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub roles: Arc<dyn RoleStore>,
}

impl Stores {
    #[must_use]
    pub fn memory() -> Self {
        Self::from_backend(Arc::new(MemoryStore::new()))
    }

    #[must_use]
    pub fn postgres(store: PgStore) -> Self {
        Self::from_backend(Arc::new(store))
    }

    fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: UserStore + SessionStore + RoleStore + 'static,
    {
        Self {
            users: backend.clone(),
            sessions: backend.clone(),
            roles: backend,
        }
    }
}
