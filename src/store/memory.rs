//! In-process store for development and tests.
//!
//! All tables sit behind one `RwLock`, so every multi-row operation is a single critical
//! section and readers never observe a half-applied batch.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    FailedLogin, InsertUserOutcome, ParentUpdate, PasswordReset, RefreshRotation, RoleStore,
    SessionStore, SuccessfulLogin, TokenSweep, UserStore,
};
use crate::credentials::lockout::LockoutPolicy;
use crate::credentials::permissions::RoleGraph;
use crate::model::{
    Permission, Role, RolePermission, Session, SessionStatus, User, UserRole, UserStatus,
    VerificationToken,
};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    sessions: HashMap<Uuid, Session>,
    roles: HashMap<Uuid, Role>,
    permissions: HashMap<Uuid, Permission>,
    role_permissions: Vec<RolePermission>,
    user_roles: Vec<UserRole>,
}

impl Tables {
    fn close(session: &mut Session, status: SessionStatus, now: DateTime<Utc>) {
        session.status = status;
        if status == SessionStatus::Revoked {
            session.revoked_at = Some(now);
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn insert_user(&self, user: &User) -> Result<InsertUserOutcome> {
        let mut tables = self.tables.write().await;
        if tables.users.values().any(|existing| existing.email == user.email) {
            return Ok(InsertUserOutcome::EmailTaken);
        }
        tables.users.insert(user.id, user.clone());
        Ok(InsertUserOutcome::Created)
    }

    async fn record_failed_login(
        &self,
        user_id: Uuid,
        lockout: &LockoutPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<FailedLogin>> {
        let mut tables = self.tables.write().await;
        Ok(tables.users.get_mut(&user_id).map(|user| {
            lockout.on_failed_login(user, now);
            FailedLogin {
                failed_attempts: user.failed_login_attempts,
                locked_until: user.locked_until,
            }
        }))
    }

    async fn record_successful_login(&self, login: &SuccessfulLogin) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(user) = tables
            .users
            .get_mut(&login.user_id)
            .filter(|user| user.password_changed_at == login.password_changed_at)
        else {
            return Ok(false);
        };
        user.failed_login_attempts = 0;
        user.locked_until = None;
        if user.status == UserStatus::Blocked {
            user.status = UserStatus::Active;
        }
        if let Some(hash) = &login.rehashed_password {
            user.password_hash.clone_from(hash);
        }
        user.last_login_at = Some(login.now);
        user.updated_at = login.now;
        Ok(true)
    }

    async fn reset_password(&self, reset: &PasswordReset) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(user) = tables.users.get_mut(&reset.user_id).filter(|user| {
            user.password_reset
                .as_ref()
                .is_some_and(|live| live.token == reset.token && live.is_valid(reset.now))
        }) else {
            return Ok(false);
        };
        user.apply_password_reset(reset.password_hash.clone(), reset.changed_at, reset.now);
        Ok(true)
    }

    async fn confirm_email(&self, user_id: Uuid, token: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(user) = tables.users.get_mut(&user_id).filter(|user| {
            user.status == UserStatus::PendingConfirmation
                && user
                    .email_verification
                    .as_ref()
                    .is_some_and(|live| live.token == token && live.is_valid(now))
        }) else {
            return Ok(false);
        };
        user.mark_email_verified(now);
        Ok(true)
    }

    async fn set_email_verification(
        &self,
        user_id: Uuid,
        token: &VerificationToken,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables.users.get_mut(&user_id).is_some_and(|user| {
            user.set_email_verification(token.token.clone(), token.expires_at, now);
            true
        }))
    }

    async fn set_password_reset(
        &self,
        user_id: Uuid,
        token: &VerificationToken,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables.users.get_mut(&user_id).is_some_and(|user| {
            user.set_password_reset(token.token.clone(), token.expires_at, now);
            true
        }))
    }

    async fn set_user_status(
        &self,
        user_id: Uuid,
        status: UserStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables.users.get_mut(&user_id).is_some_and(|user| {
            user.status = status;
            user.updated_at = now;
            true
        }))
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables.users.values().find(|user| user.email == email).cloned())
    }

    async fn find_user_by_verification_token(&self, token: &str) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .find(|user| {
                user.email_verification
                    .as_ref()
                    .is_some_and(|issued| issued.token == token)
            })
            .cloned())
    }

    async fn find_user_by_password_reset_token(&self, token: &str) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .find(|user| {
                user.password_reset
                    .as_ref()
                    .is_some_and(|issued| issued.token == token)
            })
            .cloned())
    }

    async fn email_exists(&self, email: &str) -> Result<bool> {
        let tables = self.tables.read().await;
        Ok(tables.users.values().any(|user| user.email == email))
    }

    async fn clear_expired_tokens(&self, now: DateTime<Utc>) -> Result<TokenSweep> {
        let mut tables = self.tables.write().await;
        let mut sweep = TokenSweep::default();
        for user in tables.users.values_mut() {
            let (email, reset) = user.clear_expired_tokens(now);
            sweep.email_verification += u64::from(email);
            sweep.password_reset += u64::from(reset);
        }
        Ok(sweep)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &Session) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let duplicate = tables.sessions.values().any(|existing| {
            existing.session_token_hash == session.session_token_hash
                || existing.refresh_token_hash == session.refresh_token_hash
        });
        if duplicate {
            return Ok(false);
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(true)
    }

    async fn find_session_by_token_hash(&self, hash: &[u8]) -> Result<Option<Session>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .values()
            .find(|session| session.session_token_hash == hash)
            .cloned())
    }

    async fn find_session_by_refresh_hash(&self, hash: &[u8]) -> Result<Option<Session>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .values()
            .find(|session| session.refresh_token_hash == hash)
            .cloned())
    }

    async fn fingerprint_seen(&self, user_id: Uuid, fingerprint: &str) -> Result<bool> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .values()
            .any(|session| session.user_id == user_id && session.device.fingerprint == fingerprint))
    }

    async fn rotate_refresh_token(&self, rotation: &RefreshRotation) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(session) = tables.sessions.get_mut(&rotation.session_id) else {
            return Ok(false);
        };
        if session.status != SessionStatus::Active || session.refresh_token_hash != rotation.current_hash {
            return Ok(false);
        }
        session.refresh_token_hash.clone_from(&rotation.next_hash);
        session.expires_at = rotation.expires_at;
        session.refresh_expires_at = rotation.refresh_expires_at;
        session.last_activity_at = rotation.now;
        session.last_ip.clone_from(&rotation.last_ip);
        Ok(true)
    }

    async fn close_session(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.sessions.get_mut(&session_id) {
            Some(session) if session.status == SessionStatus::Active => {
                Tables::close(session, status, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn close_user_sessions(
        &self,
        user_id: Uuid,
        keep: Option<Uuid>,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let mut closed = 0;
        for session in tables.sessions.values_mut() {
            if session.user_id == user_id
                && session.status == SessionStatus::Active
                && Some(session.id) != keep
            {
                Tables::close(session, status, now);
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn expire_stale_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let mut expired = 0;
        for session in tables.sessions.values_mut() {
            if session.status == SessionStatus::Active
                && (session.expires_at <= now || session.refresh_expires_at <= now)
            {
                session.status = SessionStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn load_role_graph(&self) -> Result<RoleGraph> {
        let tables = self.tables.read().await;
        Ok(RoleGraph::new(
            tables.roles.values().cloned().collect(),
            tables.permissions.values().cloned().collect(),
            tables.role_permissions.clone(),
        ))
    }

    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<UserRole>> {
        let tables = self.tables.read().await;
        Ok(tables
            .user_roles
            .iter()
            .filter(|assignment| assignment.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_role(&self, role: &Role) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables
            .roles
            .values()
            .any(|existing| existing.normalized_name == role.normalized_name)
        {
            anyhow::bail!("role {} already exists", role.name);
        }
        tables.roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn insert_permission(&self, permission: &Permission) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables
            .permissions
            .values()
            .any(|existing| existing.key() == permission.key())
        {
            anyhow::bail!("permission {} already exists", permission.name);
        }
        tables.permissions.insert(permission.id, permission.clone());
        Ok(())
    }

    async fn attach_parent(&self, child: Uuid, parent: Uuid) -> Result<ParentUpdate> {
        let mut tables = self.tables.write().await;
        let graph = RoleGraph::new(tables.roles.values().cloned().collect(), Vec::new(), Vec::new());
        if let Err(err) = graph.check_parent(child, parent) {
            return Ok(ParentUpdate::Rejected(err));
        }
        if let Some(role) = tables.roles.get_mut(&child) {
            role.parent_role_id = Some(parent);
        }
        Ok(ParentUpdate::Attached)
    }

    async fn detach_parent(&self, child: Uuid) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .roles
            .get_mut(&child)
            .and_then(|role| role.parent_role_id.take())
            .is_some())
    }

    async fn grant_permission(&self, grant: &RolePermission) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.role_permissions.retain(|existing| {
            !(existing.role_id == grant.role_id && existing.permission_id == grant.permission_id)
        });
        tables.role_permissions.push(grant.clone());
        Ok(())
    }

    async fn assign_role(&self, assignment: &UserRole) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.user_roles.retain(|existing| {
            !(existing.user_id == assignment.user_id && existing.role_id == assignment.role_id)
        });
        tables.user_roles.push(assignment.clone());
        Ok(())
    }

    async fn revoke_role(&self, user_id: Uuid, role_id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let mut revoked = false;
        for assignment in &mut tables.user_roles {
            if assignment.user_id == user_id && assignment.role_id == role_id && assignment.is_active {
                assignment.is_active = false;
                revoked = true;
            }
        }
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceInfo, LocationInfo, LoginMethod};
    use chrono::Duration;

    fn user(email: &str, now: DateTime<Utc>) -> User {
        User::pending(
            email.to_string(),
            "hash".to_string(),
            "Ada".to_string(),
            "Lovelace".to_string(),
            None,
            now,
        )
    }

    fn session(user_id: Uuid, seed: u8, now: DateTime<Utc>) -> Session {
        Session {
            id: Uuid::new_v4(),
            user_id,
            session_token_hash: vec![seed; 32],
            refresh_token_hash: vec![seed.wrapping_add(100); 32],
            status: SessionStatus::Active,
            expires_at: now + Duration::hours(24),
            refresh_expires_at: now + Duration::days(7),
            last_activity_at: now,
            device: DeviceInfo::from_user_agent("test-agent", None),
            location: LocationInfo::from_ip("127.0.0.1"),
            device_name: None,
            login_method: LoginMethod::Password,
            is_known_device: false,
            risk_score: 20,
            initial_ip: "127.0.0.1".to_string(),
            last_ip: "127.0.0.1".to_string(),
            created_at: now,
            revoked_at: None,
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_reported() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        assert_eq!(
            store.insert_user(&user("a@x.com", now)).await?,
            InsertUserOutcome::Created
        );
        assert_eq!(
            store.insert_user(&user("a@x.com", now)).await?,
            InsertUserOutcome::EmailTaken
        );
        assert!(store.email_exists("a@x.com").await?);
        Ok(())
    }

    #[tokio::test]
    async fn parallel_failures_all_count() -> Result<()> {
        let store = std::sync::Arc::new(MemoryStore::new());
        let now = Utc::now();
        let user = user("a@x.com", now);
        store.insert_user(&user).await?;

        let user_id = user.id;
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .record_failed_login(user_id, &LockoutPolicy::default(), now)
                    .await
            });
        }
        let mut counts = Vec::new();
        while let Some(outcome) = tasks.join_next().await {
            if let Some(failed) = outcome?? {
                counts.push(failed.failed_attempts);
            }
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=8).collect::<Vec<_>>());

        let stored = store
            .find_user_by_id(user.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("missing user"))?;
        assert_eq!(stored.failed_login_attempts, 8);
        assert_eq!(stored.locked_until, Some(now + Duration::minutes(16)));
        assert_eq!(stored.status, UserStatus::Blocked);
        assert!(store
            .record_failed_login(Uuid::new_v4(), &LockoutPolicy::default(), now)
            .await?
            .is_none());
        Ok(())
    }

    #[tokio::test]
    async fn success_is_refused_after_a_password_reset() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut user = user("a@x.com", now);
        user.set_password_reset("reset".to_string(), now + Duration::hours(1), now);
        user.failed_login_attempts = 3;
        store.insert_user(&user).await?;

        let seen = user.password_changed_at;
        let reset = PasswordReset {
            user_id: user.id,
            token: "reset".to_string(),
            password_hash: "new-hash".to_string(),
            changed_at: user.next_password_change(now),
            now,
        };
        assert!(store.reset_password(&reset).await?);
        // The token is consumed by the first reset.
        assert!(!store.reset_password(&reset).await?);

        let login = SuccessfulLogin {
            user_id: user.id,
            password_changed_at: seen,
            rehashed_password: Some("old-password-rehashed".to_string()),
            now,
        };
        assert!(!store.record_successful_login(&login).await?);

        let stored = store
            .find_user_by_id(user.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("missing user"))?;
        assert_eq!(stored.password_hash, "new-hash");
        assert_eq!(stored.failed_login_attempts, 0);
        assert!(stored.last_login_at.is_none());

        let login = SuccessfulLogin {
            password_changed_at: stored.password_changed_at,
            rehashed_password: None,
            ..login
        };
        assert!(store.record_successful_login(&login).await?);
        Ok(())
    }

    #[tokio::test]
    async fn email_confirmation_consumes_the_token() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut user = user("a@x.com", now);
        user.set_email_verification("verify".to_string(), now + Duration::hours(24), now);
        store.insert_user(&user).await?;

        assert!(!store.confirm_email(user.id, "other", now).await?);
        assert!(store.confirm_email(user.id, "verify", now).await?);
        assert!(!store.confirm_email(user.id, "verify", now).await?);

        let stored = store
            .find_user_by_id(user.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("missing user"))?;
        assert!(stored.is_email_verified);
        assert_eq!(stored.status, UserStatus::Active);
        Ok(())
    }

    #[tokio::test]
    async fn rotation_is_compare_and_swap() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let session = session(Uuid::new_v4(), 1, now);
        assert!(store.insert_session(&session).await?);
        assert!(!store.insert_session(&session).await?);

        let rotation = RefreshRotation {
            session_id: session.id,
            current_hash: session.refresh_token_hash.clone(),
            next_hash: vec![9; 32],
            expires_at: now + Duration::hours(24),
            refresh_expires_at: now + Duration::days(7),
            last_ip: "10.0.0.1".to_string(),
            now,
        };
        assert!(store.rotate_refresh_token(&rotation).await?);
        assert!(!store.rotate_refresh_token(&rotation).await?);
        assert!(store
            .find_session_by_refresh_hash(&session.refresh_token_hash)
            .await?
            .is_none());
        Ok(())
    }

    #[tokio::test]
    async fn close_user_sessions_keeps_current() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let user_id = Uuid::new_v4();
        let keep = session(user_id, 1, now);
        store.insert_session(&keep).await?;
        store.insert_session(&session(user_id, 2, now)).await?;
        store.insert_session(&session(user_id, 3, now)).await?;
        store.insert_session(&session(Uuid::new_v4(), 4, now)).await?;

        let closed = store
            .close_user_sessions(user_id, Some(keep.id), SessionStatus::Revoked, now)
            .await?;
        assert_eq!(closed, 2);
        let kept = store.find_session_by_token_hash(&keep.session_token_hash).await?;
        assert_eq!(kept.map(|s| s.status), Some(SessionStatus::Active));

        // Closing again touches nothing.
        assert_eq!(
            store
                .close_user_sessions(user_id, Some(keep.id), SessionStatus::Revoked, now)
                .await?,
            0
        );
        Ok(())
    }

    #[tokio::test]
    async fn attach_parent_rejects_cycle_without_mutation() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = Role::new("A", now);
        let b = Role::new("B", now);
        store.insert_role(&a).await?;
        store.insert_role(&b).await?;

        assert!(matches!(
            store.attach_parent(b.id, a.id).await?,
            ParentUpdate::Attached
        ));
        assert!(matches!(
            store.attach_parent(a.id, b.id).await?,
            ParentUpdate::Rejected(_)
        ));
        let graph = store.load_role_graph().await?;
        assert_eq!(graph.role(a.id).and_then(|role| role.parent_role_id), None);
        assert_eq!(graph.role(b.id).and_then(|role| role.parent_role_id), Some(a.id));
        Ok(())
    }
}
