//! Session issuance, refresh-token rotation and revocation.
//!
//! `Active` is the only live state. `Expired`, `Revoked` and `Invalidated` are terminal and
//! closing an already closed session is a no-op.

use anyhow::{Context, Result};
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::clock::Clock;
use super::error::{CredentialError, CredentialResult};
use super::token::{hash_token, secure_token, SESSION_TOKEN_BYTES};
use crate::model::{
    DeviceInfo, IssuedSession, LocationInfo, LoginMethod, Session, SessionStatus, User,
};
use crate::store::{RefreshRotation, SessionStore};

pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;
pub const DEFAULT_REFRESH_TTL_DAYS: i64 = 7;

const UNKNOWN_DEVICE_RISK: u32 = 20;
const FAILED_ATTEMPT_RISK: u32 = 5;
const MAX_RISK: u32 = 100;
const TOKEN_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    session_ttl: Duration,
    refresh_ttl: Duration,
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            session_ttl: Duration::hours(DEFAULT_SESSION_TTL_HOURS),
            refresh_ttl: Duration::days(DEFAULT_REFRESH_TTL_DAYS),
        }
    }

    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a login came from.
#[derive(Clone, Debug)]
pub struct SessionContext {
    pub device: DeviceInfo,
    pub location: LocationInfo,
    pub login_method: LoginMethod,
    pub device_name: Option<String>,
    /// Failed attempts on the account before this login succeeded.
    pub prior_failed_attempts: u32,
}

/// Result of a refresh. The session token is not rotated; callers keep the one they hold.
#[derive(Clone, Debug)]
pub struct RefreshedSession {
    pub session: Session,
    pub refresh_token: String,
}

/// Initial risk: +20 for an unseen device, +5 per earlier failure, capped at 100.
#[must_use]
pub fn risk_score(is_known_device: bool, prior_failed_attempts: u32) -> u8 {
    let mut score = if is_known_device { 0 } else { UNKNOWN_DEVICE_RISK };
    score = score.saturating_add(prior_failed_attempts.saturating_mul(FAILED_ATTEMPT_RISK));
    u8::try_from(score.min(MAX_RISK)).unwrap_or(u8::MAX)
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>, config: SessionConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> SessionConfig {
        self.config
    }

    /// Open a session for `user` and return it with its raw tokens.
    ///
    /// # Errors
    /// Returns an error if token generation or storage fails.
    pub async fn create_session(&self, user: &User, context: SessionContext) -> Result<IssuedSession> {
        let now = self.clock.now();
        let is_known_device = self
            .store
            .fingerprint_seen(user.id, &context.device.fingerprint)
            .await?;
        let risk_score = risk_score(is_known_device, context.prior_failed_attempts);

        for _ in 0..TOKEN_ATTEMPTS {
            let session_token = secure_token(SESSION_TOKEN_BYTES)?;
            let refresh_token = secure_token(SESSION_TOKEN_BYTES)?;
            let session = Session {
                id: Uuid::now_v7(),
                user_id: user.id,
                session_token_hash: hash_token(&session_token),
                refresh_token_hash: hash_token(&refresh_token),
                status: SessionStatus::Active,
                expires_at: now + self.config.session_ttl,
                refresh_expires_at: now + self.config.refresh_ttl,
                last_activity_at: now,
                device: context.device.clone(),
                location: context.location.clone(),
                device_name: context.device_name.clone(),
                login_method: context.login_method,
                is_known_device,
                risk_score,
                initial_ip: context.location.ip_address.clone(),
                last_ip: context.location.ip_address.clone(),
                created_at: now,
                revoked_at: None,
            };

            if self.store.insert_session(&session).await? {
                debug!(
                    session_id = %session.id,
                    user_id = %user.id,
                    known_device = is_known_device,
                    risk_score,
                    "Session created"
                );
                return Ok(IssuedSession {
                    session,
                    session_token,
                    refresh_token,
                });
            }
        }

        Err(anyhow::anyhow!("failed to create unique session token"))
    }

    /// Rotate the refresh token. The old value stops working even if the caller never
    /// receives the new one.
    ///
    /// # Errors
    /// `InvalidVerificationToken` if no live session matches, `ExpiredVerificationToken` if the
    /// refresh window has passed (the session is expired as a side effect).
    pub async fn refresh(
        &self,
        refresh_token: &str,
        client_ip: &str,
    ) -> CredentialResult<RefreshedSession> {
        let now = self.clock.now();
        let current_hash = hash_token(refresh_token);
        let Some(session) = self.store.find_session_by_refresh_hash(&current_hash).await? else {
            return Err(CredentialError::invalid_token(refresh_token, None));
        };

        if session.status != SessionStatus::Active {
            return Err(CredentialError::invalid_token(refresh_token, None));
        }

        if now >= session.refresh_expires_at {
            self.store
                .close_session(session.id, SessionStatus::Expired, now)
                .await?;
            info!(session_id = %session.id, "Refresh token expired, session closed");
            return Err(CredentialError::expired_token(refresh_token, None));
        }

        let next_refresh = secure_token(SESSION_TOKEN_BYTES)?;
        let rotation = RefreshRotation {
            session_id: session.id,
            current_hash,
            next_hash: hash_token(&next_refresh),
            expires_at: now + self.config.session_ttl,
            refresh_expires_at: now + self.config.refresh_ttl,
            last_ip: client_ip.to_string(),
            now,
        };

        if !self.store.rotate_refresh_token(&rotation).await? {
            warn!(session_id = %session.id, "Refresh token rotation lost a race");
            return Err(CredentialError::invalid_token(refresh_token, None));
        }

        let Some(session) = self
            .store
            .find_session_by_refresh_hash(&rotation.next_hash)
            .await?
        else {
            return Err(CredentialError::invalid_token(refresh_token, None));
        };

        Ok(RefreshedSession {
            session,
            refresh_token: next_refresh,
        })
    }

    /// Look up a session by its raw token, whatever its state.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn find_by_token(&self, session_token: &str) -> Result<Option<Session>> {
        self.store
            .find_session_by_token_hash(&hash_token(session_token))
            .await
    }

    /// Like [`Self::find_by_token`] but only returns sessions that are active and unexpired.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn find_usable(&self, session_token: &str) -> Result<Option<Session>> {
        let now = self.clock.now();
        Ok(self
            .find_by_token(session_token)
            .await?
            .filter(|session| session.is_usable(now)))
    }

    /// Returns `false` if the session is unknown or already closed.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn revoke(&self, session_token: &str) -> Result<bool> {
        let Some(session) = self.find_by_token(session_token).await? else {
            return Ok(false);
        };
        self.close(session.id, SessionStatus::Revoked).await
    }

    /// Close one session by id with any terminal status.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn close(&self, session_id: Uuid, status: SessionStatus) -> Result<bool> {
        self.store
            .close_session(session_id, status, self.clock.now())
            .await
    }

    /// # Errors
    /// Returns an error if the store fails.
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<u64> {
        let revoked = self
            .store
            .close_user_sessions(user_id, None, SessionStatus::Revoked, self.clock.now())
            .await
            .context("failed to revoke user sessions")?;
        info!(user_id = %user_id, revoked, "Revoked all sessions");
        Ok(revoked)
    }

    /// Revoke every active session of `user_id` except the one `keep_token` belongs to.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn revoke_all_except(&self, user_id: Uuid, keep_token: &str) -> Result<u64> {
        let keep = self
            .find_by_token(keep_token)
            .await?
            .filter(|session| session.user_id == user_id)
            .map(|session| session.id);
        let revoked = self
            .store
            .close_user_sessions(user_id, keep, SessionStatus::Revoked, self.clock.now())
            .await
            .context("failed to revoke other sessions")?;
        info!(user_id = %user_id, revoked, "Revoked other sessions");
        Ok(revoked)
    }

    /// Expire every active session past either expiry.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        self.store
            .expire_stale_sessions(self.clock.now())
            .await
            .context("failed to expire stale sessions")
    }
}
