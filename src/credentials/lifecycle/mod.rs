//! Credential lifecycle orchestrator.
//!
//! Every public operation returns a typed [`CredentialError`] for expected outcomes. Storage and
//! other infrastructure failures surface as `CredentialError::Internal`, logged once here with
//! the operation name and rendered generically by the transport.

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::error::{CredentialError, CredentialResult};
use super::hasher::CredentialHasher;
use super::lockout::LockoutPolicy;
use super::permissions::EffectiveAccess;
use super::rate_limit::{
    MemoryAttemptStore, RateLimitAction, RateLimitDecision, RateLimitPolicy, RateLimiter,
    SlidingWindowRateLimiter,
};
use super::roles::RoleDirectory;
use super::session::{SessionConfig, SessionManager};
use super::token::{AccessTokenClaims, AccessTokenSigner, SignedAccessToken, SubjectClaims, TokenError};
use crate::email::EmailDispatcher;
use crate::model::User;
use crate::store::{Stores, TokenSweep, UserStore};

mod config;
mod login;
mod password;
mod registration;
mod types;

pub use config::{
    AuthConfig, DEFAULT_ACCESS_TOKEN_TTL_SECONDS, DEFAULT_EMAIL_TOKEN_TTL_SECONDS,
    DEFAULT_FRONTEND_BASE_URL, DEFAULT_PASSWORD_RESET_TTL_SECONDS, DEFAULT_RESEND_INTERVAL_SECONDS,
};
pub use types::{
    ClientContext, LoginRequest, LoginResponse, LogoutAllResponse, LogoutResponse,
    RefreshResponse, RegisterRequest, RegisterResponse, ResendVerificationResponse,
    ResetPasswordRequest, ResetPasswordResponse, SessionSummary, UserSummary,
    VerifyEmailResponse,
};

pub const TOKEN_TYPE_BEARER: &str = "Bearer";

pub struct CredentialLifecycleBuilder {
    stores: Stores,
    signer: AccessTokenSigner,
    email: EmailDispatcher,
    clock: Arc<dyn Clock>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    lockout: LockoutPolicy,
    session_config: SessionConfig,
    config: AuthConfig,
}

impl CredentialLifecycleBuilder {
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    #[must_use]
    pub fn with_lockout(mut self, lockout: LockoutPolicy) -> Self {
        self.lockout = lockout;
        self
    }

    #[must_use]
    pub fn with_session_config(mut self, session_config: SessionConfig) -> Self {
        self.session_config = session_config;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: AuthConfig) -> Self {
        self.config = config;
        self
    }

    /// # Errors
    /// Returns an error if the configured hash cost is rejected.
    pub fn build(self) -> Result<CredentialLifecycle> {
        let hasher = CredentialHasher::new(self.config.hash_cost())?;
        let rate_limiter = self.rate_limiter.unwrap_or_else(|| {
            Arc::new(SlidingWindowRateLimiter::new(
                RateLimitPolicy::default(),
                Arc::new(MemoryAttemptStore::new()),
                self.clock.clone(),
            ))
        });
        Ok(CredentialLifecycle {
            users: self.stores.users.clone(),
            sessions: SessionManager::new(
                self.stores.sessions.clone(),
                self.clock.clone(),
                self.session_config,
            ),
            roles: RoleDirectory::new(self.stores.roles.clone(), self.clock.clone()),
            rate_limiter,
            lockout: self.lockout,
            hasher,
            signer: self.signer,
            email: self.email,
            clock: self.clock,
            config: self.config,
        })
    }
}

pub struct CredentialLifecycle {
    users: Arc<dyn UserStore>,
    sessions: SessionManager,
    roles: RoleDirectory,
    rate_limiter: Arc<dyn RateLimiter>,
    lockout: LockoutPolicy,
    hasher: CredentialHasher,
    signer: AccessTokenSigner,
    email: EmailDispatcher,
    clock: Arc<dyn Clock>,
    config: AuthConfig,
}

impl CredentialLifecycle {
    #[must_use]
    pub fn builder(
        stores: Stores,
        signer: AccessTokenSigner,
        email: EmailDispatcher,
    ) -> CredentialLifecycleBuilder {
        CredentialLifecycleBuilder {
            stores,
            signer,
            email,
            clock: Arc::new(SystemClock),
            rate_limiter: None,
            lockout: LockoutPolicy::default(),
            session_config: SessionConfig::default(),
            config: AuthConfig::default(),
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    #[must_use]
    pub fn roles(&self) -> &RoleDirectory {
        &self.roles
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Store health for the liveness endpoint.
    ///
    /// # Errors
    /// Returns an error if the user store cannot be reached.
    pub async fn ping(&self) -> Result<()> {
        self.users.ping().await
    }

    /// Verify a bearer token issued by [`Self::login`] or [`Self::refresh_token`].
    ///
    /// # Errors
    /// Returns the failing check.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessTokenClaims, TokenError> {
        self.signer.verify(token, self.clock.now())
    }

    /// Mark every session past its expiry as expired.
    ///
    /// # Errors
    /// Returns an error if the session store fails.
    pub async fn cleanup_expired_sessions(&self) -> Result<u64> {
        self.sessions.cleanup_expired().await
    }

    /// Drop expired email verification and password reset tokens.
    ///
    /// # Errors
    /// Returns an error if the user store fails.
    pub async fn cleanup_expired_tokens(&self) -> Result<TokenSweep> {
        self.users
            .clear_expired_tokens(self.clock.now())
            .await
            .context("failed to clear expired tokens")
    }

    /// Fail with `RateLimitExceeded` when `subject` is over the limit for `action`.
    fn ensure_allowed(&self, action: RateLimitAction, subject: &str) -> CredentialResult<()> {
        match self.rate_limiter.check(subject, action) {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Limited { retry_after } => {
                warn!(
                    action = %action,
                    subject = %subject,
                    retry_after_secs = retry_after.num_seconds(),
                    "Rate limit exceeded"
                );
                Err(CredentialError::RateLimitExceeded {
                    action,
                    retry_after,
                })
            }
        }
    }

    /// Check and record in one go, for actions that count every attempt.
    fn throttle(&self, action: RateLimitAction, subject: &str) -> CredentialResult<()> {
        self.ensure_allowed(action, subject)?;
        self.rate_limiter.record_attempt(subject, action);
        Ok(())
    }

    /// Argon2 is CPU and memory heavy, keep it off the async workers.
    async fn hash_password(&self, password: SecretString) -> CredentialResult<String> {
        let hasher = self.hasher.clone();
        let hash = tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .context("password hashing task failed")??;
        Ok(hash)
    }

    async fn verify_password(&self, password: SecretString, hash: String) -> bool {
        let hasher = self.hasher.clone();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .unwrap_or_else(|err| {
                error!("password verification task failed: {err}");
                false
            })
    }

    /// Sign an access token from the user's current roles and permissions.
    async fn issue_access_token(
        &self,
        user: &User,
        session_id: Uuid,
    ) -> CredentialResult<(SignedAccessToken, EffectiveAccess)> {
        let access = self.roles.effective_access(user.id).await?;
        let subject = SubjectClaims {
            user_id: user.id,
            email: user.email.clone(),
            name: user.full_name(),
            session_id,
            roles: access.roles.clone(),
            permissions: access.permission_names(),
        };
        let signed = self
            .signer
            .sign(&subject, self.config.access_token_ttl(), self.clock.now())
            .context("failed to sign access token")?;
        Ok((signed, access))
    }
}

/// Log the outcome of an operation. Internal failures get the full error chain, everything
/// else is an expected result.
fn logged<T>(operation: &str, result: CredentialResult<T>) -> CredentialResult<T> {
    match &result {
        Err(CredentialError::Internal(err)) => {
            error!(operation, "credential operation failed: {err:#}");
        }
        Err(err) => debug!(operation, "credential operation rejected: {err}"),
        Ok(_) => {}
    }
    result
}
