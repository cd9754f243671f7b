use tracing::{info, warn};
use uuid::Uuid;

use super::types::{
    ClientContext, LoginRequest, LoginResponse, LogoutAllResponse, LogoutResponse,
    RefreshResponse, SessionSummary, UserSummary,
};
use super::{logged, CredentialLifecycle, TOKEN_TYPE_BEARER};
use crate::credentials::error::{CredentialError, CredentialResult};
use crate::credentials::rate_limit::RateLimitAction;
use crate::credentials::session::SessionContext;
use crate::credentials::validation::normalize_email;
use crate::model::{DeviceInfo, LocationInfo, LoginMethod, UserStatus};
use crate::store::SuccessfulLogin;

impl CredentialLifecycle {
    /// Authenticate with email and password and open a session.
    ///
    /// # Errors
    /// `RateLimitExceeded`, `UserNotFound`, `AccountLocked`, `EmailNotVerified` or
    /// `InvalidCredentials`.
    pub async fn login(
        &self,
        request: LoginRequest,
        client: &ClientContext,
    ) -> CredentialResult<LoginResponse> {
        logged("login", self.login_inner(request, client).await)
    }

    async fn login_inner(
        &self,
        request: LoginRequest,
        client: &ClientContext,
    ) -> CredentialResult<LoginResponse> {
        self.throttle(RateLimitAction::Login, &client.ip_address)?;

        let email = normalize_email(&request.email);
        let user = self.users.find_user_by_email(&email).await?;
        let Some(mut user) = user.filter(|user| {
            !matches!(
                user.status,
                UserStatus::Inactive | UserStatus::MarkedForDeletion
            )
        }) else {
            warn!(ip = %client.ip_address, "Login attempt for unknown email");
            return Err(CredentialError::UserNotFound { email });
        };

        let now = self.clock.now();
        if let Some(locked_until) = user.locked_until.filter(|until| *until > now) {
            warn!(user_id = %user.id, %locked_until, "Login attempt on locked account");
            return Err(CredentialError::AccountLocked {
                email,
                locked_until,
                remaining: locked_until - now,
            });
        }

        if !user.is_email_verified {
            return Err(CredentialError::EmailNotVerified { email });
        }

        // Marks the password being checked. A reset that lands while Argon2 runs moves it.
        let checked_password = user.password_changed_at;
        let verified = self
            .verify_password(request.password.clone(), user.password_hash.clone())
            .await;
        if !verified {
            let Some(failed) = self
                .users
                .record_failed_login(user.id, &self.lockout, now)
                .await?
            else {
                return Err(CredentialError::UserNotFound { email });
            };
            warn!(
                user_id = %user.id,
                failed_attempts = failed.failed_attempts,
                locked = failed.locked_until.is_some(),
                "Invalid credentials"
            );
            return Err(CredentialError::InvalidCredentials {
                email,
                remaining_attempts: self.lockout.remaining_attempts(failed.failed_attempts),
            });
        }

        let rehashed_password = if self
            .hasher
            .needs_rehash(&user.password_hash, self.config.hash_cost())
        {
            Some(self.hash_password(request.password).await?)
        } else {
            None
        };
        let upgraded = rehashed_password.is_some();
        let applied = self
            .users
            .record_successful_login(&SuccessfulLogin {
                user_id: user.id,
                password_changed_at: checked_password,
                rehashed_password,
                now,
            })
            .await?;
        if !applied {
            return Err(self.replaced_password(user.id, email).await?);
        }
        if upgraded {
            info!(user_id = %user.id, "Password hash upgraded to current cost");
        }
        let prior_failed_attempts = user.failed_login_attempts;
        self.lockout.on_successful_login(&mut user, now);

        let issued = self
            .sessions
            .create_session(
                &user,
                SessionContext {
                    device: DeviceInfo::from_user_agent(&client.user_agent, None),
                    location: LocationInfo::from_ip(&client.ip_address),
                    login_method: LoginMethod::Password,
                    device_name: request
                        .device_name
                        .map(|name| name.trim().to_string())
                        .filter(|name| !name.is_empty()),
                    prior_failed_attempts,
                },
            )
            .await?;

        // A reset committed between the guarded write and the insert has already revoked every
        // session of the user; this one must not outlive it.
        let current = self.users.find_user_by_id(user.id).await?;
        if current.map(|current| current.password_changed_at) != Some(checked_password) {
            self.sessions.revoke(&issued.session_token).await?;
            return Err(self.replaced_password(user.id, email).await?);
        }

        let (access_token, access) = self.issue_access_token(&user, issued.session.id).await?;

        info!(
            user_id = %user.id,
            session_id = %issued.session.id,
            ip = %client.ip_address,
            remember_me = request.remember_me,
            "Login succeeded"
        );

        Ok(LoginResponse {
            access_token: access_token.token,
            refresh_token: issued.refresh_token,
            token_type: TOKEN_TYPE_BEARER.to_string(),
            expires_in: (access_token.expires_at - now).num_seconds(),
            user: UserSummary::new(&user, access.roles.clone(), access.permission_names()),
            session: SessionSummary::new(&issued.session, issued.session_token),
        })
    }

    /// Rotate a refresh token and reissue the access token from current permissions.
    ///
    /// # Errors
    /// `RateLimitExceeded`, `InvalidVerificationToken`, `ExpiredVerificationToken` or
    /// `UserNotFound` when the owner is no longer active (all of their sessions are revoked).
    pub async fn refresh_token(
        &self,
        refresh_token: &str,
        client: &ClientContext,
    ) -> CredentialResult<RefreshResponse> {
        logged(
            "refresh_token",
            self.refresh_token_inner(refresh_token, client).await,
        )
    }

    async fn refresh_token_inner(
        &self,
        refresh_token: &str,
        client: &ClientContext,
    ) -> CredentialResult<RefreshResponse> {
        self.throttle(RateLimitAction::RefreshToken, &client.ip_address)?;

        let refreshed = self
            .sessions
            .refresh(refresh_token, &client.ip_address)
            .await?;
        let session = refreshed.session;
        let now = self.clock.now();

        let user = self.users.find_user_by_id(session.user_id).await?;
        let user = match user {
            Some(user) if user.status == UserStatus::Active && !user.is_locked(now) => user,
            other => {
                let revoked = self.sessions.revoke_all(session.user_id).await?;
                warn!(
                    user_id = %session.user_id,
                    revoked,
                    "Refresh for inactive or locked account, sessions revoked"
                );
                return Err(CredentialError::UserNotFound {
                    email: other.map(|user| user.email).unwrap_or_default(),
                });
            }
        };

        let (access_token, _) = self.issue_access_token(&user, session.id).await?;
        Ok(RefreshResponse {
            access_token: access_token.token,
            refresh_token: refreshed.refresh_token,
            token_type: TOKEN_TYPE_BEARER.to_string(),
            expires_in: (access_token.expires_at - now).num_seconds(),
            expires_at: access_token.expires_at,
            refresh_expires_at: session.refresh_expires_at,
        })
    }

    /// Revoke the session behind `session_token`. Unknown or already closed sessions report
    /// `success = false` without failing.
    ///
    /// # Errors
    /// Only internal failures.
    pub async fn logout(&self, session_token: &str) -> CredentialResult<LogoutResponse> {
        logged("logout", self.logout_inner(session_token).await)
    }

    async fn logout_inner(&self, session_token: &str) -> CredentialResult<LogoutResponse> {
        if session_token.trim().is_empty() {
            return Err(CredentialError::validation(
                "session_token",
                "session token is required",
            ));
        }

        let Some(session) = self.sessions.find_by_token(session_token).await? else {
            return Ok(LogoutResponse {
                success: false,
                message: "Session not found".to_string(),
            });
        };
        if session.status.is_terminal() {
            return Ok(LogoutResponse {
                success: false,
                message: "Session already closed".to_string(),
            });
        }

        let closed = self.sessions.revoke(session_token).await?;
        if closed {
            info!(session_id = %session.id, user_id = %session.user_id, "Logged out");
        }
        Ok(LogoutResponse {
            success: closed,
            message: if closed {
                "Logged out".to_string()
            } else {
                "Session already closed".to_string()
            },
        })
    }

    /// Revoke every other session of the caller in one batch. The current session stays open.
    ///
    /// # Errors
    /// Only internal failures.
    pub async fn logout_all_devices(
        &self,
        session_token: &str,
    ) -> CredentialResult<LogoutAllResponse> {
        logged(
            "logout_all_devices",
            self.logout_all_devices_inner(session_token).await,
        )
    }

    async fn logout_all_devices_inner(
        &self,
        session_token: &str,
    ) -> CredentialResult<LogoutAllResponse> {
        if session_token.trim().is_empty() {
            return Err(CredentialError::validation(
                "session_token",
                "session token is required",
            ));
        }

        let Some(session) = self.sessions.find_usable(session_token).await? else {
            return Ok(LogoutAllResponse {
                success: false,
                revoked_sessions: 0,
                message: "Session not found or already closed".to_string(),
            });
        };

        let revoked = self
            .sessions
            .revoke_all_except(session.user_id, session_token)
            .await?;
        Ok(LogoutAllResponse {
            success: true,
            revoked_sessions: revoked,
            message: format!("Revoked {revoked} other sessions"),
        })
    }

    /// Refuse a login whose password was replaced while it was being checked.
    async fn replaced_password(
        &self,
        user_id: Uuid,
        email: String,
    ) -> CredentialResult<CredentialError> {
        let failed_attempts = self
            .users
            .find_user_by_id(user_id)
            .await?
            .map_or(0, |user| user.failed_login_attempts);
        warn!(%user_id, "Password changed during login, no session issued");
        Ok(CredentialError::InvalidCredentials {
            email,
            remaining_attempts: self.lockout.remaining_attempts(failed_attempts),
        })
    }
}
