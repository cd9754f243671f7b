use tracing::{debug, info, warn};

use super::types::{ClientContext, ResetPasswordRequest, ResetPasswordResponse};
use super::{logged, CredentialLifecycle};
use crate::credentials::error::{CredentialError, CredentialResult};
use crate::credentials::rate_limit::RateLimitAction;
use crate::credentials::token::{secure_token, VERIFICATION_TOKEN_BYTES};
use crate::credentials::validation::{require_email, require_matching, require_strong_password};
use crate::email::{build_reset_url, EmailMessage};
use crate::model::{User, UserStatus, VerificationToken};
use crate::store::PasswordReset;

impl CredentialLifecycle {
    /// Issue a password reset token and queue the reset email.
    ///
    /// Unknown addresses succeed silently so the endpoint cannot be used to enumerate accounts.
    ///
    /// # Errors
    /// `RateLimitExceeded` or `Validation` for a malformed address.
    pub async fn request_password_reset(
        &self,
        email: &str,
        client: &ClientContext,
    ) -> CredentialResult<()> {
        logged(
            "request_password_reset",
            self.request_password_reset_inner(email, client).await,
        )
    }

    async fn request_password_reset_inner(
        &self,
        email: &str,
        client: &ClientContext,
    ) -> CredentialResult<()> {
        self.throttle(RateLimitAction::PasswordReset, &client.ip_address)?;

        let email = require_email(email)?;
        let user = self.users.find_user_by_email(&email).await?;
        let Some(user) = user.filter(|user| user.status != UserStatus::MarkedForDeletion) else {
            debug!(ip = %client.ip_address, "Password reset requested for unknown email");
            return Ok(());
        };

        let now = self.clock.now();
        let reset = VerificationToken {
            token: secure_token(VERIFICATION_TOKEN_BYTES)?,
            expires_at: now + self.config.password_reset_ttl(),
        };
        if !self.users.set_password_reset(user.id, &reset, now).await? {
            debug!(user_id = %user.id, "Password reset requested for a removed account");
            return Ok(());
        }

        info!(user_id = %user.id, "Password reset requested");
        self.send_reset_email(&user, &reset);
        Ok(())
    }

    /// Set a new password from a reset token. Clears the lockout and revokes every session.
    ///
    /// # Errors
    /// `RateLimitExceeded`, `InvalidVerificationToken`, `ExpiredVerificationToken` or
    /// `Validation`.
    pub async fn reset_password(
        &self,
        request: ResetPasswordRequest,
        client: &ClientContext,
    ) -> CredentialResult<ResetPasswordResponse> {
        logged(
            "reset_password",
            self.reset_password_inner(request, client).await,
        )
    }

    async fn reset_password_inner(
        &self,
        request: ResetPasswordRequest,
        client: &ClientContext,
    ) -> CredentialResult<ResetPasswordResponse> {
        self.throttle(RateLimitAction::PasswordReset, &client.ip_address)?;

        let token = request.token.trim();
        if token.is_empty() {
            return Err(CredentialError::validation("token", "token is required"));
        }
        let Some(user) = self.users.find_user_by_password_reset_token(token).await? else {
            return Err(CredentialError::invalid_token(token, None));
        };

        let now = self.clock.now();
        if !user.password_reset.as_ref().is_some_and(|reset| reset.is_valid(now)) {
            return Err(CredentialError::expired_token(token, Some(&user.email)));
        }

        require_strong_password("new_password", &request.new_password)?;
        require_matching(&request.new_password, &request.confirm_password)?;

        let password_hash = self.hash_password(request.new_password).await?;
        let changed_at = user.next_password_change(now);
        let reset = PasswordReset {
            user_id: user.id,
            token: token.to_string(),
            password_hash,
            changed_at,
            now,
        };
        // Single use: a concurrent reset with the same token that committed first wins.
        if !self.users.reset_password(&reset).await? {
            return Err(CredentialError::invalid_token(token, None));
        }

        let revoked_sessions = self.sessions.revoke_all(user.id).await?;
        info!(user_id = %user.id, revoked_sessions, "Password reset completed");
        Ok(ResetPasswordResponse {
            password_changed_at: changed_at,
            revoked_sessions,
        })
    }

    fn send_reset_email(&self, user: &User, reset: &VerificationToken) {
        let url = build_reset_url(self.config.frontend_base_url(), &reset.token);
        let queued = EmailMessage::password_reset(&user.email, &user.full_name(), &url, reset.expires_at)
            .and_then(|message| self.email.enqueue(message));
        if let Err(err) = queued {
            warn!(user_id = %user.id, "Failed to queue password reset email: {err}");
        }
    }
}
