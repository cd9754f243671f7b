use tracing::{info, warn};

use super::types::{
    ClientContext, RegisterRequest, RegisterResponse, ResendVerificationResponse,
    VerifyEmailResponse,
};
use super::{logged, CredentialLifecycle};
use crate::credentials::error::{CredentialError, CredentialResult};
use crate::credentials::rate_limit::RateLimitAction;
use crate::credentials::token::{secure_token, VERIFICATION_TOKEN_BYTES};
use crate::credentials::validation::{
    normalize_email, normalize_phone, require_email, require_matching, require_name,
    require_strong_password,
};
use crate::email::{build_verify_url, EmailMessage};
use crate::model::{User, UserStatus, VerificationToken};
use crate::store::InsertUserOutcome;

impl CredentialLifecycle {
    /// Create an account in `PendingConfirmation` and queue the verification email.
    ///
    /// # Errors
    /// `RateLimitExceeded`, `EmailAlreadyExists` or `Validation`.
    pub async fn register(
        &self,
        request: RegisterRequest,
        client: &ClientContext,
    ) -> CredentialResult<RegisterResponse> {
        logged("register", self.register_inner(request, client).await)
    }

    async fn register_inner(
        &self,
        request: RegisterRequest,
        client: &ClientContext,
    ) -> CredentialResult<RegisterResponse> {
        self.throttle(RateLimitAction::Registration, &client.ip_address)?;

        let email = require_email(&request.email)?;
        if self.users.email_exists(&email).await? {
            return Err(CredentialError::EmailAlreadyExists { email });
        }

        require_strong_password("password", &request.password)?;
        require_matching(&request.password, &request.confirm_password)?;
        let first_name = require_name("first_name", &request.first_name)?;
        let last_name = require_name("last_name", &request.last_name)?;
        let phone_number = normalize_phone(request.phone_number.as_deref())?;

        let password_hash = self.hash_password(request.password).await?;
        let now = self.clock.now();
        let mut user = User::pending(
            email.clone(),
            password_hash,
            first_name,
            last_name,
            phone_number,
            now,
        );
        let token = secure_token(VERIFICATION_TOKEN_BYTES)?;
        let expires_at = now + self.config.email_token_ttl();
        user.set_email_verification(token, expires_at, now);

        // The existence check above is advisory; the unique index decides races.
        if self.users.insert_user(&user).await? == InsertUserOutcome::EmailTaken {
            return Err(CredentialError::EmailAlreadyExists { email });
        }

        info!(user_id = %user.id, ip = %client.ip_address, "User registered");
        if let Some(verification) = &user.email_verification {
            self.send_verification_email(&user, verification);
        }

        Ok(RegisterResponse {
            user_id: user.id,
            email: user.email,
            requires_verification: true,
        })
    }

    /// Consume an email verification token and activate the account.
    ///
    /// When `email` is given it must match the token owner.
    ///
    /// # Errors
    /// `RateLimitExceeded`, `InvalidVerificationToken`, `ExpiredVerificationToken`,
    /// `EmailAlreadyVerified` or `InvalidState`.
    pub async fn verify_email(
        &self,
        token: &str,
        email: Option<&str>,
        client: &ClientContext,
    ) -> CredentialResult<VerifyEmailResponse> {
        logged(
            "verify_email",
            self.verify_email_inner(token, email, client).await,
        )
    }

    async fn verify_email_inner(
        &self,
        token: &str,
        email: Option<&str>,
        client: &ClientContext,
    ) -> CredentialResult<VerifyEmailResponse> {
        self.ensure_allowed(RateLimitAction::EmailVerification, &client.ip_address)?;

        let token = token.trim();
        let email = email.map(normalize_email).filter(|email| !email.is_empty());
        if token.is_empty() {
            return Err(CredentialError::validation("token", "token is required"));
        }

        let Some(user) = self.users.find_user_by_verification_token(token).await? else {
            return Err(CredentialError::invalid_token(token, email.as_deref()));
        };
        if email.as_ref().is_some_and(|email| *email != user.email) {
            warn!(user_id = %user.id, "Verification token presented with a different email");
            return Err(CredentialError::invalid_token(token, email.as_deref()));
        }

        let now = self.clock.now();
        if !user.has_valid_email_verification(now) {
            return Err(CredentialError::expired_token(token, Some(&user.email)));
        }
        if user.is_email_verified {
            return Err(CredentialError::EmailAlreadyVerified {
                token: Some(token.to_string()),
                email: Some(user.email),
            });
        }
        if user.status != UserStatus::PendingConfirmation {
            return Err(CredentialError::InvalidState {
                message: format!("account is {} and cannot be activated", user.status),
            });
        }

        // Single use: of two concurrent redemptions only the first one finds the token live.
        if !self.users.confirm_email(user.id, token, now).await? {
            return Err(CredentialError::invalid_token(token, email.as_deref()));
        }
        self.rate_limiter
            .record_attempt(&client.ip_address, RateLimitAction::EmailVerification);

        info!(user_id = %user.id, "Email verified, account activated");
        Ok(VerifyEmailResponse {
            email: user.email,
            email_verified_at: now,
            account_activated: true,
        })
    }

    /// Resend the verification email, reusing the current token while it is valid.
    ///
    /// # Errors
    /// `RateLimitExceeded`, `UserNotFound` or `EmailAlreadyVerified`.
    pub async fn resend_verification(
        &self,
        email: &str,
        client: &ClientContext,
    ) -> CredentialResult<ResendVerificationResponse> {
        logged(
            "resend_verification",
            self.resend_verification_inner(email, client).await,
        )
    }

    async fn resend_verification_inner(
        &self,
        email: &str,
        client: &ClientContext,
    ) -> CredentialResult<ResendVerificationResponse> {
        self.ensure_allowed(RateLimitAction::ResendVerification, &client.ip_address)?;

        let email = normalize_email(email);
        let Some(user) = self.users.find_user_by_email(&email).await? else {
            return Err(CredentialError::UserNotFound { email });
        };
        if user.is_email_verified {
            return Err(CredentialError::EmailAlreadyVerified {
                token: None,
                email: Some(email),
            });
        }

        let now = self.clock.now();
        let live = user
            .email_verification
            .clone()
            .filter(|token| token.is_valid(now));
        let was_token_refreshed = live.is_none();
        let verification = match live {
            Some(token) => token,
            None => {
                let token = VerificationToken {
                    token: secure_token(VERIFICATION_TOKEN_BYTES)?,
                    expires_at: now + self.config.email_token_ttl(),
                };
                if !self.users.set_email_verification(user.id, &token, now).await? {
                    return Err(CredentialError::UserNotFound { email });
                }
                token
            }
        };
        let token_expires_at = verification.expires_at;

        self.send_verification_email(&user, &verification);
        self.rate_limiter
            .record_attempt(&client.ip_address, RateLimitAction::ResendVerification);

        let cooldown = self
            .rate_limiter
            .remaining_cooldown(&client.ip_address, RateLimitAction::ResendVerification);
        let next_resend_allowed_at = (now + self.config.resend_interval()).max(now + cooldown);

        info!(user_id = %user.id, was_token_refreshed, "Verification email resent");
        Ok(ResendVerificationResponse {
            token_expires_at,
            was_token_refreshed,
            next_resend_allowed_at,
        })
    }

    /// Queue the verification email. Failures are logged, the account already exists.
    fn send_verification_email(&self, user: &User, verification: &VerificationToken) {
        let url = build_verify_url(self.config.frontend_base_url(), &verification.token);
        let queued = EmailMessage::verification(
            &user.email,
            &user.full_name(),
            &url,
            verification.expires_at,
        )
        .and_then(|message| self.email.enqueue(message));
        if let Err(err) = queued {
            warn!(user_id = %user.id, "Failed to queue verification email: {err}");
        }
    }
}
