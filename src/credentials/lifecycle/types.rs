use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::model::{Session, User};

/// Caller details resolved by the transport.
#[derive(Clone, Debug)]
pub struct ClientContext {
    pub ip_address: String,
    pub user_agent: String,
}

impl ClientContext {
    #[must_use]
    pub fn new(ip_address: &str, user_agent: &str) -> Self {
        Self {
            ip_address: ip_address.to_string(),
            user_agent: user_agent.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RegisterRequest {
    pub email: String,
    pub password: SecretString,
    pub confirm_password: SecretString,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: Option<String>,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub email: String,
    pub requires_verification: bool,
}

#[derive(Clone, Debug)]
pub struct LoginRequest {
    pub email: String,
    pub password: SecretString,
    pub remember_me: bool,
    pub device_name: Option<String>,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct UserSummary {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub status: String,
    pub is_email_verified: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

impl UserSummary {
    pub(crate) fn new(user: &User, roles: Vec<String>, permissions: Vec<String>) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            status: user.status.to_string(),
            is_email_verified: user.is_email_verified,
            last_login_at: user.last_login_at,
            roles,
            permissions,
        }
    }
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct SessionSummary {
    pub session_id: Uuid,
    /// Opaque token used for logout.
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
    pub device: String,
    pub location: String,
    pub is_known_device: bool,
}

impl SessionSummary {
    pub(crate) fn new(session: &Session, session_token: String) -> Self {
        Self {
            session_id: session.id,
            session_token,
            expires_at: session.expires_at,
            device: session
                .device_name
                .clone()
                .unwrap_or_else(|| session.device.display_name()),
            location: session.location.display(),
            is_known_device: session.is_known_device,
        }
    }
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    pub user: UserSummary,
    pub session: SessionSummary,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    /// Access token expiry.
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct LogoutResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct LogoutAllResponse {
    pub success: bool,
    pub revoked_sessions: u64,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct VerifyEmailResponse {
    pub email: String,
    pub email_verified_at: DateTime<Utc>,
    pub account_activated: bool,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct ResendVerificationResponse {
    pub token_expires_at: DateTime<Utc>,
    pub was_token_refreshed: bool,
    pub next_resend_allowed_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: SecretString,
    pub confirm_password: SecretString,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct ResetPasswordResponse {
    pub password_changed_at: DateTime<Utc>,
    pub revoked_sessions: u64,
}
