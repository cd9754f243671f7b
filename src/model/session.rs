use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::device::{DeviceInfo, LocationInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Expired,
    Revoked,
    Invalidated,
}

impl SessionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::Invalidated => "invalidated",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "revoked" => Ok(Self::Revoked),
            "invalidated" => Ok(Self::Invalidated),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginMethod {
    Password,
    GoogleOauth,
    MicrosoftOauth,
    GithubOauth,
    Saml,
    Mfa,
    ApiKey,
}

impl LoginMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::GoogleOauth => "google_oauth",
            Self::MicrosoftOauth => "microsoft_oauth",
            Self::GithubOauth => "github_oauth",
            Self::Saml => "saml",
            Self::Mfa => "mfa",
            Self::ApiKey => "api_key",
        }
    }

    /// Stored values this build does not know fall back to `Password`.
    #[must_use]
    pub fn parse_lossy(value: &str) -> Self {
        match value {
            "google_oauth" => Self::GoogleOauth,
            "microsoft_oauth" => Self::MicrosoftOauth,
            "github_oauth" => Self::GithubOauth,
            "saml" => Self::Saml,
            "mfa" => Self::Mfa,
            "api_key" => Self::ApiKey,
            _ => Self::Password,
        }
    }
}

/// One authenticated device context.
///
/// Token columns hold SHA-256 digests; the raw values only exist in [`IssuedSession`].
#[derive(Clone, Debug)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub session_token_hash: Vec<u8>,
    pub refresh_token_hash: Vec<u8>,
    pub status: SessionStatus,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub device: DeviceInfo,
    pub location: LocationInfo,
    pub device_name: Option<String>,
    pub login_method: LoginMethod,
    pub is_known_device: bool,
    pub risk_score: u8,
    pub initial_ip: String,
    pub last_ip: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && now < self.expires_at
    }

    #[must_use]
    pub fn is_refreshable(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && now < self.refresh_expires_at
    }
}

/// A freshly created or refreshed session together with the raw tokens for the caller.
#[derive(Clone, Debug)]
pub struct IssuedSession {
    pub session: Session,
    pub session_token: String,
    pub refresh_token: String,
}
