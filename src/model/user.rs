use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    PendingConfirmation,
    Active,
    Blocked,
    Inactive,
    MarkedForDeletion,
}

impl UserStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingConfirmation => "pending_confirmation",
            Self::Active => "active",
            Self::Blocked => "blocked",
            Self::Inactive => "inactive",
            Self::MarkedForDeletion => "marked_for_deletion",
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending_confirmation" => Ok(Self::PendingConfirmation),
            "active" => Ok(Self::Active),
            "blocked" => Ok(Self::Blocked),
            "inactive" => Ok(Self::Inactive),
            "marked_for_deletion" => Ok(Self::MarkedForDeletion),
            other => Err(format!("unknown user status: {other}")),
        }
    }
}

/// A single-use token with its expiry, attached to the user it was issued for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl VerificationToken {
    #[must_use]
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Clone, Debug)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: Option<String>,
    pub status: UserStatus,
    pub is_email_verified: bool,
    pub email_verified_at: Option<DateTime<Utc>>,
    pub failed_login_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub email_verification: Option<VerificationToken>,
    pub password_reset: Option<VerificationToken>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub password_changed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// New account awaiting email confirmation. `email` must already be normalized.
    #[must_use]
    pub fn pending(
        email: String,
        password_hash: String,
        first_name: String,
        last_name: String,
        phone_number: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            email,
            password_hash,
            first_name,
            last_name,
            phone_number,
            status: UserStatus::PendingConfirmation,
            is_email_verified: false,
            email_verified_at: None,
            failed_login_attempts: 0,
            locked_until: None,
            email_verification: None,
            password_reset: None,
            last_login_at: None,
            password_changed_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    #[must_use]
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// Replace the email verification token. The previous value stops validating immediately.
    pub fn set_email_verification(&mut self, token: String, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.email_verification = Some(VerificationToken { token, expires_at });
        self.updated_at = now;
    }

    #[must_use]
    pub fn has_valid_email_verification(&self, now: DateTime<Utc>) -> bool {
        self.email_verification
            .as_ref()
            .is_some_and(|token| token.is_valid(now))
    }

    pub fn mark_email_verified(&mut self, now: DateTime<Utc>) {
        self.is_email_verified = true;
        self.email_verified_at = Some(now);
        self.email_verification = None;
        self.status = UserStatus::Active;
        self.updated_at = now;
    }

    pub fn set_password_reset(&mut self, token: String, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.password_reset = Some(VerificationToken { token, expires_at });
        self.updated_at = now;
    }

    /// Timestamp for the next password change: `now` at microsecond precision, or just past the
    /// previous change if the clock has not moved beyond it. Every change gets a distinct value,
    /// so `password_changed_at` also tells whether the password was replaced since it was read.
    #[must_use]
    pub fn next_password_change(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let now = now.trunc_subsecs(6);
        match self.password_changed_at {
            Some(previous) if previous >= now => previous + Duration::microseconds(1),
            _ => now,
        }
    }

    /// Install a new password from a reset: consumes the reset token and clears the lockout.
    pub fn apply_password_reset(
        &mut self,
        password_hash: String,
        changed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.password_hash = password_hash;
        self.password_changed_at = Some(changed_at);
        self.password_reset = None;
        self.failed_login_attempts = 0;
        self.locked_until = None;
        if self.status == UserStatus::Blocked {
            self.status = UserStatus::Active;
        }
        self.updated_at = now;
    }

    /// Clear tokens past their expiry. Returns which purposes were cleared.
    pub fn clear_expired_tokens(&mut self, now: DateTime<Utc>) -> (bool, bool) {
        let email = self
            .email_verification
            .as_ref()
            .is_some_and(|token| !token.is_valid(now));
        if email {
            self.email_verification = None;
        }
        let reset = self
            .password_reset
            .as_ref()
            .is_some_and(|token| !token.is_valid(now));
        if reset {
            self.password_reset = None;
        }
        if email || reset {
            self.updated_at = now;
        }
        (email, reset)
    }
}
