//! Failure taxonomy for credential operations.
//!
//! Every variant except `Internal` is an expected, caller-actionable outcome. The HTTP layer maps
//! them one-to-one to responses; `Internal` is logged where it happens and rendered generically.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use super::rate_limit::RateLimitAction;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("an account already exists for {email}")]
    EmailAlreadyExists { email: String },

    #[error("no account found for {email}")]
    UserNotFound { email: String },

    #[error("invalid credentials for {email}, {remaining_attempts} attempts remaining")]
    InvalidCredentials {
        email: String,
        remaining_attempts: u32,
    },

    #[error("account {email} is locked until {locked_until}")]
    AccountLocked {
        email: String,
        locked_until: DateTime<Utc>,
        remaining: Duration,
    },

    #[error("email {email} has not been verified")]
    EmailNotVerified { email: String },

    #[error("too many {action} attempts, retry in {}s", retry_after.num_seconds())]
    RateLimitExceeded {
        action: RateLimitAction,
        retry_after: Duration,
    },

    // Token values are carried for the transport layer but never rendered.
    #[error("invalid or unknown token")]
    InvalidVerificationToken {
        token: String,
        email: Option<String>,
    },

    #[error("token has expired")]
    ExpiredVerificationToken {
        token: String,
        email: Option<String>,
    },

    #[error("email has already been verified")]
    EmailAlreadyVerified {
        token: Option<String>,
        email: Option<String>,
    },

    #[error("{field}: {message}")]
    Validation { field: String, message: String },

    #[error("invalid account state: {message}")]
    InvalidState { message: String },

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl CredentialError {
    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid_token(token: &str, email: Option<&str>) -> Self {
        Self::InvalidVerificationToken {
            token: token.to_string(),
            email: email.map(ToString::to_string),
        }
    }

    pub(crate) fn expired_token(token: &str, email: Option<&str>) -> Self {
        Self::ExpiredVerificationToken {
            token: token.to_string(),
            email: email.map(ToString::to_string),
        }
    }

    /// Retry hint for rate limit and lockout failures.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            Self::AccountLocked { remaining, .. } => Some(*remaining),
            _ => None,
        }
    }
}

pub type CredentialResult<T> = Result<T, CredentialError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_values_stay_out_of_messages() {
        let err = CredentialError::invalid_token("secret-token", Some("a@x.com"));
        assert!(!err.to_string().contains("secret-token"));
    }

    #[test]
    fn retry_after_only_for_throttles() {
        let err = CredentialError::RateLimitExceeded {
            action: RateLimitAction::Login,
            retry_after: Duration::seconds(90),
        };
        assert_eq!(err.retry_after(), Some(Duration::seconds(90)));
        assert_eq!(err.to_string(), "too many login attempts, retry in 90s");

        let err = CredentialError::UserNotFound {
            email: "a@x.com".to_string(),
        };
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn internal_hides_details() {
        let err = CredentialError::from(anyhow::anyhow!("connection refused on 10.0.0.3"));
        assert_eq!(err.to_string(), "internal error");
    }
}
