//! Translation of credential failures into HTTP responses.

use axum::{
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use crate::credentials::{CredentialError, TokenError};

const INTERNAL_MESSAGE: &str = "An unexpected error occurred";

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<i64>,
}

impl ErrorBody {
    fn new(error: &str, message: String) -> Self {
        Self {
            error: error.to_string(),
            message,
            field: None,
            remaining_attempts: None,
            retry_after_seconds: None,
        }
    }
}

pub enum ApiError {
    Credential(CredentialError),
    Unauthorized(TokenError),
    MissingPayload,
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        Self::Credential(err)
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        Self::Unauthorized(err)
    }
}

/// Status code and machine readable code for a failure.
#[must_use]
pub fn classify(err: &CredentialError) -> (StatusCode, &'static str) {
    match err {
        CredentialError::EmailAlreadyExists { .. } => (StatusCode::CONFLICT, "email_already_exists"),
        CredentialError::UserNotFound { .. } => (StatusCode::NOT_FOUND, "user_not_found"),
        CredentialError::InvalidCredentials { .. } => {
            (StatusCode::UNAUTHORIZED, "invalid_credentials")
        }
        CredentialError::AccountLocked { .. } => (StatusCode::LOCKED, "account_locked"),
        CredentialError::EmailNotVerified { .. } => (StatusCode::FORBIDDEN, "email_not_verified"),
        CredentialError::RateLimitExceeded { .. } => {
            (StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded")
        }
        CredentialError::InvalidVerificationToken { .. } => (StatusCode::BAD_REQUEST, "invalid_token"),
        CredentialError::ExpiredVerificationToken { .. } => (StatusCode::GONE, "expired_token"),
        CredentialError::EmailAlreadyVerified { .. } => {
            (StatusCode::CONFLICT, "email_already_verified")
        }
        CredentialError::Validation { .. } => (StatusCode::BAD_REQUEST, "validation_error"),
        CredentialError::InvalidState { .. } => (StatusCode::CONFLICT, "invalid_state"),
        CredentialError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

/// Whole seconds, rounded up so clients never retry early.
fn retry_after_seconds(retry_after: Duration) -> i64 {
    let millis = retry_after.num_milliseconds().max(0);
    ((millis + 999) / 1000).max(1)
}

fn credential_response(err: &CredentialError) -> Response {
    let (status, code) = classify(err);
    let message = match err {
        CredentialError::Internal(_) => INTERNAL_MESSAGE.to_string(),
        other => other.to_string(),
    };
    let mut body = ErrorBody::new(code, message);
    match err {
        CredentialError::Validation { field, .. } => body.field = Some(field.clone()),
        CredentialError::InvalidCredentials {
            remaining_attempts, ..
        } => body.remaining_attempts = Some(*remaining_attempts),
        _ => {}
    }

    let mut headers = HeaderMap::new();
    if let Some(retry_after) = err.retry_after() {
        let seconds = retry_after_seconds(retry_after);
        body.retry_after_seconds = Some(seconds);
        if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
            headers.insert(RETRY_AFTER, value);
        }
    }

    (status, headers, Json(body)).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Credential(err) => credential_response(&err),
            Self::Unauthorized(err) => {
                let mut headers = HeaderMap::new();
                headers.insert(
                    axum::http::header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer"),
                );
                (
                    StatusCode::UNAUTHORIZED,
                    headers,
                    Json(ErrorBody::new("invalid_access_token", err.to_string())),
                )
                    .into_response()
            }
            Self::MissingPayload => {
                debug!("Request rejected: missing or malformed JSON payload");
                (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorBody::new(
                        "validation_error",
                        "Missing or malformed JSON payload".to_string(),
                    )),
                )
                    .into_response()
            }
        }
    }
}
