//! Sign-up and email verification endpoints.

use axum::{extract::Extension, http::StatusCode, Json};
use std::sync::Arc;

use super::types::{EmailBody, RegisterBody, VerifyEmailBody};
use crate::api::{
    client_ip::Client,
    error::{ApiError, ErrorBody},
};
use crate::credentials::lifecycle::{
    RegisterResponse, ResendVerificationResponse, VerifyEmailResponse,
};
use crate::credentials::CredentialLifecycle;

/// Create an account and send the verification email.
#[utoipa::path(
    post,
    path = "/v1/auth/register",
    request_body = RegisterBody,
    responses(
        (status = 201, description = "Account created, verification pending", body = RegisterResponse),
        (status = 400, description = "Invalid input", body = ErrorBody),
        (status = 409, description = "Email already registered", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn register(
    Extension(lifecycle): Extension<Arc<CredentialLifecycle>>,
    Client(client): Client,
    payload: Option<Json<RegisterBody>>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let Some(Json(body)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    let response = lifecycle.register(body.into(), &client).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Consume the token from the verification link and activate the account.
#[utoipa::path(
    post,
    path = "/v1/auth/verify-email",
    request_body = VerifyEmailBody,
    responses(
        (status = 200, description = "Email verified", body = VerifyEmailResponse),
        (status = 400, description = "Invalid token", body = ErrorBody),
        (status = 409, description = "Already verified", body = ErrorBody),
        (status = 410, description = "Token expired", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn verify_email(
    Extension(lifecycle): Extension<Arc<CredentialLifecycle>>,
    Client(client): Client,
    payload: Option<Json<VerifyEmailBody>>,
) -> Result<Json<VerifyEmailResponse>, ApiError> {
    let Some(Json(body)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    let response = lifecycle
        .verify_email(&body.token, body.email.as_deref(), &client)
        .await?;
    Ok(Json(response))
}

/// Send the verification email again.
#[utoipa::path(
    post,
    path = "/v1/auth/resend-verification",
    request_body = EmailBody,
    responses(
        (status = 200, description = "Verification email queued", body = ResendVerificationResponse),
        (status = 404, description = "Unknown email", body = ErrorBody),
        (status = 409, description = "Already verified", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn resend_verification(
    Extension(lifecycle): Extension<Arc<CredentialLifecycle>>,
    Client(client): Client,
    payload: Option<Json<EmailBody>>,
) -> Result<Json<ResendVerificationResponse>, ApiError> {
    let Some(Json(body)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    let response = lifecycle.resend_verification(&body.email, &client).await?;
    Ok(Json(response))
}
