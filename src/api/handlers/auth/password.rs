//! Password reset endpoints.

use axum::{extract::Extension, http::StatusCode, Json};
use std::sync::Arc;

use super::types::{EmailBody, MessageResponse, ResetPasswordBody};
use crate::api::{
    client_ip::Client,
    error::{ApiError, ErrorBody},
};
use crate::credentials::lifecycle::ResetPasswordResponse;
use crate::credentials::CredentialLifecycle;

/// Start a password reset. The response is the same whether or not the account exists.
#[utoipa::path(
    post,
    path = "/v1/auth/password-reset",
    request_body = EmailBody,
    responses(
        (status = 202, description = "Reset email queued if the account exists", body = MessageResponse),
        (status = 400, description = "Malformed email", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn request_password_reset(
    Extension(lifecycle): Extension<Arc<CredentialLifecycle>>,
    Client(client): Client,
    payload: Option<Json<EmailBody>>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let Some(Json(body)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    lifecycle.request_password_reset(&body.email, &client).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: "If the account exists, a password reset email has been sent".to_string(),
        }),
    ))
}

/// Set a new password with the token from the reset email. Every session is closed.
#[utoipa::path(
    post,
    path = "/v1/auth/password-reset/confirm",
    request_body = ResetPasswordBody,
    responses(
        (status = 200, description = "Password changed", body = ResetPasswordResponse),
        (status = 400, description = "Invalid token or weak password", body = ErrorBody),
        (status = 410, description = "Token expired", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn reset_password(
    Extension(lifecycle): Extension<Arc<CredentialLifecycle>>,
    Client(client): Client,
    payload: Option<Json<ResetPasswordBody>>,
) -> Result<Json<ResetPasswordResponse>, ApiError> {
    let Some(Json(body)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    let response = lifecycle.reset_password(body.into(), &client).await?;
    Ok(Json(response))
}
