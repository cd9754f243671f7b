//! Login, token refresh and logout endpoints.

use axum::{
    extract::Extension,
    http::{header::AUTHORIZATION, HeaderMap},
    Json,
};
use std::sync::Arc;

use super::types::{LoginBody, RefreshBody, SessionTokenBody};
use crate::api::{
    client_ip::Client,
    error::{ApiError, ErrorBody},
};
use crate::credentials::lifecycle::{
    LoginResponse, LogoutAllResponse, LogoutResponse, RefreshResponse,
};
use crate::credentials::{AccessTokenClaims, CredentialLifecycle, TokenError};

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginBody,
    responses(
        (status = 200, description = "Authenticated", body = LoginResponse),
        (status = 401, description = "Wrong password", body = ErrorBody),
        (status = 403, description = "Email not verified", body = ErrorBody),
        (status = 404, description = "Unknown email", body = ErrorBody),
        (status = 423, description = "Account locked", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn login(
    Extension(lifecycle): Extension<Arc<CredentialLifecycle>>,
    Client(client): Client,
    payload: Option<Json<LoginBody>>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Some(Json(body)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    let response = lifecycle.login(body.into(), &client).await?;
    Ok(Json(response))
}

/// Exchange a refresh token for a new access and refresh token pair.
#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    request_body = RefreshBody,
    responses(
        (status = 200, description = "Tokens rotated", body = RefreshResponse),
        (status = 400, description = "Unknown or reused refresh token", body = ErrorBody),
        (status = 404, description = "Account no longer active", body = ErrorBody),
        (status = 410, description = "Refresh token expired", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn refresh(
    Extension(lifecycle): Extension<Arc<CredentialLifecycle>>,
    Client(client): Client,
    payload: Option<Json<RefreshBody>>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let Some(Json(body)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    let response = lifecycle.refresh_token(&body.refresh_token, &client).await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    request_body = SessionTokenBody,
    responses(
        (status = 200, description = "Logout result, `success` is false for unknown or closed sessions", body = LogoutResponse)
    ),
    tag = "auth"
)]
pub async fn logout(
    Extension(lifecycle): Extension<Arc<CredentialLifecycle>>,
    payload: Option<Json<SessionTokenBody>>,
) -> Result<Json<LogoutResponse>, ApiError> {
    let Some(Json(body)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    Ok(Json(lifecycle.logout(&body.session_token).await?))
}

/// Close every session of the caller except the one presented.
#[utoipa::path(
    post,
    path = "/v1/auth/logout-all",
    request_body = SessionTokenBody,
    responses(
        (status = 200, description = "Other sessions revoked", body = LogoutAllResponse)
    ),
    tag = "auth"
)]
pub async fn logout_all(
    Extension(lifecycle): Extension<Arc<CredentialLifecycle>>,
    payload: Option<Json<SessionTokenBody>>,
) -> Result<Json<LogoutAllResponse>, ApiError> {
    let Some(Json(body)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    Ok(Json(lifecycle.logout_all_devices(&body.session_token).await?))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Claims of the presented access token.
#[utoipa::path(
    get,
    path = "/v1/auth/me",
    responses(
        (status = 200, description = "Token is valid", body = AccessTokenClaims),
        (status = 401, description = "Missing, expired or forged token", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn me(
    headers: HeaderMap,
    Extension(lifecycle): Extension<Arc<CredentialLifecycle>>,
) -> Result<Json<AccessTokenClaims>, ApiError> {
    let token = bearer_token(&headers).ok_or(TokenError::TokenFormat)?;
    Ok(Json(lifecycle.verify_access_token(token)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer  abc.def.ghi "));
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
