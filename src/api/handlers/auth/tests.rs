use anyhow::{anyhow, Result};
use axum::{
    body::{to_bytes, Body},
    extract::connect_info::MockConnectInfo,
    http::{header::RETRY_AFTER, HeaderMap, Request, StatusCode},
    Router,
};
use secrecy::SecretString;
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tower::ServiceExt;

use crate::api::router;
use crate::credentials::{
    AccessTokenSigner, AuthConfig, CredentialLifecycle, HashCost, NoopRateLimiter,
};
use crate::email::{EmailDispatcher, EmailMessage};
use crate::store::Stores;

const PASSWORD: &str = "Str0ng!Passw0rd";

struct TestApp {
    app: Router,
    stores: Stores,
    _outbox: mpsc::Receiver<EmailMessage>,
}

fn test_app(rate_limited: bool) -> Result<TestApp> {
    let stores = Stores::memory();
    let (email, outbox) = EmailDispatcher::channel(32);
    let signer = AccessTokenSigner::new(
        SecretString::from("handler-test-secret"),
        "https://accredit.test".to_string(),
        "accredit".to_string(),
    );
    let mut builder = CredentialLifecycle::builder(stores.clone(), signer, email)
        .with_config(AuthConfig::new().with_hash_cost(HashCost::new(1024, 1, 1)));
    if !rate_limited {
        builder = builder.with_rate_limiter(Arc::new(NoopRateLimiter));
    }
    let lifecycle = Arc::new(builder.build()?);
    let peer: SocketAddr = "192.0.2.44:41000".parse()?;
    let app = router(lifecycle)?.layer(MockConnectInfo(peer));
    Ok(TestApp {
        app,
        stores,
        _outbox: outbox,
    })
}

async fn send(app: &Router, request: Request<Body>) -> Result<(StatusCode, HeaderMap, Value)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await?;
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)?
    };
    Ok((status, headers, value))
}

async fn post_json(app: &Router, uri: &str, payload: &Value) -> Result<(StatusCode, HeaderMap, Value)> {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .header("User-Agent", "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_5) Safari/605.1.15")
        .header("X-Forwarded-For", "198.51.100.20, 10.0.0.1")
        .body(Body::from(serde_json::to_vec(payload)?))?;
    send(app, request).await
}

fn register_payload(email: &str) -> Value {
    json!({
        "email": email,
        "password": PASSWORD,
        "confirm_password": PASSWORD,
        "first_name": "Grace",
        "last_name": "Hopper",
    })
}

async fn registered_and_verified(test: &TestApp, email: &str) -> Result<()> {
    let (status, _, _) = post_json(&test.app, "/v1/auth/register", &register_payload(email)).await?;
    assert_eq!(status, StatusCode::CREATED);
    let token = test
        .stores
        .users
        .find_user_by_email(email)
        .await?
        .and_then(|user| user.email_verification)
        .map(|token| token.token)
        .ok_or_else(|| anyhow!("no verification token for {email}"))?;
    let (status, _, body) =
        post_json(&test.app, "/v1/auth/verify-email", &json!({ "token": token })).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["account_activated"], json!(true));
    Ok(())
}

#[tokio::test]
async fn register_conflict_is_409() -> Result<()> {
    let test = test_app(false)?;
    let (status, _, body) =
        post_json(&test.app, "/v1/auth/register", &register_payload("g@x.com")).await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["requires_verification"], json!(true));

    let (status, _, body) =
        post_json(&test.app, "/v1/auth/register", &register_payload("G@x.com")).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], json!("email_already_exists"));
    Ok(())
}

#[tokio::test]
async fn missing_payload_is_400() -> Result<()> {
    let test = test_app(false)?;
    let request = Request::builder()
        .method("POST")
        .uri("/v1/auth/login")
        .body(Body::empty())?;
    let (status, _, body) = send(&test.app, request).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("validation_error"));
    Ok(())
}

#[tokio::test]
async fn validation_error_names_field() -> Result<()> {
    let test = test_app(false)?;
    let mut payload = register_payload("g@x.com");
    payload["password"] = json!("short");
    payload["confirm_password"] = json!("short");
    let (status, _, body) = post_json(&test.app, "/v1/auth/register", &payload).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["field"], json!("password"));
    Ok(())
}

#[tokio::test]
async fn login_me_and_logout() -> Result<()> {
    let test = test_app(false)?;
    registered_and_verified(&test, "g@x.com").await?;

    let (status, _, login) = post_json(
        &test.app,
        "/v1/auth/login",
        &json!({ "email": "g@x.com", "password": PASSWORD, "device_name": "Work laptop" }),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(login["token_type"], json!("Bearer"));
    assert_eq!(login["session"]["device"], json!("Work laptop"));
    assert_eq!(login["session"]["location"], json!("Unknown location"));

    let access_token = login["access_token"]
        .as_str()
        .ok_or_else(|| anyhow!("missing access token"))?;
    let request = Request::builder()
        .method("GET")
        .uri("/v1/auth/me")
        .header("Authorization", format!("Bearer {access_token}"))
        .body(Body::empty())?;
    let (status, _, claims) = send(&test.app, request).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claims["email"], json!("g@x.com"));

    let session_token = login["session"]["session_token"].clone();
    let (status, _, body) = post_json(
        &test.app,
        "/v1/auth/logout",
        &json!({ "session_token": session_token }),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));

    let (status, _, body) = post_json(
        &test.app,
        "/v1/auth/logout",
        &json!({ "session_token": session_token }),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(false));
    Ok(())
}

#[tokio::test]
async fn me_rejects_forged_token() -> Result<()> {
    let test = test_app(false)?;
    let request = Request::builder()
        .method("GET")
        .uri("/v1/auth/me")
        .header("Authorization", "Bearer e30.e30.c2ln")
        .body(Body::empty())?;
    let (status, headers, body) = send(&test.app, request).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(headers.contains_key("www-authenticate"));
    assert_eq!(body["error"], json!("invalid_access_token"));
    Ok(())
}

#[tokio::test]
async fn unverified_login_is_403() -> Result<()> {
    let test = test_app(false)?;
    post_json(&test.app, "/v1/auth/register", &register_payload("g@x.com")).await?;
    let (status, _, body) = post_json(
        &test.app,
        "/v1/auth/login",
        &json!({ "email": "g@x.com", "password": PASSWORD }),
    )
    .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], json!("email_not_verified"));
    Ok(())
}

#[tokio::test]
async fn login_rate_limit_sets_retry_after() -> Result<()> {
    let test = test_app(true)?;
    let payload = json!({ "email": "nobody@x.com", "password": PASSWORD });
    for _ in 0..5 {
        let (status, _, _) = post_json(&test.app, "/v1/auth/login", &payload).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
    let (status, headers, body) = post_json(&test.app, "/v1/auth/login", &payload).await?;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(headers.contains_key(RETRY_AFTER));
    assert_eq!(body["error"], json!("rate_limit_exceeded"));
    Ok(())
}

#[tokio::test]
async fn password_reset_does_not_reveal_accounts() -> Result<()> {
    let test = test_app(false)?;
    let (status, _, unknown) = post_json(
        &test.app,
        "/v1/auth/password-reset",
        &json!({ "email": "ghost@x.com" }),
    )
    .await?;
    assert_eq!(status, StatusCode::ACCEPTED);

    registered_and_verified(&test, "g@x.com").await?;
    let (status, _, known) = post_json(
        &test.app,
        "/v1/auth/password-reset",
        &json!({ "email": "g@x.com" }),
    )
    .await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(unknown, known);
    Ok(())
}

#[tokio::test]
async fn health_reports_store() -> Result<()> {
    let test = test_app(false)?;
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())?;
    let (status, headers, body) = send(&test.app, request).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-app"));
    assert!(headers.contains_key("x-request-id"));
    assert_eq!(body["database"], json!("ok"));
    assert_eq!(body["name"], json!(env!("CARGO_PKG_NAME")));
    Ok(())
}
