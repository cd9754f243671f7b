//! End-to-end flows through the public `CredentialLifecycle` API on in-memory stores.

use accredit::credentials::lifecycle::{
    LoginRequest, LoginResponse, RegisterRequest, ResetPasswordRequest,
};
use accredit::credentials::{
    AccessTokenSigner, AuthConfig, ClientContext, Clock, CredentialError, CredentialHasher,
    CredentialLifecycle, HashCost, ManualClock, NoopRateLimiter, RoleAdminError, RoleGraphError,
};
use accredit::email::{EmailDispatcher, EmailMessage};
use accredit::model::{system_permissions, Role, User, UserStatus};
use accredit::store::Stores;
use anyhow::{anyhow, Result};
use chrono::{Duration, TimeZone, Utc};
use secrecy::SecretString;
use std::sync::Arc;
use tokio::sync::mpsc;

const PASSWORD: &str = "Str0ng!Passw0rd";
const NEW_PASSWORD: &str = "N3w!Passw0rd-2026";
const OTHER_PASSWORD: &str = "0ther!Passw0rd-2026";
const WRONG_PASSWORD: &str = "Wr0ng!Passw0rd";

struct World {
    lifecycle: CredentialLifecycle,
    stores: Stores,
    clock: Arc<ManualClock>,
    _outbox: mpsc::Receiver<EmailMessage>,
}

fn world(rate_limited: bool) -> Result<World> {
    let stores = Stores::memory();
    let start = Utc
        .with_ymd_and_hms(2026, 5, 4, 8, 30, 0)
        .single()
        .ok_or_else(|| anyhow!("invalid start time"))?;
    let clock = Arc::new(ManualClock::new(start));
    let (email, outbox) = EmailDispatcher::channel(64);
    let signer = AccessTokenSigner::new(
        SecretString::from("integration-secret"),
        "https://accredit.test".to_string(),
        "accredit".to_string(),
    );
    let mut builder = CredentialLifecycle::builder(stores.clone(), signer, email)
        .with_clock(clock.clone())
        .with_config(AuthConfig::new().with_hash_cost(HashCost::new(1024, 1, 1)));
    if !rate_limited {
        builder = builder.with_rate_limiter(Arc::new(NoopRateLimiter));
    }
    Ok(World {
        lifecycle: builder.build()?,
        stores,
        clock,
        _outbox: outbox,
    })
}

fn client() -> ClientContext {
    ClientContext::new(
        "198.51.100.7",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/126.0 Safari/537.36",
    )
}

fn login_request(email: &str, password: &str) -> LoginRequest {
    LoginRequest {
        email: email.to_string(),
        password: SecretString::from(password),
        remember_me: false,
        device_name: None,
    }
}

async fn register(world: &World, email: &str) -> Result<()> {
    world
        .lifecycle
        .register(
            RegisterRequest {
                email: email.to_string(),
                password: SecretString::from(PASSWORD),
                confirm_password: SecretString::from(PASSWORD),
                first_name: "Katherine".to_string(),
                last_name: "Johnson".to_string(),
                phone_number: None,
            },
            &client(),
        )
        .await?;
    Ok(())
}

async fn verification_token(world: &World, email: &str) -> Result<String> {
    world
        .stores
        .users
        .find_user_by_email(email)
        .await?
        .and_then(|user| user.email_verification)
        .map(|token| token.token)
        .ok_or_else(|| anyhow!("no verification token for {email}"))
}

async fn active_account(world: &World, email: &str) -> Result<()> {
    register(world, email).await?;
    let token = verification_token(world, email).await?;
    world.lifecycle.verify_email(&token, Some(email), &client()).await?;
    Ok(())
}

async fn reset_token(world: &World, email: &str) -> Result<String> {
    world
        .lifecycle
        .request_password_reset(email, &client())
        .await?;
    world
        .stores
        .users
        .find_user_by_email(email)
        .await?
        .and_then(|user| user.password_reset)
        .map(|reset| reset.token)
        .ok_or_else(|| anyhow!("no reset token for {email}"))
}

fn reset_request(token: &str, password: &str) -> ResetPasswordRequest {
    ResetPasswordRequest {
        token: token.to_string(),
        new_password: SecretString::from(password),
        confirm_password: SecretString::from(password),
    }
}

async fn login(world: &World, email: &str) -> Result<LoginResponse> {
    Ok(world
        .lifecycle
        .login(login_request(email, PASSWORD), &client())
        .await?)
}

#[tokio::test]
async fn lockout_grows_with_each_failure_past_the_threshold() -> Result<()> {
    let world = world(false)?;
    active_account(&world, "kj@nasa.test").await?;

    for expected_remaining in (0..5).rev() {
        let result = world
            .lifecycle
            .login(login_request("kj@nasa.test", "Wr0ng!Password"), &client())
            .await;
        match result {
            Err(CredentialError::InvalidCredentials {
                remaining_attempts, ..
            }) => assert_eq!(remaining_attempts, expected_remaining),
            other => return Err(anyhow!("expected InvalidCredentials, got {other:?}")),
        }
    }

    // The next attempt sees a two minute lock, even with the right password.
    match login(&world, "kj@nasa.test").await {
        Err(err) => match err.downcast_ref::<CredentialError>() {
            Some(CredentialError::AccountLocked { remaining, .. }) => {
                assert_eq!(*remaining, Duration::minutes(2));
            }
            _ => return Err(anyhow!("expected AccountLocked, got {err}")),
        },
        Ok(_) => return Err(anyhow!("login succeeded on a locked account")),
    }

    world.clock.advance(Duration::minutes(2) + Duration::seconds(1));
    let result = world
        .lifecycle
        .login(login_request("kj@nasa.test", "Wr0ng!Password"), &client())
        .await;
    assert!(matches!(
        result,
        Err(CredentialError::InvalidCredentials { .. })
    ));
    let result = world
        .lifecycle
        .login(login_request("kj@nasa.test", PASSWORD), &client())
        .await;
    match result {
        Err(CredentialError::AccountLocked { remaining, .. }) => {
            assert_eq!(remaining, Duration::minutes(4));
        }
        other => return Err(anyhow!("expected a four minute lock, got {other:?}")),
    }

    world.clock.advance(Duration::minutes(4) + Duration::seconds(1));
    login(&world, "kj@nasa.test").await?;
    let user = world
        .stores
        .users
        .find_user_by_email("kj@nasa.test")
        .await?
        .ok_or_else(|| anyhow!("user missing"))?;
    assert_eq!(user.status, UserStatus::Active);
    assert_eq!(user.failed_login_attempts, 0);
    assert_eq!(user.locked_until, None);
    Ok(())
}

#[tokio::test]
async fn login_rate_limit_window_slides() -> Result<()> {
    let world = world(true)?;
    for _ in 0..5 {
        let result = world
            .lifecycle
            .login(login_request("ghost@nasa.test", PASSWORD), &client())
            .await;
        assert!(matches!(result, Err(CredentialError::UserNotFound { .. })));
    }

    match world
        .lifecycle
        .login(login_request("ghost@nasa.test", PASSWORD), &client())
        .await
    {
        Err(CredentialError::RateLimitExceeded { retry_after, .. }) => {
            assert!(retry_after > Duration::zero());
            assert!(retry_after <= Duration::minutes(15));
        }
        other => return Err(anyhow!("expected RateLimitExceeded, got {other:?}")),
    }

    // A different address has its own window.
    let other_client = ClientContext::new("198.51.100.8", "curl/8.6.0");
    let result = world
        .lifecycle
        .login(login_request("ghost@nasa.test", PASSWORD), &other_client)
        .await;
    assert!(matches!(result, Err(CredentialError::UserNotFound { .. })));

    world.clock.advance(Duration::minutes(15) + Duration::seconds(1));
    let result = world
        .lifecycle
        .login(login_request("ghost@nasa.test", PASSWORD), &client())
        .await;
    assert!(matches!(result, Err(CredentialError::UserNotFound { .. })));
    Ok(())
}

#[tokio::test]
async fn refresh_tokens_are_single_use() -> Result<()> {
    let world = world(false)?;
    active_account(&world, "kj@nasa.test").await?;
    let session = login(&world, "kj@nasa.test").await?;

    let first = world
        .lifecycle
        .refresh_token(&session.refresh_token, &client())
        .await?;
    assert_ne!(first.refresh_token, session.refresh_token);
    world.lifecycle.verify_access_token(&first.access_token)?;

    let replay = world
        .lifecycle
        .refresh_token(&session.refresh_token, &client())
        .await;
    assert!(matches!(
        replay,
        Err(CredentialError::InvalidVerificationToken { .. })
    ));

    let second = world
        .lifecycle
        .refresh_token(&first.refresh_token, &client())
        .await?;
    assert_ne!(second.refresh_token, first.refresh_token);
    Ok(())
}

#[tokio::test]
async fn refresh_past_refresh_expiry_closes_the_session() -> Result<()> {
    let world = world(false)?;
    active_account(&world, "kj@nasa.test").await?;
    let session = login(&world, "kj@nasa.test").await?;

    world.clock.advance(Duration::days(7) + Duration::seconds(1));
    let result = world
        .lifecycle
        .refresh_token(&session.refresh_token, &client())
        .await;
    assert!(matches!(
        result,
        Err(CredentialError::ExpiredVerificationToken { .. })
    ));
    let logout = world.lifecycle.logout(&session.session.session_token).await?;
    assert!(!logout.success);
    Ok(())
}

#[tokio::test]
async fn inherited_permissions_reach_the_access_token() -> Result<()> {
    let world = world(false)?;
    active_account(&world, "kj@nasa.test").await?;
    let user_id = login(&world, "kj@nasa.test").await?.user.id;

    let roles = world.lifecycle.roles();
    roles.seed_system_permissions().await?;
    let now = world.clock.now();
    let viewer = roles.create_role(Role::new("Viewer", now)).await?;
    let editor = roles.create_role(Role::new("Editor", now).inherited()).await?;
    roles.attach_parent(editor.id, viewer.id).await?;

    let read = roles
        .create_permission("reports:read:own", Some("Read own reports"))
        .await?;
    let write = roles.create_permission("reports:write:own", None).await?;
    roles.grant_permission(viewer.id, read.id, None, None, None).await?;
    roles.grant_permission(editor.id, write.id, None, None, None).await?;
    roles.assign_role(user_id, editor.id, None, None).await?;

    let session = login(&world, "kj@nasa.test").await?;
    let claims = world.lifecycle.verify_access_token(&session.access_token)?;
    assert_eq!(claims.roles, vec!["Editor".to_string()]);
    assert_eq!(
        claims.permissions,
        vec!["reports:read:own".to_string(), "reports:write:own".to_string()]
    );

    // Dropping the link removes the inherited permission on the next refresh.
    roles.detach_parent(editor.id).await?;
    let refreshed = world
        .lifecycle
        .refresh_token(&session.refresh_token, &client())
        .await?;
    let claims = world.lifecycle.verify_access_token(&refreshed.access_token)?;
    assert_eq!(claims.permissions, vec!["reports:write:own".to_string()]);
    assert!(!roles
        .has_permission(user_id, system_permissions::USERS_READ_OWN)
        .await?);
    Ok(())
}

#[tokio::test]
async fn role_cycles_are_rejected() -> Result<()> {
    let world = world(false)?;
    let roles = world.lifecycle.roles();
    let now = world.clock.now();
    let base = roles.create_role(Role::new("Base", now)).await?;
    let middle = roles.create_role(Role::new("Middle", now).inherited()).await?;
    let top = roles.create_role(Role::new("Top", now).inherited()).await?;
    roles.attach_parent(middle.id, base.id).await?;
    roles.attach_parent(top.id, middle.id).await?;

    let result = roles.attach_parent(base.id, top.id).await;
    assert!(matches!(
        result,
        Err(RoleAdminError::Graph(RoleGraphError::Cycle { .. }))
    ));
    let result = roles.attach_parent(base.id, base.id).await;
    assert!(matches!(
        result,
        Err(RoleAdminError::Graph(RoleGraphError::SelfParent(_)))
    ));
    let duplicate = roles.create_role(Role::new("base", now)).await;
    assert!(matches!(duplicate, Err(RoleAdminError::DuplicateRole(_))));
    Ok(())
}

#[tokio::test]
async fn verification_tokens_are_single_use() -> Result<()> {
    let world = world(false)?;
    register(&world, "kj@nasa.test").await?;
    let token = verification_token(&world, "kj@nasa.test").await?;

    let verified = world
        .lifecycle
        .verify_email(&token, None, &client())
        .await?;
    assert!(verified.account_activated);

    let replay = world.lifecycle.verify_email(&token, None, &client()).await;
    assert!(matches!(
        replay,
        Err(CredentialError::InvalidVerificationToken { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn resend_reuses_live_tokens_and_replaces_expired_ones() -> Result<()> {
    let world = world(false)?;
    register(&world, "kj@nasa.test").await?;
    let original = verification_token(&world, "kj@nasa.test").await?;

    let now = world.clock.now();
    let resent = world
        .lifecycle
        .resend_verification("kj@nasa.test", &client())
        .await?;
    assert!(!resent.was_token_refreshed);
    assert_eq!(resent.next_resend_allowed_at, now + Duration::minutes(5));
    assert_eq!(verification_token(&world, "kj@nasa.test").await?, original);

    world.clock.advance(Duration::hours(24) + Duration::seconds(1));
    let resent = world
        .lifecycle
        .resend_verification("kj@nasa.test", &client())
        .await?;
    assert!(resent.was_token_refreshed);
    let replacement = verification_token(&world, "kj@nasa.test").await?;
    assert_ne!(replacement, original);
    assert_eq!(
        resent.token_expires_at,
        world.clock.now() + Duration::hours(24)
    );

    let stale = world.lifecycle.verify_email(&original, None, &client()).await;
    assert!(matches!(
        stale,
        Err(CredentialError::InvalidVerificationToken { .. })
    ));
    world
        .lifecycle
        .verify_email(&replacement, None, &client())
        .await?;
    Ok(())
}

#[tokio::test]
async fn logout_is_idempotent() -> Result<()> {
    let world = world(false)?;
    active_account(&world, "kj@nasa.test").await?;
    let session = login(&world, "kj@nasa.test").await?;
    let token = session.session.session_token;

    assert!(world.lifecycle.logout(&token).await?.success);
    assert!(!world.lifecycle.logout(&token).await?.success);
    assert!(!world.lifecycle.logout("never-issued").await?.success);

    let refresh = world
        .lifecycle
        .refresh_token(&session.refresh_token, &client())
        .await;
    assert!(matches!(
        refresh,
        Err(CredentialError::InvalidVerificationToken { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn logout_all_keeps_the_calling_session() -> Result<()> {
    let world = world(false)?;
    active_account(&world, "kj@nasa.test").await?;
    let current = login(&world, "kj@nasa.test").await?;
    let laptop = login(&world, "kj@nasa.test").await?;
    let phone = login(&world, "kj@nasa.test").await?;

    let response = world
        .lifecycle
        .logout_all_devices(&current.session.session_token)
        .await?;
    assert!(response.success);
    assert_eq!(response.revoked_sessions, 2);

    let sessions = world.lifecycle.sessions();
    assert!(sessions
        .find_usable(&current.session.session_token)
        .await?
        .is_some());
    for other in [&laptop, &phone] {
        assert!(sessions
            .find_usable(&other.session.session_token)
            .await?
            .is_none());
    }
    Ok(())
}

#[tokio::test]
async fn password_reset_revokes_every_session() -> Result<()> {
    let world = world(false)?;
    active_account(&world, "kj@nasa.test").await?;
    let first = login(&world, "kj@nasa.test").await?;
    login(&world, "kj@nasa.test").await?;

    world
        .lifecycle
        .request_password_reset("kj@nasa.test", &client())
        .await?;
    let token = world
        .stores
        .users
        .find_user_by_email("kj@nasa.test")
        .await?
        .and_then(|user| user.password_reset)
        .map(|reset| reset.token)
        .ok_or_else(|| anyhow!("no reset token"))?;

    let response = world
        .lifecycle
        .reset_password(
            ResetPasswordRequest {
                token: token.clone(),
                new_password: SecretString::from(NEW_PASSWORD),
                confirm_password: SecretString::from(NEW_PASSWORD),
            },
            &client(),
        )
        .await?;
    assert_eq!(response.revoked_sessions, 2);
    assert!(world
        .lifecycle
        .sessions()
        .find_usable(&first.session.session_token)
        .await?
        .is_none());

    let old = world
        .lifecycle
        .login(login_request("kj@nasa.test", PASSWORD), &client())
        .await;
    assert!(matches!(old, Err(CredentialError::InvalidCredentials { .. })));
    world
        .lifecycle
        .login(login_request("kj@nasa.test", NEW_PASSWORD), &client())
        .await?;

    let replay = world
        .lifecycle
        .reset_password(
            ResetPasswordRequest {
                token,
                new_password: SecretString::from(NEW_PASSWORD),
                confirm_password: SecretString::from(NEW_PASSWORD),
            },
            &client(),
        )
        .await;
    assert!(matches!(
        replay,
        Err(CredentialError::InvalidVerificationToken { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn cleanup_sweeps_expired_sessions_and_tokens() -> Result<()> {
    let world = world(false)?;
    active_account(&world, "kj@nasa.test").await?;
    login(&world, "kj@nasa.test").await?;
    register(&world, "pending@nasa.test").await?;

    world.clock.advance(Duration::hours(25));
    assert_eq!(world.lifecycle.cleanup_expired_sessions().await?, 1);
    assert_eq!(world.lifecycle.cleanup_expired_sessions().await?, 0);

    let sweep = world.lifecycle.cleanup_expired_tokens().await?;
    assert_eq!(sweep.email_verification, 1);
    assert_eq!(sweep.password_reset, 0);
    let pending = world
        .stores
        .users
        .find_user_by_email("pending@nasa.test")
        .await?
        .ok_or_else(|| anyhow!("pending user missing"))?;
    assert!(pending.email_verification.is_none());
    Ok(())
}

#[tokio::test]
async fn concurrent_wrong_passwords_all_count_toward_lockout() -> Result<()> {
    let world = world(false)?;
    active_account(&world, "kj@nasa.test").await?;

    let client = client();
    let attempt = || {
        world
            .lifecycle
            .login(login_request("kj@nasa.test", WRONG_PASSWORD), &client)
    };
    let (a, b, c, d, e, f, g, h) = tokio::join!(
        attempt(),
        attempt(),
        attempt(),
        attempt(),
        attempt(),
        attempt(),
        attempt(),
        attempt()
    );
    let results = [a, b, c, d, e, f, g, h];

    let invalid = results
        .iter()
        .filter(|result| matches!(result, Err(CredentialError::InvalidCredentials { .. })))
        .count();
    let locked = results
        .iter()
        .filter(|result| matches!(result, Err(CredentialError::AccountLocked { .. })))
        .count();
    assert_eq!(invalid + locked, results.len());
    assert!(invalid >= 5);

    let user = world
        .stores
        .users
        .find_user_by_email("kj@nasa.test")
        .await?
        .ok_or_else(|| anyhow!("missing user"))?;
    assert_eq!(usize::try_from(user.failed_login_attempts)?, invalid);
    assert!(user.is_locked(world.clock.now()));
    assert_eq!(user.status, UserStatus::Blocked);
    Ok(())
}

#[tokio::test]
async fn reset_racing_a_login_keeps_the_new_password() -> Result<()> {
    let world = world(false)?;

    // Stored at a much higher cost than the configured one, so the login is still inside
    // Argon2 when the reset lands.
    let slow = CredentialHasher::new(HashCost::new(16 * 1024, 2, 1))?;
    let now = world.clock.now();
    let mut user = User::pending(
        "kj@nasa.test".to_string(),
        slow.hash(&SecretString::from(PASSWORD))?,
        "Katherine".to_string(),
        "Johnson".to_string(),
        None,
        now,
    );
    user.mark_email_verified(now);
    world.stores.users.insert_user(&user).await?;
    let token = reset_token(&world, "kj@nasa.test").await?;

    let client = client();
    let (racing_login, reset) = tokio::join!(
        world
            .lifecycle
            .login(login_request("kj@nasa.test", PASSWORD), &client),
        async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            world
                .lifecycle
                .reset_password(reset_request(&token, NEW_PASSWORD), &client)
                .await
        }
    );
    reset?;

    match racing_login {
        Ok(racing) => assert!(world
            .lifecycle
            .sessions()
            .find_usable(&racing.session.session_token)
            .await?
            .is_none()),
        Err(err) => assert!(
            matches!(err, CredentialError::InvalidCredentials { .. }),
            "unexpected error: {err:?}"
        ),
    }

    let old = world
        .lifecycle
        .login(login_request("kj@nasa.test", PASSWORD), &client)
        .await;
    assert!(matches!(old, Err(CredentialError::InvalidCredentials { .. })));
    world
        .lifecycle
        .login(login_request("kj@nasa.test", NEW_PASSWORD), &client)
        .await?;
    Ok(())
}

#[tokio::test]
async fn reset_token_redeemed_twice_at_once_changes_the_password_once() -> Result<()> {
    let world = world(false)?;
    active_account(&world, "kj@nasa.test").await?;
    let token = reset_token(&world, "kj@nasa.test").await?;

    let client = client();
    let (first, second) = tokio::join!(
        world
            .lifecycle
            .reset_password(reset_request(&token, NEW_PASSWORD), &client),
        world
            .lifecycle
            .reset_password(reset_request(&token, OTHER_PASSWORD), &client)
    );
    let (winner, loser, rejected) = match (first, second) {
        (Ok(_), Err(err)) => (NEW_PASSWORD, OTHER_PASSWORD, err),
        (Err(err), Ok(_)) => (OTHER_PASSWORD, NEW_PASSWORD, err),
        (first, second) => {
            return Err(anyhow!(
                "expected exactly one reset to succeed: {first:?} / {second:?}"
            ))
        }
    };
    assert!(matches!(
        rejected,
        CredentialError::InvalidVerificationToken { .. }
    ));

    world
        .lifecycle
        .login(login_request("kj@nasa.test", winner), &client)
        .await?;
    let stale = world
        .lifecycle
        .login(login_request("kj@nasa.test", loser), &client)
        .await;
    assert!(matches!(stale, Err(CredentialError::InvalidCredentials { .. })));
    Ok(())
}

#[tokio::test]
async fn verification_token_redeemed_twice_at_once_activates_once() -> Result<()> {
    let world = world(false)?;
    register(&world, "kj@nasa.test").await?;
    let token = verification_token(&world, "kj@nasa.test").await?;

    let client = client();
    let (first, second) = tokio::join!(
        world.lifecycle.verify_email(&token, None, &client),
        world.lifecycle.verify_email(&token, None, &client)
    );
    let activated = [&first, &second]
        .iter()
        .filter(|result| result.is_ok())
        .count();
    assert_eq!(activated, 1);
    for result in [first, second] {
        if let Err(err) = result {
            assert!(
                matches!(
                    err,
                    CredentialError::InvalidVerificationToken { .. }
                        | CredentialError::EmailAlreadyVerified { .. }
                ),
                "unexpected error: {err:?}"
            );
        }
    }

    let user = world
        .stores
        .users
        .find_user_by_email("kj@nasa.test")
        .await?
        .ok_or_else(|| anyhow!("missing user"))?;
    assert!(user.is_email_verified);
    assert!(user.email_verification.is_none());
    Ok(())
}
