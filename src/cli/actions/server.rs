use crate::{
    api,
    credentials::{AccessTokenSigner, AuthConfig, CredentialLifecycle, HashCost, SessionConfig},
    email::{self, EmailDispatcher, EmailWorkerConfig, LogEmailSender},
    jobs::{self, CleanupSchedule},
    store::{PgStore, Stores},
};
use anyhow::{Context, Result};
use chrono::Duration;
use secrecy::SecretString;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub jwt_secret: SecretString,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub access_token_ttl_seconds: i64,
    pub session_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub frontend_base_url: String,
    pub email_token_ttl_seconds: i64,
    pub password_reset_ttl_seconds: i64,
    pub resend_interval_seconds: i64,
    pub hash_memory_kib: u32,
    pub hash_iterations: u32,
    pub hash_parallelism: u32,
    pub session_cleanup_interval_seconds: u64,
    pub token_cleanup_interval_seconds: u64,
    pub email_queue_capacity: usize,
    pub email_max_attempts: u32,
    pub email_backoff_base_seconds: u64,
    pub email_backoff_max_seconds: u64,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable, the configuration is rejected, or the server
/// fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let stores = connect_stores(args.dsn.as_deref()).await?;

    let worker_config = EmailWorkerConfig::new()
        .with_queue_capacity(args.email_queue_capacity)
        .with_max_attempts(args.email_max_attempts)
        .with_backoff_base_seconds(args.email_backoff_base_seconds)
        .with_backoff_max_seconds(args.email_backoff_max_seconds)
        .normalize();
    let (dispatcher, queue) = EmailDispatcher::channel(worker_config.queue_capacity());
    let _email_worker = email::spawn_email_worker(queue, Arc::new(LogEmailSender), worker_config);

    let signer = AccessTokenSigner::new(args.jwt_secret, args.jwt_issuer, args.jwt_audience);

    let config = AuthConfig::new()
        .with_frontend_base_url(args.frontend_base_url)
        .with_access_token_ttl_seconds(args.access_token_ttl_seconds)
        .with_email_token_ttl_seconds(args.email_token_ttl_seconds)
        .with_password_reset_ttl_seconds(args.password_reset_ttl_seconds)
        .with_resend_interval_seconds(args.resend_interval_seconds)
        .with_hash_cost(HashCost::new(
            args.hash_memory_kib,
            args.hash_iterations,
            args.hash_parallelism,
        ));
    let session_config = SessionConfig::new()
        .with_session_ttl(Duration::seconds(args.session_ttl_seconds))
        .with_refresh_ttl(Duration::seconds(args.refresh_ttl_seconds));

    let lifecycle = Arc::new(
        CredentialLifecycle::builder(stores, signer, dispatcher)
            .with_config(config)
            .with_session_config(session_config)
            .build()
            .context("Invalid credential configuration")?,
    );

    let schedule = CleanupSchedule::new()
        .with_session_interval_seconds(args.session_cleanup_interval_seconds)
        .with_token_interval_seconds(args.token_cleanup_interval_seconds);
    let cleanup = jobs::spawn_cleanup_jobs(lifecycle.clone(), schedule);

    let served = api::new(args.port, lifecycle).await;

    for job in cleanup {
        job.abort();
    }

    served
}

async fn connect_stores(dsn: Option<&str>) -> Result<Stores> {
    let Some(dsn) = dsn else {
        warn!("No DSN configured, using in-memory stores; data is lost on exit");
        return Ok(Stores::memory());
    };

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(std::time::Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(dsn)
        .await
        .context("Failed to connect to database")?;

    let store = PgStore::new(pool);
    store.apply_schema().await?;
    Ok(Stores::postgres(store))
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        (
            "dsn",
            args.dsn
                .as_deref()
                .map_or_else(|| "memory".to_string(), redact_dsn),
        ),
        ("jwt_issuer", args.jwt_issuer.clone()),
        ("jwt_audience", args.jwt_audience.clone()),
        ("frontend_base_url", args.frontend_base_url.clone()),
        (
            "hash_cost",
            format!(
                "m={},t={},p={}",
                args.hash_memory_kib, args.hash_iterations, args.hash_parallelism
            ),
        ),
        (
            "ttl_seconds",
            format!(
                "access={} session={} refresh={}",
                args.access_token_ttl_seconds, args.session_ttl_seconds, args.refresh_ttl_seconds
            ),
        ),
    ];
    log_entries("Startup configuration", &entries);
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "{} {} - {}\n\n{title}:",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn short_commit(hash: &str) -> String {
    hash.trim().chars().take(7).collect()
}
