use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_JWT_SECRET: &str = "jwt-secret";

/// Token, hashing, cleanup and email settings as parsed from the command line.
pub struct Options {
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
    pub hash: HashOptions,
    pub cleanup: CleanupOptions,
    pub email: EmailOptions,
}

#[derive(Clone, Copy, Debug)]
pub struct HashOptions {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct CleanupOptions {
    pub session_interval_seconds: u64,
    pub token_interval_seconds: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct EmailOptions {
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
}

impl Options {
    /// Collect the auth options from parsed matches.
    ///
    /// # Errors
    /// Returns an error if a required argument is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let jwt_secret = matches
            .get_one::<String>(ARG_JWT_SECRET)
            .cloned()
            .context("missing required argument: --jwt-secret")?;

        Ok(Self {
            jwt_secret: SecretString::from(jwt_secret),
            jwt_issuer: string(matches, "jwt-issuer")?,
            jwt_audience: string(matches, "jwt-audience")?,
            access_token_ttl_seconds: value(matches, "access-token-ttl-seconds")?,
            session_ttl_seconds: value(matches, "session-ttl-seconds")?,
            refresh_ttl_seconds: value(matches, "refresh-ttl-seconds")?,
            frontend_base_url: string(matches, "frontend-base-url")?,
            email_token_ttl_seconds: value(matches, "email-token-ttl-seconds")?,
            password_reset_ttl_seconds: value(matches, "password-reset-ttl-seconds")?,
            resend_interval_seconds: value(matches, "resend-interval-seconds")?,
            hash: HashOptions {
                memory_kib: value(matches, "hash-memory-kib")?,
                iterations: value(matches, "hash-iterations")?,
                parallelism: value(matches, "hash-parallelism")?,
            },
            cleanup: CleanupOptions {
                session_interval_seconds: value(matches, "session-cleanup-interval-seconds")?,
                token_interval_seconds: value(matches, "token-cleanup-interval-seconds")?,
            },
            email: EmailOptions {
                queue_capacity: value(matches, "email-queue-capacity")?,
                max_attempts: value(matches, "email-max-attempts")?,
                backoff_base_seconds: value(matches, "email-backoff-base-seconds")?,
                backoff_max_seconds: value(matches, "email-backoff-max-seconds")?,
            },
        })
    }
}

fn string(matches: &ArgMatches, id: &str) -> Result<String> {
    matches
        .get_one::<String>(id)
        .cloned()
        .with_context(|| format!("missing required argument: --{id}"))
}

fn value<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, id: &str) -> Result<T> {
    matches
        .get_one::<T>(id)
        .cloned()
        .with_context(|| format!("missing required argument: --{id}"))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_token_args(command);
    let command = with_email_link_args(command);
    let command = with_hash_args(command);
    let command = with_cleanup_args(command);
    with_email_dispatch_args(command)
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_JWT_SECRET)
                .long("jwt-secret")
                .help("Shared secret used to sign access tokens")
                .env("ACCREDIT_JWT_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new("jwt-issuer")
                .long("jwt-issuer")
                .help("Issuer claim of access tokens")
                .env("ACCREDIT_JWT_ISSUER")
                .default_value("https://accredit.dev"),
        )
        .arg(
            Arg::new("jwt-audience")
                .long("jwt-audience")
                .help("Audience claim of access tokens")
                .env("ACCREDIT_JWT_AUDIENCE")
                .default_value("accredit"),
        )
        .arg(
            Arg::new("access-token-ttl-seconds")
                .long("access-token-ttl-seconds")
                .help("Access token TTL in seconds")
                .env("ACCREDIT_ACCESS_TOKEN_TTL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new("session-ttl-seconds")
                .long("session-ttl-seconds")
                .help("Session token TTL in seconds")
                .env("ACCREDIT_SESSION_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new("refresh-ttl-seconds")
                .long("refresh-ttl-seconds")
                .help("Refresh token TTL in seconds")
                .env("ACCREDIT_REFRESH_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
}

fn with_email_link_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("frontend-base-url")
                .long("frontend-base-url")
                .help("Frontend base URL used for verification and reset links")
                .env("ACCREDIT_FRONTEND_BASE_URL")
                .default_value("http://localhost:8080"),
        )
        .arg(
            Arg::new("email-token-ttl-seconds")
                .long("email-token-ttl-seconds")
                .help("Email verification token TTL in seconds")
                .env("ACCREDIT_EMAIL_TOKEN_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new("password-reset-ttl-seconds")
                .long("password-reset-ttl-seconds")
                .help("Password reset token TTL in seconds")
                .env("ACCREDIT_PASSWORD_RESET_TTL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new("resend-interval-seconds")
                .long("resend-interval-seconds")
                .help("Minimum wait between verification email resends")
                .env("ACCREDIT_RESEND_INTERVAL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(i64).range(0..)),
        )
}

fn with_hash_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("hash-memory-kib")
                .long("hash-memory-kib")
                .help("Argon2id memory cost in KiB")
                .env("ACCREDIT_HASH_MEMORY_KIB")
                .default_value("65536")
                .value_parser(clap::value_parser!(u32).range(8..)),
        )
        .arg(
            Arg::new("hash-iterations")
                .long("hash-iterations")
                .help("Argon2id iteration count")
                .env("ACCREDIT_HASH_ITERATIONS")
                .default_value("3")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("hash-parallelism")
                .long("hash-parallelism")
                .help("Argon2id lanes")
                .env("ACCREDIT_HASH_PARALLELISM")
                .default_value("1")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
}

fn with_cleanup_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("session-cleanup-interval-seconds")
                .long("session-cleanup-interval-seconds")
                .help("How often expired sessions are swept")
                .env("ACCREDIT_SESSION_CLEANUP_INTERVAL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("token-cleanup-interval-seconds")
                .long("token-cleanup-interval-seconds")
                .help("How often expired verification and reset tokens are cleared")
                .env("ACCREDIT_TOKEN_CLEANUP_INTERVAL_SECONDS")
                .default_value("14400")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}

fn with_email_dispatch_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("email-queue-capacity")
                .long("email-queue-capacity")
                .help("Outgoing email queue size")
                .env("ACCREDIT_EMAIL_QUEUE_CAPACITY")
                .default_value("1024")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("email-max-attempts")
                .long("email-max-attempts")
                .help("Delivery attempts before an email is dropped")
                .env("ACCREDIT_EMAIL_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("email-backoff-base-seconds")
                .long("email-backoff-base-seconds")
                .help("Base delay for email retry backoff")
                .env("ACCREDIT_EMAIL_BACKOFF_BASE_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("email-backoff-max-seconds")
                .long("email-backoff-max-seconds")
                .help("Max delay for email retry backoff")
                .env("ACCREDIT_EMAIL_BACKOFF_MAX_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}
