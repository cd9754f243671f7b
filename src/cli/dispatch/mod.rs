//! Map validated CLI arguments to the action that runs them.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{auth, ARG_DSN, ARG_PORT};
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .filter(|dsn| !dsn.trim().is_empty())
        .cloned();

    let auth = auth::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        jwt_secret: auth.jwt_secret,
        jwt_issuer: auth.jwt_issuer,
        jwt_audience: auth.jwt_audience,
        access_token_ttl_seconds: auth.access_token_ttl_seconds,
        session_ttl_seconds: auth.session_ttl_seconds,
        refresh_ttl_seconds: auth.refresh_ttl_seconds,
        frontend_base_url: auth.frontend_base_url,
        email_token_ttl_seconds: auth.email_token_ttl_seconds,
        password_reset_ttl_seconds: auth.password_reset_ttl_seconds,
        resend_interval_seconds: auth.resend_interval_seconds,
        hash_memory_kib: auth.hash.memory_kib,
        hash_iterations: auth.hash.iterations,
        hash_parallelism: auth.hash.parallelism,
        session_cleanup_interval_seconds: auth.cleanup.session_interval_seconds,
        token_cleanup_interval_seconds: auth.cleanup.token_interval_seconds,
        email_queue_capacity: auth.email.queue_capacity,
        email_max_attempts: auth.email.max_attempts,
        email_backoff_base_seconds: auth.email.backoff_base_seconds,
        email_backoff_max_seconds: auth.email.backoff_max_seconds,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn dsn_is_optional() {
        temp_env::with_vars(
            [
                ("ACCREDIT_DSN", None::<&str>),
                ("ACCREDIT_JWT_SECRET", Some("env-secret")),
                ("ACCREDIT_PORT", None),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["accredit"]);
                let result = handler(&matches);
                assert!(result.is_ok());
                if let Ok(Action::Server(args)) = result {
                    assert_eq!(args.port, 8080);
                    assert!(args.dsn.is_none());
                    assert_eq!(args.jwt_secret.expose_secret(), "env-secret");
                    assert_eq!(args.jwt_audience, "accredit");
                    assert_eq!(args.hash_memory_kib, 64 * 1024);
                    assert_eq!(args.refresh_ttl_seconds, 7 * 24 * 60 * 60);
                }
            },
        );
    }

    #[test]
    fn blank_dsn_means_memory() {
        temp_env::with_vars(
            [
                ("ACCREDIT_DSN", Some("  ")),
                ("ACCREDIT_JWT_SECRET", Some("env-secret")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["accredit"]);
                let result = handler(&matches);
                assert!(matches!(result, Ok(Action::Server(ref args)) if args.dsn.is_none()));
            },
        );
    }

    #[test]
    fn flags_reach_the_action() {
        temp_env::with_vars([("ACCREDIT_DSN", None::<&str>)], || {
            let matches = crate::cli::commands::new().get_matches_from(vec![
                "accredit",
                "--jwt-secret",
                "cli-secret",
                "--dsn",
                "postgres://accredit@localhost/accredit",
                "--hash-iterations",
                "2",
                "--email-max-attempts",
                "3",
                "--token-cleanup-interval-seconds",
                "60",
            ]);
            let result = handler(&matches);
            assert!(result.is_ok());
            if let Ok(Action::Server(args)) = result {
                assert_eq!(
                    args.dsn.as_deref(),
                    Some("postgres://accredit@localhost/accredit")
                );
                assert_eq!(args.hash_iterations, 2);
                assert_eq!(args.email_max_attempts, 3);
                assert_eq!(args.token_cleanup_interval_seconds, 60);
            }
        });
    }
}
