//! Periodic maintenance sweeps.
//!
//! Each sweep runs on its own interval for the lifetime of the process. A failed iteration is
//! logged and followed by a fixed pause before the next attempt; the loop never exits on error.

use anyhow::Result;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{interval, sleep, MissedTickBehavior},
};
use tracing::{debug, error, info};

use crate::credentials::CredentialLifecycle;

pub const DEFAULT_SESSION_CLEANUP_INTERVAL_SECONDS: u64 = 60 * 60;
pub const DEFAULT_TOKEN_CLEANUP_INTERVAL_SECONDS: u64 = 4 * 60 * 60;
pub const DEFAULT_FAILURE_BACKOFF_SECONDS: u64 = 30 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanupSchedule {
    session_interval: Duration,
    token_interval: Duration,
    failure_backoff: Duration,
}

impl CleanupSchedule {
    #[must_use]
    pub fn new() -> Self {
        Self {
            session_interval: Duration::from_secs(DEFAULT_SESSION_CLEANUP_INTERVAL_SECONDS),
            token_interval: Duration::from_secs(DEFAULT_TOKEN_CLEANUP_INTERVAL_SECONDS),
            failure_backoff: Duration::from_secs(DEFAULT_FAILURE_BACKOFF_SECONDS),
        }
    }

    #[must_use]
    pub fn with_session_interval_seconds(mut self, seconds: u64) -> Self {
        self.session_interval = Duration::from_secs(seconds.max(1));
        self
    }

    #[must_use]
    pub fn with_token_interval_seconds(mut self, seconds: u64) -> Self {
        self.token_interval = Duration::from_secs(seconds.max(1));
        self
    }

    #[must_use]
    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }

    #[must_use]
    pub fn session_interval(&self) -> Duration {
        self.session_interval
    }

    #[must_use]
    pub fn token_interval(&self) -> Duration {
        self.token_interval
    }

    #[must_use]
    pub fn failure_backoff(&self) -> Duration {
        self.failure_backoff
    }
}

impl Default for CleanupSchedule {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the session and token sweeps. The handles are only needed to stop them.
pub fn spawn_cleanup_jobs(
    lifecycle: Arc<CredentialLifecycle>,
    schedule: CleanupSchedule,
) -> Vec<JoinHandle<()>> {
    let sessions = {
        let lifecycle = lifecycle.clone();
        tokio::spawn(run_sweep(
            "session_cleanup",
            schedule.session_interval(),
            schedule.failure_backoff(),
            move || {
                let lifecycle = lifecycle.clone();
                async move {
                    let expired = lifecycle.cleanup_expired_sessions().await?;
                    Ok(format!("{expired} sessions expired"))
                }
            },
        ))
    };

    let tokens = tokio::spawn(run_sweep(
        "token_cleanup",
        schedule.token_interval(),
        schedule.failure_backoff(),
        move || {
            let lifecycle = lifecycle.clone();
            async move {
                let sweep = lifecycle.cleanup_expired_tokens().await?;
                Ok(format!(
                    "{} verification and {} reset tokens cleared",
                    sweep.email_verification, sweep.password_reset
                ))
            }
        },
    ));

    info!(
        session_interval_secs = schedule.session_interval().as_secs(),
        token_interval_secs = schedule.token_interval().as_secs(),
        "Cleanup jobs started"
    );
    vec![sessions, tokens]
}

async fn run_sweep<F, Fut>(name: &'static str, period: Duration, failure_backoff: Duration, sweep: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match sweep().await {
            Ok(summary) => info!(job = name, "{summary}"),
            Err(err) => {
                error!(job = name, "Cleanup failed: {err:#}");
                debug!(
                    job = name,
                    backoff_secs = failure_backoff.as_secs(),
                    "Pausing before next attempt"
                );
                sleep(failure_backoff).await;
                ticker.reset();
            }
        }
    }
}
