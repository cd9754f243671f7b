//! Email dispatch and delivery abstractions.
//!
//! Credential flows hand messages to an [`EmailDispatcher`], a bounded tokio channel, and return
//! without waiting. A background worker drains the channel and hands each message to an
//! [`EmailSender`]. Failed deliveries are retried with exponential backoff and jitter until
//! `max_attempts` is reached, then logged and dropped; a send failure never reaches the request
//! that triggered it.
//!
//! The default sender for local dev is `LogEmailSender`, which logs and returns `Ok(())`.
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub const TEMPLATE_VERIFY_EMAIL: &str = "verify_email";
pub const TEMPLATE_PASSWORD_RESET: &str = "password_reset";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: String,
    pub payload_json: String,
}

#[derive(Serialize)]
struct LinkPayload<'a> {
    name: &'a str,
    url: &'a str,
    expires_at: DateTime<Utc>,
}

impl EmailMessage {
    /// # Errors
    /// Returns an error if the payload cannot be serialized.
    pub fn verification(
        to_email: &str,
        name: &str,
        url: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Self> {
        Self::with_link(TEMPLATE_VERIFY_EMAIL, to_email, name, url, expires_at)
    }

    /// # Errors
    /// Returns an error if the payload cannot be serialized.
    pub fn password_reset(
        to_email: &str,
        name: &str,
        url: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Self> {
        Self::with_link(TEMPLATE_PASSWORD_RESET, to_email, name, url, expires_at)
    }

    fn with_link(
        template: &str,
        to_email: &str,
        name: &str,
        url: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Self> {
        let payload = LinkPayload {
            name,
            url,
            expires_at,
        };
        Ok(Self {
            to_email: to_email.to_string(),
            template: template.to_string(),
            payload_json: serde_json::to_string(&payload)?,
        })
    }
}

/// Email delivery abstraction used by the dispatch worker.
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error to schedule a retry.
    ///
    /// # Errors
    /// Any error counts as a failed attempt.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender that logs the template instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        // The payload carries a live token link, keep it out of logs.
        info!(
            to_email = %message.to_email,
            template = %message.template,
            "email send stub"
        );
        Ok(())
    }
}

/// Verification link sent to the user. The token rides in the fragment so it stays out of
/// server logs and referrers.
#[must_use]
pub fn build_verify_url(frontend_base_url: &str, token: &str) -> String {
    let base = frontend_base_url.trim_end_matches('/');
    format!("{base}/verify-email#token={token}")
}

#[must_use]
pub fn build_reset_url(frontend_base_url: &str, token: &str) -> String {
    let base = frontend_base_url.trim_end_matches('/');
    format!("{base}/reset-password#token={token}")
}

#[derive(Clone, Copy, Debug)]
pub struct EmailWorkerConfig {
    queue_capacity: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl EmailWorkerConfig {
    /// Default worker config: room for 1024 queued messages, 5 max attempts, and 5s->5m
    /// exponential backoff with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base_seconds(mut self, seconds: u64) -> Self {
        self.backoff_base = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_max_seconds(mut self, seconds: u64) -> Self {
        self.backoff_max = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        let queue_capacity = self.queue_capacity.max(1);
        let max_attempts = self.max_attempts.max(1);
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_secs(1)
        } else {
            self.backoff_base
        };
        let backoff_max = if self.backoff_max < backoff_base {
            backoff_base
        } else {
            self.backoff_max
        };
        Self {
            queue_capacity,
            max_attempts,
            backoff_base,
            backoff_max,
        }
    }

    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        self.backoff_max
    }
}

impl Default for EmailWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap handle for queueing outgoing email.
#[derive(Clone, Debug)]
pub struct EmailDispatcher {
    queue: mpsc::Sender<EmailMessage>,
}

impl EmailDispatcher {
    /// Create a dispatcher and the receiving end to pass to [`spawn_email_worker`].
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EmailMessage>) {
        let (queue, receiver) = mpsc::channel(capacity.max(1));
        (Self { queue }, receiver)
    }

    /// Queue a message without waiting.
    ///
    /// # Errors
    /// Returns an error if the queue is full or the worker has stopped.
    pub fn enqueue(&self, message: EmailMessage) -> Result<()> {
        match self.queue.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                Err(anyhow!("email queue is full, dropping {}", message.template))
            }
            Err(TrySendError::Closed(message)) => Err(anyhow!(
                "email worker stopped, dropping {}",
                message.template
            )),
        }
    }
}

/// Spawn a background task that drains the queue. Each message is delivered on its own task so
/// one slow retry does not hold up the rest.
pub fn spawn_email_worker(
    mut receiver: mpsc::Receiver<EmailMessage>,
    sender: Arc<dyn EmailSender>,
    config: EmailWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.normalize();
        while let Some(message) = receiver.recv().await {
            let sender = sender.clone();
            tokio::spawn(async move {
                deliver(sender.as_ref(), &message, &config).await;
            });
        }
        debug!("email queue closed, worker exiting");
    })
}

/// Returns the number of attempts used, or `None` if every attempt failed.
async fn deliver(
    sender: &dyn EmailSender,
    message: &EmailMessage,
    config: &EmailWorkerConfig,
) -> Option<u32> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match sender.send(message) {
            Ok(()) => return Some(attempt),
            Err(err) if attempt >= config.max_attempts() => {
                error!(
                    to_email = %message.to_email,
                    template = %message.template,
                    attempts = attempt,
                    "email delivery failed: {err}"
                );
                return None;
            }
            Err(err) => {
                let delay = backoff_delay(attempt, config.backoff_base(), config.backoff_max());
                warn!(
                    to_email = %message.to_email,
                    template = %message.template,
                    attempt,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "email delivery failed, retrying: {err}"
                );
                sleep(delay).await;
            }
        }
    }
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    let capped = if delay > max { max } else { delay };
    jitter_delay(capped)
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}
