use chrono::Duration;

use crate::credentials::hasher::HashCost;

pub const DEFAULT_FRONTEND_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: i64 = 60 * 60;
pub const DEFAULT_EMAIL_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;
pub const DEFAULT_PASSWORD_RESET_TTL_SECONDS: i64 = 60 * 60;
pub const DEFAULT_RESEND_INTERVAL_SECONDS: i64 = 5 * 60;

/// Runtime knobs for the credential flows.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    frontend_base_url: String,
    access_token_ttl: Duration,
    email_token_ttl: Duration,
    password_reset_ttl: Duration,
    resend_interval: Duration,
    hash_cost: HashCost,
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            frontend_base_url: DEFAULT_FRONTEND_BASE_URL.to_string(),
            access_token_ttl: Duration::seconds(DEFAULT_ACCESS_TOKEN_TTL_SECONDS),
            email_token_ttl: Duration::seconds(DEFAULT_EMAIL_TOKEN_TTL_SECONDS),
            password_reset_ttl: Duration::seconds(DEFAULT_PASSWORD_RESET_TTL_SECONDS),
            resend_interval: Duration::seconds(DEFAULT_RESEND_INTERVAL_SECONDS),
            hash_cost: HashCost::default(),
        }
    }

    #[must_use]
    pub fn with_frontend_base_url(mut self, url: String) -> Self {
        self.frontend_base_url = url;
        self
    }

    #[must_use]
    pub fn with_access_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_token_ttl = Duration::seconds(seconds.max(1));
        self
    }

    #[must_use]
    pub fn with_email_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.email_token_ttl = Duration::seconds(seconds.max(1));
        self
    }

    #[must_use]
    pub fn with_password_reset_ttl_seconds(mut self, seconds: i64) -> Self {
        self.password_reset_ttl = Duration::seconds(seconds.max(1));
        self
    }

    #[must_use]
    pub fn with_resend_interval_seconds(mut self, seconds: i64) -> Self {
        self.resend_interval = Duration::seconds(seconds.max(0));
        self
    }

    #[must_use]
    pub fn with_hash_cost(mut self, cost: HashCost) -> Self {
        self.hash_cost = cost;
        self
    }

    #[must_use]
    pub fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    #[must_use]
    pub fn access_token_ttl(&self) -> Duration {
        self.access_token_ttl
    }

    #[must_use]
    pub fn email_token_ttl(&self) -> Duration {
        self.email_token_ttl
    }

    #[must_use]
    pub fn password_reset_ttl(&self) -> Duration {
        self.password_reset_ttl
    }

    #[must_use]
    pub fn resend_interval(&self) -> Duration {
        self.resend_interval
    }

    /// Target cost for new hashes and lazy rehash on login.
    #[must_use]
    pub fn hash_cost(&self) -> HashCost {
        self.hash_cost
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}
