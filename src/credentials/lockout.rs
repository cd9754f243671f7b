//! Exponential account lockout.
//!
//! After `max_failed_attempts` failures the account is locked for
//! `2^(failed - max + 1)` minutes, capped at `max_lockout`. A lock is never lifted on time
//! alone: the next login observes the expiry and a successful one resets the account.

use chrono::{DateTime, Duration, Utc};

use crate::model::{User, UserStatus};

pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;
pub const DEFAULT_MAX_LOCKOUT_MINUTES: i64 = 24 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockoutPolicy {
    max_failed_attempts: u32,
    max_lockout: Duration,
}

impl LockoutPolicy {
    #[must_use]
    pub fn new(max_failed_attempts: u32, max_lockout: Duration) -> Self {
        Self {
            max_failed_attempts: max_failed_attempts.max(1),
            max_lockout,
        }
    }

    #[must_use]
    pub fn max_failed_attempts(&self) -> u32 {
        self.max_failed_attempts
    }

    /// Lock length for a failure count, or `None` while still under the threshold.
    #[must_use]
    pub fn lockout_duration(&self, failed_attempts: u32) -> Option<Duration> {
        if failed_attempts < self.max_failed_attempts {
            return None;
        }
        let exponent = failed_attempts - self.max_failed_attempts + 1;
        let minutes = 1i64
            .checked_shl(exponent)
            .filter(|minutes| *minutes > 0)
            .unwrap_or(i64::MAX);
        let duration = Duration::try_minutes(minutes).unwrap_or(self.max_lockout);
        Some(duration.min(self.max_lockout))
    }

    /// Attempts left before the next failure locks the account.
    #[must_use]
    pub fn remaining_attempts(&self, failed_attempts: u32) -> u32 {
        self.max_failed_attempts.saturating_sub(failed_attempts)
    }

    pub fn on_failed_login(&self, user: &mut User, now: DateTime<Utc>) {
        user.failed_login_attempts = user.failed_login_attempts.saturating_add(1);
        if let Some(duration) = self.lockout_duration(user.failed_login_attempts) {
            user.locked_until = Some(now + duration);
            user.status = UserStatus::Blocked;
        }
        user.updated_at = now;
    }

    pub fn on_successful_login(&self, user: &mut User, now: DateTime<Utc>) {
        user.failed_login_attempts = 0;
        user.locked_until = None;
        if user.status == UserStatus::Blocked {
            user.status = UserStatus::Active;
        }
        user.last_login_at = Some(now);
        user.updated_at = now;
    }

    #[must_use]
    pub fn is_locked(&self, user: &User, now: DateTime<Utc>) -> bool {
        user.is_locked(now)
    }
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_FAILED_ATTEMPTS,
            Duration::minutes(DEFAULT_MAX_LOCKOUT_MINUTES),
        )
    }
}
