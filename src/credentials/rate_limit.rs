//! Sliding-window rate limiting for credential flows.
//!
//! Each `(action, subject)` pair owns an ordered list of attempt timestamps kept in an
//! [`AttemptStore`]. Timestamps older than the action window are pruned whenever the list is
//! read or written, and the stored entry expires `window + 5 minutes` after its last write.
//!
//! `can_proceed` and `record_attempt` are separate calls. A race between them can count one
//! extra attempt; it never lets a caller past the limit without that attempt being recorded.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::clock::Clock;

const ENTRY_GRACE_MINUTES: i64 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    Registration,
    Login,
    RefreshToken,
    EmailVerification,
    ResendVerification,
    PasswordReset,
}

impl RateLimitAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registration => "user_registration",
            Self::Login => "login",
            Self::RefreshToken => "refresh_token",
            Self::EmailVerification => "email_verification",
            Self::ResendVerification => "resend_verification",
            Self::PasswordReset => "password_reset",
        }
    }
}

impl fmt::Display for RateLimitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitRule {
    max_attempts: u32,
    window: Duration,
}

impl RateLimitRule {
    #[must_use]
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
        }
    }

    #[must_use]
    pub fn per_minutes(max_attempts: u32, minutes: i64) -> Self {
        Self::new(max_attempts, Duration::minutes(minutes))
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Per-action limits. Actions without a rule are never limited.
#[derive(Clone, Debug)]
pub struct RateLimitPolicy {
    rules: HashMap<RateLimitAction, RateLimitRule>,
}

impl RateLimitPolicy {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_rule(mut self, action: RateLimitAction, rule: RateLimitRule) -> Self {
        self.rules.insert(action, rule);
        self
    }

    #[must_use]
    pub fn rule(&self, action: RateLimitAction) -> Option<RateLimitRule> {
        self.rules.get(&action).copied()
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::empty()
            .with_rule(
                RateLimitAction::Registration,
                RateLimitRule::per_minutes(3, 60),
            )
            .with_rule(RateLimitAction::Login, RateLimitRule::per_minutes(5, 15))
            .with_rule(
                RateLimitAction::RefreshToken,
                RateLimitRule::per_minutes(20, 15),
            )
            .with_rule(
                RateLimitAction::EmailVerification,
                RateLimitRule::per_minutes(10, 60),
            )
            .with_rule(
                RateLimitAction::ResendVerification,
                RateLimitRule::per_minutes(3, 60),
            )
            .with_rule(
                RateLimitAction::PasswordReset,
                RateLimitRule::per_minutes(3, 60),
            )
    }
}

/// Expiring key-value storage for attempt windows.
///
/// `update` must apply the closure atomically per key so concurrent writers never lose an
/// attempt. A shared cache backend can implement this with a server-side script or CAS loop.
pub trait AttemptStore: Send + Sync {
    fn load(&self, key: &str, now: DateTime<Utc>) -> Vec<DateTime<Utc>>;

    fn update(
        &self,
        key: &str,
        now: DateTime<Utc>,
        ttl: Duration,
        apply: &mut dyn FnMut(&mut Vec<DateTime<Utc>>),
    );
}

#[derive(Debug)]
struct AttemptEntry {
    attempts: Vec<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
}

/// Single-instance attempt store. The map shard lock serializes writers of the same key.
#[derive(Debug, Default)]
pub struct MemoryAttemptStore {
    entries: DashMap<String, AttemptEntry>,
}

impl MemoryAttemptStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries whose TTL has passed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

impl AttemptStore for MemoryAttemptStore {
    fn load(&self, key: &str, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => entry.attempts.clone(),
            _ => Vec::new(),
        }
    }

    fn update(
        &self,
        key: &str,
        now: DateTime<Utc>,
        ttl: Duration,
        apply: &mut dyn FnMut(&mut Vec<DateTime<Utc>>),
    ) {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| AttemptEntry {
                attempts: Vec::new(),
                expires_at: now,
            });
        if entry.expires_at <= now {
            entry.attempts.clear();
        }
        apply(&mut entry.attempts);
        entry.expires_at = now + ttl;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after: Duration },
}

pub trait RateLimiter: Send + Sync {
    fn can_proceed(&self, subject: &str, action: RateLimitAction) -> bool;

    fn record_attempt(&self, subject: &str, action: RateLimitAction);

    fn remaining_cooldown(&self, subject: &str, action: RateLimitAction) -> Duration;

    fn check(&self, subject: &str, action: RateLimitAction) -> RateLimitDecision {
        if self.can_proceed(subject, action) {
            RateLimitDecision::Allowed
        } else {
            RateLimitDecision::Limited {
                retry_after: self.remaining_cooldown(subject, action),
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn can_proceed(&self, _subject: &str, _action: RateLimitAction) -> bool {
        true
    }

    fn record_attempt(&self, _subject: &str, _action: RateLimitAction) {}

    fn remaining_cooldown(&self, _subject: &str, _action: RateLimitAction) -> Duration {
        Duration::zero()
    }
}

pub struct SlidingWindowRateLimiter {
    policy: RateLimitPolicy,
    store: Arc<dyn AttemptStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowRateLimiter {
    #[must_use]
    pub fn new(policy: RateLimitPolicy, store: Arc<dyn AttemptStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            store,
            clock,
        }
    }

    fn key(subject: &str, action: RateLimitAction) -> String {
        format!("rate_limit:{action}:{subject}")
    }

    fn window_attempts(
        &self,
        subject: &str,
        action: RateLimitAction,
        rule: RateLimitRule,
        now: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let cutoff = now - rule.window();
        let mut attempts = self.store.load(&Self::key(subject, action), now);
        attempts.retain(|at| *at > cutoff);
        attempts
    }
}

impl RateLimiter for SlidingWindowRateLimiter {
    fn can_proceed(&self, subject: &str, action: RateLimitAction) -> bool {
        let Some(rule) = self.policy.rule(action) else {
            return true;
        };
        let now = self.clock.now();
        let attempts = self.window_attempts(subject, action, rule, now);
        u32::try_from(attempts.len()).unwrap_or(u32::MAX) < rule.max_attempts()
    }

    fn record_attempt(&self, subject: &str, action: RateLimitAction) {
        let Some(rule) = self.policy.rule(action) else {
            return;
        };
        let now = self.clock.now();
        let cutoff = now - rule.window();
        let ttl = rule.window() + Duration::minutes(ENTRY_GRACE_MINUTES);
        self.store
            .update(
                &Self::key(subject, action),
                now,
                ttl,
                &mut |attempts: &mut Vec<DateTime<Utc>>| {
                    attempts.retain(|at| *at > cutoff);
                    attempts.push(now);
                },
            );
    }

    fn remaining_cooldown(&self, subject: &str, action: RateLimitAction) -> Duration {
        let Some(rule) = self.policy.rule(action) else {
            return Duration::zero();
        };
        let now = self.clock.now();
        let attempts = self.window_attempts(subject, action, rule, now);
        if u32::try_from(attempts.len()).unwrap_or(u32::MAX) < rule.max_attempts() {
            return Duration::zero();
        }
        attempts
            .iter()
            .min()
            .map_or_else(Duration::zero, |oldest| {
                (*oldest + rule.window() - now).max(Duration::zero())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::clock::ManualClock;

    fn limiter(policy: RateLimitPolicy) -> (SlidingWindowRateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter =
            SlidingWindowRateLimiter::new(policy, Arc::new(MemoryAttemptStore::new()), clock.clone());
        (limiter, clock)
    }

    #[test]
    fn noop_rate_limiter_allows() {
        let limiter = NoopRateLimiter;
        limiter.record_attempt("1.2.3.4", RateLimitAction::Login);
        assert!(limiter.can_proceed("1.2.3.4", RateLimitAction::Login));
        assert_eq!(
            limiter.check("1.2.3.4", RateLimitAction::Registration),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn window_blocks_then_slides_open() {
        let policy = RateLimitPolicy::empty().with_rule(
            RateLimitAction::ResendVerification,
            RateLimitRule::per_minutes(3, 60),
        );
        let (limiter, clock) = limiter(policy);
        let action = RateLimitAction::ResendVerification;

        for _ in 0..3 {
            assert!(limiter.can_proceed("10.0.0.1", action));
            limiter.record_attempt("10.0.0.1", action);
            clock.advance(Duration::minutes(1));
        }
        assert!(!limiter.can_proceed("10.0.0.1", action));
        // First attempt was 3 minutes ago; it leaves the window after 57 more.
        assert_eq!(
            limiter.remaining_cooldown("10.0.0.1", action),
            Duration::minutes(57)
        );
        assert_eq!(
            limiter.check("10.0.0.1", action),
            RateLimitDecision::Limited {
                retry_after: Duration::minutes(57)
            }
        );

        clock.advance(Duration::minutes(57) + Duration::seconds(1));
        assert!(limiter.can_proceed("10.0.0.1", action));
        assert_eq!(limiter.remaining_cooldown("10.0.0.1", action), Duration::zero());
    }

    #[test]
    fn subjects_and_actions_are_isolated() {
        let (limiter, _clock) = limiter(RateLimitPolicy::default());
        for _ in 0..5 {
            limiter.record_attempt("10.0.0.1", RateLimitAction::Login);
        }
        assert!(!limiter.can_proceed("10.0.0.1", RateLimitAction::Login));
        assert!(limiter.can_proceed("10.0.0.2", RateLimitAction::Login));
        assert!(limiter.can_proceed("10.0.0.1", RateLimitAction::Registration));
    }

    #[test]
    fn unconfigured_action_is_unlimited() {
        let (limiter, _clock) = limiter(RateLimitPolicy::empty());
        for _ in 0..50 {
            limiter.record_attempt("10.0.0.1", RateLimitAction::RefreshToken);
        }
        assert!(limiter.can_proceed("10.0.0.1", RateLimitAction::RefreshToken));
        assert_eq!(
            limiter.remaining_cooldown("10.0.0.1", RateLimitAction::RefreshToken),
            Duration::zero()
        );
    }

    #[test]
    fn entries_expire_after_grace() {
        let store = MemoryAttemptStore::new();
        let now = Utc::now();
        store.update(
            "k",
            now,
            Duration::minutes(65),
            &mut |attempts: &mut Vec<DateTime<Utc>>| attempts.push(now),
        );
        assert_eq!(store.load("k", now + Duration::minutes(64)).len(), 1);
        assert!(store.load("k", now + Duration::minutes(65)).is_empty());
        assert_eq!(store.purge_expired(now + Duration::minutes(66)), 1);
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let policy = RateLimitPolicy::empty()
            .with_rule(RateLimitAction::Login, RateLimitRule::per_minutes(1000, 15));
        let limiter = Arc::new(SlidingWindowRateLimiter::new(
            policy,
            Arc::new(MemoryAttemptStore::new()),
            clock,
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        limiter.record_attempt("10.0.0.9", RateLimitAction::Login);
                    }
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().is_ok());
        }

        let store_view = limiter.window_attempts(
            "10.0.0.9",
            RateLimitAction::Login,
            RateLimitRule::per_minutes(1000, 15),
            limiter.clock.now(),
        );
        assert_eq!(store_view.len(), 400);
    }
}
