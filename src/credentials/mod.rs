//! Credential and session lifecycle.
//!
//! The building blocks (hashing, tokens, rate limiting, lockout, role resolution, sessions) are
//! usable on their own; [`CredentialLifecycle`] composes them into the account flows the HTTP
//! layer exposes.

pub mod clock;
pub mod error;
pub mod hasher;
pub mod lifecycle;
pub mod lockout;
pub mod permissions;
pub mod rate_limit;
pub mod roles;
pub mod session;
pub mod token;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CredentialError, CredentialResult};
pub use hasher::{CredentialHasher, HashCost};
pub use lifecycle::{AuthConfig, ClientContext, CredentialLifecycle, CredentialLifecycleBuilder};
pub use lockout::LockoutPolicy;
pub use permissions::{EffectiveAccess, PermissionResolver, RoleGraph, RoleGraphError};
pub use rate_limit::{
    MemoryAttemptStore, NoopRateLimiter, RateLimitAction, RateLimitDecision, RateLimitPolicy,
    RateLimiter, SlidingWindowRateLimiter,
};
pub use roles::{RoleAdminError, RoleDirectory};
pub use session::{SessionConfig, SessionManager};
pub use token::{AccessTokenClaims, AccessTokenSigner, TokenError};
