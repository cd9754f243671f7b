//! # Accredit (credential and session lifecycle)
//!
//! `accredit` registers users, verifies their email, authenticates them and manages the sessions
//! that follow.
//!
//! ## Credentials
//!
//! Passwords are hashed with Argon2id and upgraded in place on the next successful login when the
//! configured cost rises. Failed logins count towards a progressive lockout, and every flow is
//! gated by a sliding-window rate limiter keyed by action and identifier.
//!
//! ## Sessions
//!
//! A login creates a session carrying an opaque session token and a single-use refresh token. Only
//! SHA-256 digests of both are stored. A short-lived HS256 access token carries the effective
//! roles and permissions resolved from the role graph at issue time.
//!
//! ## Surfaces
//!
//! [`credentials::CredentialLifecycle`] is the programmatic entry point. [`api`] exposes it over
//! HTTP and [`cli`] wires configuration, storage, email dispatch and the cleanup jobs together.

pub mod api;
pub mod cli;
pub mod credentials;
pub mod email;
pub mod jobs;
pub mod model;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
