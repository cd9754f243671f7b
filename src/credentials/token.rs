//! Opaque token generation and HS256 access tokens.

use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const ALG_HS256: &str = "HS256";

/// Byte length for session and refresh tokens.
pub const SESSION_TOKEN_BYTES: usize = 32;
/// Byte length for email verification and password reset tokens.
pub const VERIFICATION_TOKEN_BYTES: usize = 64;

/// Random bytes from the OS, base64url encoded without padding.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn secure_token(byte_length: usize) -> Result<String> {
    let mut bytes = vec![0u8; byte_length];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate secure token")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Hash an opaque token so raw values never reach storage. Lookups use the hash.
#[must_use]
pub fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("invalid signing key")]
    InvalidKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid audience")]
    InvalidAudience,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct AccessTokenHeader {
    alg: String,
    typ: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct AccessTokenClaims {
    pub sub: String,
    pub email: String,
    pub name: String,
    pub sid: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Who the access token is about. Roles and permissions are resolved by the caller at issue time.
#[derive(Debug, Clone)]
pub struct SubjectClaims {
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
    pub session_id: Uuid,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SignedAccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| TokenError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Signs and verifies compact HS256 tokens with a server-held secret.
#[derive(Clone, Debug)]
pub struct AccessTokenSigner {
    secret: SecretString,
    issuer: String,
    audience: String,
}

impl AccessTokenSigner {
    #[must_use]
    pub fn new(secret: SecretString, issuer: String, audience: String) -> Self {
        Self {
            secret,
            issuer,
            audience,
        }
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| TokenError::InvalidKey)
    }

    /// Issue a token for `subject` valid for `ttl` from `now`.
    ///
    /// # Errors
    /// Returns an error if the claims cannot be encoded.
    pub fn sign(
        &self,
        subject: &SubjectClaims,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<SignedAccessToken, TokenError> {
        let expires_at = now + ttl;
        let header = AccessTokenHeader {
            alg: ALG_HS256.to_string(),
            typ: "JWT".to_string(),
        };
        let claims = AccessTokenClaims {
            sub: subject.user_id.to_string(),
            email: subject.email.clone(),
            name: subject.name.clone(),
            sid: subject.session_id.to_string(),
            roles: subject.roles.clone(),
            permissions: subject.permissions.clone(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let signing_input = format!("{}.{}", b64e_json(&header)?, b64e_json(&claims)?);
        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = Base64UrlUnpadded::encode_string(&mac.finalize().into_bytes());

        Ok(SignedAccessToken {
            token: format!("{signing_input}.{signature}"),
            expires_at,
        })
    }

    /// Verify signature, algorithm, issuer, audience and expiry, then return the claims.
    ///
    /// # Errors
    /// Returns the first check that fails.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<AccessTokenClaims, TokenError> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
        let claims_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
        let sig_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
        if parts.next().is_some() {
            return Err(TokenError::TokenFormat);
        }

        let header: AccessTokenHeader = b64d_json(header_b64)?;
        if header.alg != ALG_HS256 {
            return Err(TokenError::UnsupportedAlg(header.alg));
        }

        let signature = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| TokenError::Base64)?;
        let mut mac = self.mac()?;
        mac.update(format!("{header_b64}.{claims_b64}").as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let claims: AccessTokenClaims = b64d_json(claims_b64)?;
        if claims.iss != self.issuer {
            return Err(TokenError::InvalidIssuer);
        }
        if claims.aud != self.audience {
            return Err(TokenError::InvalidAudience);
        }
        if claims.exp <= now.timestamp() {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }
}
