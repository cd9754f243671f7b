//! Password hashing with Argon2id PHC strings.
//!
//! The cost lives inside every stored hash, so a deployment can raise `HashCost` and let
//! `needs_rehash` upgrade old hashes on the next successful login.

use anyhow::{anyhow, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

pub const DEFAULT_MEMORY_KIB: u32 = 64 * 1024;
pub const DEFAULT_ITERATIONS: u32 = 3;
pub const DEFAULT_PARALLELISM: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashCost {
    memory_kib: u32,
    iterations: u32,
    parallelism: u32,
}

impl HashCost {
    #[must_use]
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            memory_kib,
            iterations,
            parallelism,
        }
    }

    #[must_use]
    pub fn memory_kib(&self) -> u32 {
        self.memory_kib
    }

    #[must_use]
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    #[must_use]
    pub fn parallelism(&self) -> u32 {
        self.parallelism
    }

    fn params(self) -> Result<Params> {
        Params::new(self.memory_kib, self.iterations, self.parallelism, None)
            .map_err(|err| anyhow!("invalid argon2 parameters: {err}"))
    }
}

impl Default for HashCost {
    // Roughly the wall time of bcrypt with work factor 12 on current server hardware.
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_KIB, DEFAULT_ITERATIONS, DEFAULT_PARALLELISM)
    }
}

#[derive(Clone, Debug)]
pub struct CredentialHasher {
    cost: HashCost,
}

impl CredentialHasher {
    /// # Errors
    /// Returns an error if the cost is outside the ranges Argon2 accepts.
    pub fn new(cost: HashCost) -> Result<Self> {
        cost.params()?;
        Ok(Self { cost })
    }

    #[must_use]
    pub fn cost(&self) -> HashCost {
        self.cost
    }

    /// Hash a password into a self-describing PHC string with a fresh random salt.
    ///
    /// # Errors
    /// Returns an error if Argon2 rejects the input.
    pub fn hash(&self, password: &SecretString) -> Result<String> {
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.cost.params()?);
        let salt = SaltString::generate(&mut OsRng);
        let hash = argon
            .hash_password(password.expose_secret().as_bytes(), &salt)
            .map_err(|err| anyhow!("failed to hash password: {err}"))?;
        Ok(hash.to_string())
    }

    /// Check a password against a stored hash. Malformed hashes verify as `false`.
    #[must_use]
    pub fn verify(&self, password: &SecretString, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            debug!("stored password hash is not a valid PHC string");
            return false;
        };
        Argon2::default()
            .verify_password(password.expose_secret().as_bytes(), &parsed)
            .is_ok()
    }

    /// True when the hash was produced with a weaker algorithm or cost than `target`.
    #[must_use]
    pub fn needs_rehash(&self, hash: &str, target: HashCost) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return true;
        };
        if parsed.algorithm != Algorithm::Argon2id.ident() {
            return true;
        }
        let Ok(params) = Params::try_from(&parsed) else {
            return true;
        };
        params.m_cost() < target.memory_kib
            || params.t_cost() < target.iterations
            || params.p_cost() < target.parallelism
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> HashCost {
        HashCost::new(1024, 1, 1)
    }

    #[test]
    fn hash_and_verify() -> Result<()> {
        let hasher = CredentialHasher::new(cheap())?;
        let password = SecretString::from("Str0ng!Passw0rd");
        let hash = hasher.hash(&password)?;

        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify(&password, &hash));
        assert!(!hasher.verify(&SecretString::from("wrong"), &hash));
        Ok(())
    }

    #[test]
    fn hashes_are_salted() -> Result<()> {
        let hasher = CredentialHasher::new(cheap())?;
        let password = SecretString::from("Str0ng!Passw0rd");
        assert_ne!(hasher.hash(&password)?, hasher.hash(&password)?);
        Ok(())
    }

    #[test]
    fn malformed_hash_fails_closed() -> Result<()> {
        let hasher = CredentialHasher::new(cheap())?;
        let password = SecretString::from("anything");
        assert!(!hasher.verify(&password, ""));
        assert!(!hasher.verify(&password, "$2a$12$notreallybcrypt"));
        assert!(!hasher.verify(&password, "$argon2id$v=19$garbage"));
        Ok(())
    }

    #[test]
    fn needs_rehash_when_target_is_higher() -> Result<()> {
        let hasher = CredentialHasher::new(cheap())?;
        let hash = hasher.hash(&SecretString::from("Str0ng!Passw0rd"))?;

        assert!(!hasher.needs_rehash(&hash, cheap()));
        assert!(hasher.needs_rehash(&hash, HashCost::new(2048, 1, 1)));
        assert!(hasher.needs_rehash(&hash, HashCost::new(1024, 2, 1)));
        assert!(hasher.needs_rehash("not-a-hash", cheap()));
        Ok(())
    }

    #[test]
    fn rejects_invalid_cost() {
        assert!(CredentialHasher::new(HashCost::new(1, 0, 0)).is_err());
    }
}
