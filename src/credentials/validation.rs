//! Input checks shared by registration and password reset.

use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};

use super::error::{CredentialError, CredentialResult};

pub const MAX_EMAIL_LENGTH: usize = 254;
pub const MIN_PASSWORD_LENGTH: usize = 8;
pub const MAX_PASSWORD_LENGTH: usize = 128;
pub const MAX_NAME_LENGTH: usize = 100;

static EMAIL_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").ok());

#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Format check on already-normalized input.
#[must_use]
pub fn valid_email(email_normalized: &str) -> bool {
    email_normalized.len() <= MAX_EMAIL_LENGTH
        && EMAIL_RE
            .as_ref()
            .is_some_and(|regex| regex.is_match(email_normalized))
}

/// Normalize and check an email, returning the normalized form.
///
/// # Errors
/// Returns a validation error for the `email` field.
pub fn require_email(email: &str) -> CredentialResult<String> {
    let normalized = normalize_email(email);
    if normalized.is_empty() {
        return Err(CredentialError::validation("email", "email is required"));
    }
    if !valid_email(&normalized) {
        return Err(CredentialError::validation("email", "invalid email format"));
    }
    Ok(normalized)
}

/// # Errors
/// Returns a validation error naming `field` when the password is too weak.
pub fn require_strong_password(field: &str, password: &SecretString) -> CredentialResult<()> {
    let password = password.expose_secret();
    let length = password.chars().count();
    if length < MIN_PASSWORD_LENGTH {
        return Err(CredentialError::validation(
            field,
            format!("password must be at least {MIN_PASSWORD_LENGTH} characters"),
        ));
    }
    if length > MAX_PASSWORD_LENGTH {
        return Err(CredentialError::validation(
            field,
            format!("password must be at most {MAX_PASSWORD_LENGTH} characters"),
        ));
    }

    let has_lower = password.chars().any(char::is_lowercase);
    let has_upper = password.chars().any(char::is_uppercase);
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_symbol = password
        .chars()
        .any(|c| !c.is_alphanumeric() && !c.is_whitespace());
    if !(has_lower && has_upper && has_digit && has_symbol) {
        return Err(CredentialError::validation(
            field,
            "password must contain upper and lower case letters, a digit and a symbol",
        ));
    }
    Ok(())
}

/// # Errors
/// Returns a validation error on `confirm_password` if the values differ.
pub fn require_matching(password: &SecretString, confirm: &SecretString) -> CredentialResult<()> {
    if password.expose_secret() != confirm.expose_secret() {
        return Err(CredentialError::validation(
            "confirm_password",
            "passwords do not match",
        ));
    }
    Ok(())
}

/// Trim a name and check its length.
///
/// # Errors
/// Returns a validation error naming `field`.
pub fn require_name(field: &str, value: &str) -> CredentialResult<String> {
    let trimmed = value.trim();
    let length = trimmed.chars().count();
    if length == 0 {
        return Err(CredentialError::validation(field, "is required"));
    }
    if length > MAX_NAME_LENGTH {
        return Err(CredentialError::validation(
            field,
            format!("must be at most {MAX_NAME_LENGTH} characters"),
        ));
    }
    Ok(trimmed.to_string())
}

/// Accept 10 to 15 digits with an optional leading `+`. Spaces and dashes are dropped.
///
/// # Errors
/// Returns a validation error on `phone_number`.
pub fn normalize_phone(value: Option<&str>) -> CredentialResult<Option<String>> {
    let Some(raw) = value.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(None);
    };

    let compact: String = raw.chars().filter(|c| *c != ' ' && *c != '-').collect();
    let digits = compact.strip_prefix('+').unwrap_or(&compact);
    if !(10..=15).contains(&digits.len()) || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(CredentialError::validation(
            "phone_number",
            "phone number must be 10 to 15 digits",
        ));
    }
    Ok(Some(compact))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(err: CredentialError) -> String {
        match err {
            CredentialError::Validation { field, .. } => field,
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email(" Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn valid_email_accepts_basic_format() {
        assert!(valid_email("a@example.com"));
        assert!(valid_email("first.last+tag@mail.example.co"));
        assert!(!valid_email("not-an-email"));
        assert!(!valid_email("a@example"));
        assert!(!valid_email("a b@example.com"));
    }

    #[test]
    fn valid_email_rejects_overlong() {
        let local = "a".repeat(250);
        assert!(!valid_email(&format!("{local}@example.com")));
    }

    #[test]
    fn require_email_returns_normalized() -> anyhow::Result<()> {
        assert_eq!(require_email("  Bob@X.com")?, "bob@x.com");
        assert_eq!(field_of(require_email("   ").unwrap_err()), "email");
        Ok(())
    }

    #[test]
    fn strong_password_rules() {
        let ok = SecretString::from("Str0ng!Pass");
        assert!(require_strong_password("password", &ok).is_ok());

        for weak in ["Sh0rt!", "alllower1!", "ALLUPPER1!", "NoDigits!!", "NoSymbol12"] {
            let weak = SecretString::from(weak);
            let err = require_strong_password("password", &weak).unwrap_err();
            assert_eq!(field_of(err), "password");
        }

        let long = SecretString::from(format!("Aa1!{}", "x".repeat(MAX_PASSWORD_LENGTH)));
        assert!(require_strong_password("new_password", &long).is_err());
    }

    #[test]
    fn confirm_password_must_match() {
        let a = SecretString::from("Str0ng!Pass");
        let b = SecretString::from("Str0ng!Pass2");
        assert!(require_matching(&a, &a.clone()).is_ok());
        assert_eq!(field_of(require_matching(&a, &b).unwrap_err()), "confirm_password");
    }

    #[test]
    fn names_are_trimmed_and_bounded() -> anyhow::Result<()> {
        assert_eq!(require_name("first_name", "  Ada ")?, "Ada");
        assert_eq!(field_of(require_name("last_name", " ").unwrap_err()), "last_name");
        let long = "n".repeat(MAX_NAME_LENGTH + 1);
        assert!(require_name("first_name", &long).is_err());
        Ok(())
    }

    #[test]
    fn phone_numbers() -> anyhow::Result<()> {
        assert_eq!(normalize_phone(None)?, None);
        assert_eq!(normalize_phone(Some("  "))?, None);
        assert_eq!(
            normalize_phone(Some("+1 555-123-4567"))?,
            Some("+15551234567".to_string())
        );
        assert!(normalize_phone(Some("12345")).is_err());
        assert!(normalize_phone(Some("555-CALL-NOW1")).is_err());
        Ok(())
    }
}
