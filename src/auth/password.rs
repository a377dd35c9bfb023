/// Password Hashing and Verification
///
/// bcrypt only looks at the first 72 bytes of its input. To keep long
/// passwords fully significant, every password is first reduced to an
/// HMAC-SHA-512 digest keyed by a server-side pepper, base64-encoded, and only
/// the first 72 bytes of that encoding are handed to bcrypt.
///
/// The pepper is never stored next to the hashes. Losing or changing it makes
/// every stored hash unverifiable; there is no recovery path short of a
/// password reset for every account.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha512;
use std::sync::Arc;

use crate::configuration::PasswordSettings;
use crate::error::{AppError, ValidationError};

type HmacSha512 = Hmac<Sha512>;

/// bcrypt ignores input past this length
const BCRYPT_MAX_INPUT: usize = 72;
const BCRYPT_MIN_COST: u32 = 4;
const BCRYPT_MAX_COST: u32 = 31;

const MIN_PASSWORD_LENGTH: usize = 8;
const MAX_PASSWORD_LENGTH: usize = 1024;

/// Peppered bcrypt hasher
#[derive(Clone)]
pub struct PasswordHasher {
    pepper: Arc<[u8]>,
    cost: u32,
}

impl std::fmt::Debug for PasswordHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordHasher")
            .field("cost", &self.cost)
            .finish_non_exhaustive()
    }
}

impl PasswordHasher {
    /// # Errors
    /// Fails with an invalid-configuration error when the pepper is empty or
    /// the cost is outside bcrypt's accepted range.
    pub fn new(pepper: impl AsRef<[u8]>, cost: u32) -> Result<Self, AppError> {
        let pepper = pepper.as_ref();
        if pepper.is_empty() {
            return Err(AppError::invalid_configuration("password pepper must not be empty"));
        }
        if !(BCRYPT_MIN_COST..=BCRYPT_MAX_COST).contains(&cost) {
            return Err(AppError::invalid_configuration(format!(
                "bcrypt cost must be between {} and {}",
                BCRYPT_MIN_COST, BCRYPT_MAX_COST
            )));
        }

        Ok(Self {
            pepper: Arc::from(pepper),
            cost,
        })
    }

    pub fn from_settings(settings: &PasswordSettings) -> Result<Self, AppError> {
        Self::new(settings.pepper.as_bytes(), settings.cost)
    }

    /// Hash a password for storage
    ///
    /// # Errors
    /// Returns a hashing error only if the keyed digest or bcrypt fails.
    pub fn hash(&self, password: &[u8]) -> Result<String, AppError> {
        let peppered = self.peppered(password)?;

        bcrypt::hash(&peppered[..BCRYPT_MAX_INPUT], self.cost)
            .map_err(|e| AppError::Hashing(e.to_string()))
    }

    /// Compare a password against a stored hash.
    ///
    /// Never fails: any internal error, including a malformed hash, is a mismatch.
    pub fn compare(&self, hash: &str, password: &[u8]) -> bool {
        let peppered = match self.peppered(password) {
            Ok(peppered) => peppered,
            Err(e) => {
                tracing::error!(error = %e, "Password digest failed during comparison");
                return false;
            }
        };

        match bcrypt::verify(&peppered[..BCRYPT_MAX_INPUT], hash) {
            Ok(matches) => matches,
            Err(e) => {
                tracing::warn!(error = %e, "Stored password hash could not be verified");
                false
            }
        }
    }

    /// base64(HMAC-SHA-512(pepper, password)); 88 bytes, always past the bcrypt limit
    fn peppered(&self, password: &[u8]) -> Result<Vec<u8>, AppError> {
        let mut mac = HmacSha512::new_from_slice(&self.pepper)
            .map_err(|e| AppError::Hashing(e.to_string()))?;
        mac.update(password);

        Ok(STANDARD.encode(mac.finalize().into_bytes()).into_bytes())
    }
}

/// Validate password strength requirements for a new password
///
/// Requirements:
/// - Minimum 8 characters
/// - At least one digit
/// - At least one lowercase letter
/// - At least one uppercase letter
///
/// The upper bound only guards the HMAC step against absurd inputs; the
/// bcrypt limit no longer applies.
pub fn validate_password_strength(password: &str) -> Result<(), AppError> {
    if password.is_empty() {
        return Err(ValidationError::EmptyField("password".to_string()).into());
    }

    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(ValidationError::TooShort("password".to_string(), MIN_PASSWORD_LENGTH).into());
    }

    if password.len() > MAX_PASSWORD_LENGTH {
        return Err(ValidationError::TooLong("password".to_string(), MAX_PASSWORD_LENGTH).into());
    }

    let has_digit = password.chars().any(|c| c.is_numeric());
    let has_lowercase = password.chars().any(|c| c.is_lowercase());
    let has_uppercase = password.chars().any(|c| c.is_uppercase());

    if !has_digit || !has_lowercase || !has_uppercase {
        return Err(ValidationError::InvalidFormat(
            "password must contain at least one digit, one lowercase letter, and one uppercase letter"
                .to_string(),
        )
        .into());
    }

    Ok(())
}
