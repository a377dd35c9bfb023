/// Refresh Tokens and Sessions
///
/// Refresh tokens are:
/// - 16 bytes from the OS entropy source, base64-encoded
/// - Opaque to clients: no decodable structure beyond the random bytes
/// - Single-use: consumed by rotation or logout in the session repository

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;

use crate::auth::claims::SubjectId;
use crate::auth::clock::Clock;
use crate::auth::jwt::AccessToken;
use crate::error::AppError;

const REFRESH_TOKEN_BYTES: usize = 16;

/// Draw a new refresh token id
///
/// # Errors
/// Returns an entropy error if the OS random source fails.
pub fn generate_refresh_token_id() -> Result<String, AppError> {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| AppError::Entropy(e.to_string()))?;

    Ok(STANDARD.encode(bytes))
}

#[derive(Clone, PartialEq, Eq)]
pub struct RefreshToken {
    id: String,
    subject_id: SubjectId,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl RefreshToken {
    /// Rebuild a token from already-validated persisted fields. Performs no
    /// validation; callers guarantee the fields came from storage or the factory.
    pub fn from_fields(
        id: String,
        subject_id: SubjectId,
        expires_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            subject_id,
            expires_at,
            created_at,
        }
    }

    /// The bearer secret. Do not log it.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subject_id(&self) -> SubjectId {
        self.subject_id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        clock.now() > self.expires_at
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshToken")
            .field("id", &"<redacted>")
            .field("subject_id", &self.subject_id)
            .field("expires_at", &self.expires_at)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// What a caller gets back from login or refresh. Only the refresh half is durable.
#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
}

/// A rotation result that carries the replacement refresh token to persist
pub trait HasRefreshToken {
    fn refresh_token(&self) -> &RefreshToken;
}

impl HasRefreshToken for RefreshToken {
    fn refresh_token(&self) -> &RefreshToken {
        self
    }
}

impl HasRefreshToken for Session {
    fn refresh_token(&self) -> &RefreshToken {
        &self.refresh_token
    }
}
