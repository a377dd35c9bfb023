/// Token Factory
///
/// Mints and verifies HS256-signed access tokens, mints opaque refresh
/// tokens, and composes both into a [`Session`]. Holds no durable state: the
/// output is a function of the signing secret and the injected clock.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::claims::{Claims, Role, SubjectId};
use crate::auth::clock::Clock;
use crate::auth::refresh_token::{generate_refresh_token_id, RefreshToken, Session};
use crate::configuration::JwtSettings;
use crate::error::{AppError, AuthError};

const ALGORITHM: Algorithm = Algorithm::HS256;

/// Registered claims plus the custom role claim, as serialized on the wire
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    sub: String,
    iat: i64,
    exp: i64,
    iss: String,
    custom: CustomClaims,
}

#[derive(Debug, Serialize, Deserialize)]
struct CustomClaims {
    role: Role,
}

/// A signed, self-contained access token. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    claims: Claims,
    signed: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// The compact `header.payload.signature` form handed to clients
    pub fn signed(&self) -> &str {
        &self.signed
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        clock.now() > self.expires_at
    }
}

#[derive(Clone)]
pub struct TokenFactory {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    clock: Arc<dyn Clock>,
    access_token_ttl: Duration,
    refresh_token_ttl: Duration,
}

impl TokenFactory {
    /// # Errors
    /// Returns an invalid-configuration error if the secret is empty or
    /// either lifetime is not strictly positive.
    pub fn new(config: &JwtSettings, clock: Arc<dyn Clock>) -> Result<Self, AppError> {
        if config.secret.is_empty() {
            return Err(AppError::invalid_configuration("jwt signing secret must not be empty"));
        }
        if config.access_token_expiry <= 0 {
            return Err(AppError::invalid_configuration("access token lifetime must be positive"));
        }
        if config.refresh_token_expiry <= 0 {
            return Err(AppError::invalid_configuration("refresh token lifetime must be positive"));
        }

        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            clock,
            access_token_ttl: Duration::seconds(config.access_token_expiry),
            refresh_token_ttl: Duration::seconds(config.refresh_token_expiry),
        })
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Mint a signed access token valid for the configured lifetime
    ///
    /// # Errors
    /// Returns a signing error if the MAC primitive fails.
    pub fn new_access_token(&self, claims: &Claims) -> Result<AccessToken, AppError> {
        // JWT timestamps are whole seconds; truncate so the returned expiry
        // matches what a later parse reports.
        let issued_at = self.clock.now().timestamp();
        let expires_at = issued_at + self.access_token_ttl.num_seconds();

        let envelope = Envelope {
            sub: claims.subject().to_string(),
            iat: issued_at,
            exp: expires_at,
            iss: self.issuer.clone(),
            custom: CustomClaims { role: claims.role() },
        };

        let signed = encode(&Header::new(ALGORITHM), &envelope, &self.encoding_key)
            .map_err(|e| AppError::Signing(e.to_string()))?;

        Ok(AccessToken {
            claims: *claims,
            signed,
            expires_at: timestamp(expires_at)?,
        })
    }

    /// Verify a presented access token and rebuild its claims
    ///
    /// # Errors
    /// Returns `InvalidToken` on a bad signature, a header naming any
    /// algorithm other than HS256, a malformed payload, a wrong issuer, an
    /// invalid subject, or an expired token.
    pub fn parse_access_token(&self, token: &str) -> Result<AccessToken, AppError> {
        let mut validation = Validation::new(ALGORITHM);
        // Expiry is checked against the injected clock below.
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["sub", "exp", "iat", "iss"]);
        validation.set_issuer(&[&self.issuer]);

        let envelope = decode::<Envelope>(token, &self.decoding_key, &validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "Access token rejected");
                AuthError::InvalidToken
            })?
            .claims;

        let expires_at = timestamp(envelope.exp).map_err(|_| AuthError::InvalidToken)?;
        if self.clock.now() > expires_at {
            tracing::debug!("Access token expired");
            return Err(AuthError::InvalidToken.into());
        }

        let subject = SubjectId::parse(&envelope.sub)?;

        Ok(AccessToken {
            claims: Claims::new(subject, envelope.custom.role),
            signed: token.to_string(),
            expires_at,
        })
    }

    /// Mint a fresh opaque refresh token for a subject
    ///
    /// # Errors
    /// Fails only if the OS entropy source does.
    pub fn new_refresh_token(&self, subject: SubjectId) -> Result<RefreshToken, AppError> {
        let created_at = self.clock.now();
        let id = generate_refresh_token_id()?;

        Ok(RefreshToken::from_fields(
            id,
            subject,
            created_at + self.refresh_token_ttl,
            created_at,
        ))
    }

    /// One access token plus one refresh token for the same subject. Either
    /// half failing fails the whole session.
    pub fn new_session(&self, claims: &Claims) -> Result<Session, AppError> {
        let access_token = self.new_access_token(claims)?;
        let refresh_token = self.new_refresh_token(claims.subject())?;

        Ok(Session {
            access_token,
            refresh_token,
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, AppError> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| AppError::Signing(format!("timestamp {} out of range", secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    use proptest::prelude::*;

    fn get_test_config() -> JwtSettings {
        JwtSettings {
            secret: "test-secret-key-at-least-32-characters-long".to_string(),
            access_token_expiry: 900,
            refresh_token_expiry: 604800,
            issuer: "test".to_string(),
        }
    }

    fn factory() -> (TokenFactory, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let factory = TokenFactory::new(&get_test_config(), clock.clone()).unwrap();
        (factory, clock)
    }

    fn claims() -> Claims {
        Claims::new(SubjectId::new(), Role::Author)
    }

    #[test]
    fn test_generate_and_parse_token() {
        let (factory, _) = factory();
        let claims = claims();

        let token = factory.new_access_token(&claims).expect("Failed to generate token");
        let parsed = factory.parse_access_token(token.signed()).expect("Failed to parse token");

        assert_eq!(parsed.claims(), &claims);
        assert_eq!(parsed.expires_at(), token.expires_at());
    }

    #[test]
    fn test_access_token_lifetime() {
        let (factory, clock) = factory();
        let token = factory.new_access_token(&claims()).unwrap();

        assert_eq!(token.expires_at() - clock.now(), Duration::seconds(900));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let (factory, clock) = factory();
        let token = factory.new_access_token(&claims()).unwrap();

        clock.advance(Duration::seconds(900));
        assert!(factory.parse_access_token(token.signed()).is_ok());
        assert!(!token.is_expired(clock.as_ref()));

        clock.advance(Duration::seconds(1));
        let err = factory.parse_access_token(token.signed()).unwrap_err();
        assert!(err.is_auth(AuthError::InvalidToken));
        assert!(token.is_expired(clock.as_ref()));
    }

    #[test]
    fn test_invalid_token() {
        let (factory, _) = factory();
        assert!(factory.parse_access_token("invalid.token.here").is_err());
        assert!(factory.parse_access_token("").is_err());
    }

    #[test]
    fn test_tampered_token() {
        let (factory, _) = factory();
        let token = factory.new_access_token(&claims()).unwrap();

        let tampered = format!("{}X", token.signed());
        assert!(factory.parse_access_token(&tampered).is_err());
    }

    #[test]
    fn test_wrong_secret() {
        let (factory, clock) = factory();
        let mut config = get_test_config();
        config.secret = "another-secret-key-at-least-32-characters".to_string();
        let other = TokenFactory::new(&config, clock).unwrap();

        let token = other.new_access_token(&claims()).unwrap();
        assert!(factory.parse_access_token(token.signed()).is_err());
    }

    #[test]
    fn test_wrong_issuer() {
        let (factory, clock) = factory();
        let mut config = get_test_config();
        config.issuer = "wrong-issuer".to_string();
        let other = TokenFactory::new(&config, clock).unwrap();

        let token = other.new_access_token(&claims()).unwrap();
        assert!(factory.parse_access_token(token.signed()).is_err());
    }

    #[test]
    fn test_other_mac_algorithm_is_rejected() {
        let (factory, clock) = factory();
        let claims = claims();
        let envelope = Envelope {
            sub: claims.subject().to_string(),
            iat: clock.now().timestamp(),
            exp: clock.now().timestamp() + 60,
            iss: "test".to_string(),
            custom: CustomClaims { role: claims.role() },
        };
        let token = encode(
            &Header::new(Algorithm::HS512),
            &envelope,
            &EncodingKey::from_secret(get_test_config().secret.as_bytes()),
        )
        .unwrap();

        assert!(factory.parse_access_token(&token).is_err());
    }

    #[test]
    fn test_none_algorithm_is_rejected() {
        let (factory, _) = factory();
        let token = factory.new_access_token(&claims()).unwrap();
        let payload = token.signed().split('.').nth(1).unwrap();
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);

        assert!(factory.parse_access_token(&format!("{}.{}.", header, payload)).is_err());
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let (factory, clock) = factory();
        let payload = serde_json::json!({
            "sub": SubjectId::new().to_string(),
            "iat": clock.now().timestamp(),
            "exp": clock.now().timestamp() + 60,
            "iss": "test",
            "custom": { "role": "superuser" },
        });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &payload,
            &EncodingKey::from_secret(get_test_config().secret.as_bytes()),
        )
        .unwrap();

        assert!(factory.parse_access_token(&token).is_err());
    }

    #[test]
    fn test_nil_subject_is_rejected() {
        let (factory, clock) = factory();
        let payload = serde_json::json!({
            "sub": uuid::Uuid::nil().to_string(),
            "iat": clock.now().timestamp(),
            "exp": clock.now().timestamp() + 60,
            "iss": "test",
            "custom": { "role": "author" },
        });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &payload,
            &EncodingKey::from_secret(get_test_config().secret.as_bytes()),
        )
        .unwrap();

        assert!(factory.parse_access_token(&token).is_err());
    }

    #[test]
    fn test_invalid_configuration() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());

        let mut config = get_test_config();
        config.secret = String::new();
        assert!(TokenFactory::new(&config, clock.clone()).is_err());

        let mut config = get_test_config();
        config.access_token_expiry = 0;
        assert!(TokenFactory::new(&config, clock.clone()).is_err());

        let mut config = get_test_config();
        config.refresh_token_expiry = 0;
        assert!(TokenFactory::new(&config, clock).is_err());
    }

    #[test]
    fn test_refresh_token_lifetime() {
        let (factory, clock) = factory();
        let subject = SubjectId::new();
        let token = factory.new_refresh_token(subject).unwrap();

        assert_eq!(token.subject_id(), subject);
        assert_eq!(token.created_at(), clock.now());
        assert_eq!(token.expires_at() - token.created_at(), Duration::seconds(604800));
    }

    #[test]
    fn test_new_session_shares_subject() {
        let (factory, _) = factory();
        let claims = claims();
        let session = factory.new_session(&claims).unwrap();

        assert_eq!(session.access_token.claims(), &claims);
        assert_eq!(session.refresh_token.subject_id(), claims.subject());
        assert_ne!(session.access_token.signed(), session.refresh_token.id());
    }

    proptest! {
        #[test]
        fn prop_access_token_round_trip(
            raw in any::<u128>().prop_filter("nil subject", |v| *v != 0),
            admin in any::<bool>(),
            elapsed in 0i64..=900,
        ) {
            let (factory, clock) = factory();
            let subject = SubjectId::try_from(uuid::Uuid::from_u128(raw)).unwrap();
            let role = if admin { Role::Admin } else { Role::Author };
            let claims = Claims::new(subject, role);

            let token = factory.new_access_token(&claims).unwrap();
            clock.advance(Duration::seconds(elapsed));
            let parsed = factory.parse_access_token(token.signed()).unwrap();

            prop_assert_eq!(parsed.claims(), &claims);
        }
    }
}
