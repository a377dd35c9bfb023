/// Session Orchestration
///
/// Login, logout, refresh and password change, composed from the user
/// directory, the password hasher, the token factory and the session
/// repository. This is the surface the HTTP layer talks to.

use std::sync::Arc;

use crate::auth::claims::{Claims, SubjectId};
use crate::auth::jwt::TokenFactory;
use crate::auth::password::{validate_password_strength, PasswordHasher};
use crate::auth::refresh_token::Session;
use crate::auth::repository::SessionRepository;
use crate::error::{AppError, AuthError};
use crate::users::UserDirectory;

#[derive(Clone)]
pub struct SessionService {
    users: Arc<dyn UserDirectory>,
    hasher: PasswordHasher,
    tokens: TokenFactory,
    sessions: SessionRepository,
}

impl SessionService {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        hasher: PasswordHasher,
        tokens: TokenFactory,
        sessions: SessionRepository,
    ) -> Self {
        Self {
            users,
            hasher,
            tokens,
            sessions,
        }
    }

    pub fn tokens(&self) -> &TokenFactory {
        &self.tokens
    }

    /// Login: check credentials and open a new session.
    ///
    /// # Errors
    /// `InvalidCredentials` for an unknown email, a wrong password, or a
    /// failed lookup; the caller cannot tell which.
    pub async fn create(&self, email: &str, password: &str) -> Result<Session, AppError> {
        let user = match self.users.read_by_email(email).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::warn!("Login failed");
                return Err(AuthError::InvalidCredentials.into());
            }
            Err(e) => {
                tracing::error!(error = %e, "User lookup failed during login");
                return Err(AuthError::InvalidCredentials.into());
            }
        };

        if !self.compare_password(&user.password_hash, password).await {
            tracing::warn!(subject_id = %user.id, "Login failed");
            return Err(AuthError::InvalidCredentials.into());
        }

        let session = self.tokens.new_session(&Claims::new(user.id, user.role))?;
        self.sessions
            .create_refresh_token(&session.refresh_token)
            .await?;

        tracing::info!(subject_id = %user.id, role = %user.role, "Session created");
        Ok(session)
    }

    /// Logout: consume the refresh token.
    ///
    /// # Errors
    /// `RefreshTokenNotFound` if the token is unknown or already used.
    pub async fn destroy(&self, refresh_token_id: &str) -> Result<(), AppError> {
        self.sessions.delete_refresh_token(refresh_token_id).await?;
        tracing::info!("Session destroyed");
        Ok(())
    }

    /// Exchange a refresh token for a new session. The old token is consumed
    /// and the new access token carries the subject's current role.
    ///
    /// # Errors
    /// - `RefreshTokenNotFound` for an unknown or already rotated token
    /// - `RefreshTokenExpired` for an expired one, which is consumed anyway
    pub async fn refresh(&self, refresh_token_id: &str) -> Result<Session, AppError> {
        let tokens = self.tokens.clone();

        let result = self
            .sessions
            .refresh(refresh_token_id, move |current, role| async move {
                if current.is_expired(tokens.clock()) {
                    return Err(AuthError::RefreshTokenExpired.into());
                }

                let role = role.ok_or(AuthError::InvalidCredentials)?;
                tokens.new_session(&Claims::new(current.subject_id(), role))
            })
            .await;

        match &result {
            Ok(session) => {
                tracing::info!(subject_id = %session.refresh_token.subject_id(), "Session refreshed");
            }
            Err(e) if e.is_auth(AuthError::RefreshTokenNotFound) => {
                tracing::warn!("Refresh with unknown or already used token; possible replay");
            }
            Err(_) => {}
        }

        result
    }

    /// Replace a subject's password and end every one of its sessions.
    ///
    /// # Errors
    /// - validation error if `new_password` fails the password policy
    /// - `InvalidCredentials` if `current_password` is wrong
    pub async fn change_password(
        &self,
        subject: SubjectId,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AppError> {
        validate_password_strength(new_password)?;

        let user = self
            .users
            .read_by_subject_id(subject)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if !self.compare_password(&user.password_hash, current_password).await {
            tracing::warn!(subject_id = %subject, "Password change rejected");
            return Err(AuthError::InvalidCredentials.into());
        }

        // Sessions go first: if the purge fails the old password still
        // stands and no session outlives a completed change.
        let purged = self.sessions.delete_refresh_tokens_by_subject(subject).await?;

        let password_hash = self.hash_password(new_password).await?;
        self.users.update_password_hash(subject, &password_hash).await?;

        tracing::info!(subject_id = %subject, purged = purged, "Password changed, sessions purged");
        Ok(())
    }

    /// Check a presented access token
    pub fn verify(&self, access_token: &str) -> Result<Claims, AppError> {
        let token = self.tokens.parse_access_token(access_token)?;
        Ok(*token.claims())
    }

    /// Delete refresh tokens that expired before now
    pub async fn purge_expired(&self) -> Result<u64, AppError> {
        self.sessions.purge_expired(self.tokens.clock().now()).await
    }

    pub async fn hash_password(&self, password: &str) -> Result<String, AppError> {
        let hasher = self.hasher.clone();
        let password = password.as_bytes().to_vec();

        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AppError::Internal(format!("hashing task failed: {}", e)))?
    }

    async fn compare_password(&self, hash: &str, password: &str) -> bool {
        let hasher = self.hasher.clone();
        let hash = hash.to_string();
        let password = password.as_bytes().to_vec();

        match tokio::task::spawn_blocking(move || hasher.compare(&hash, &password)).await {
            Ok(matches) => matches,
            Err(e) => {
                tracing::error!(error = %e, "Password comparison task failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::claims::Role;
    use crate::auth::clock::ManualClock;
    use crate::auth::refresh_token::RefreshToken;
    use crate::auth::repository::{TokenStore, TokenTransaction};
    use crate::auth::store::InMemoryTokenStore;
    use crate::configuration::JwtSettings;
    use crate::error::DatabaseError;
    use crate::users::{InMemoryUserDirectory, User};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    struct UnavailableDirectory;

    #[async_trait]
    impl UserDirectory for UnavailableDirectory {
        async fn read_by_subject_id(&self, _id: SubjectId) -> Result<Option<User>, AppError> {
            Err(AppError::persistence(
                "users.read",
                DatabaseError::ConnectionPool("pool timed out".to_string()),
            ))
        }

        async fn read_by_email(&self, _email: &str) -> Result<Option<User>, AppError> {
            Err(AppError::persistence(
                "users.read",
                DatabaseError::ConnectionPool("pool timed out".to_string()),
            ))
        }

        async fn update_password_hash(&self, _id: SubjectId, _hash: &str) -> Result<(), AppError> {
            Ok(())
        }
    }

    /// Passes everything through except the by-subject purge
    struct FailingPurgeStore {
        inner: InMemoryTokenStore,
    }

    struct FailingPurgeTransaction {
        inner: Box<dyn TokenTransaction>,
    }

    #[async_trait]
    impl TokenStore for FailingPurgeStore {
        async fn begin(&self) -> Result<Box<dyn TokenTransaction>, DatabaseError> {
            Ok(Box::new(FailingPurgeTransaction {
                inner: self.inner.begin().await?,
            }))
        }
    }

    #[async_trait]
    impl TokenTransaction for FailingPurgeTransaction {
        async fn find_refresh_token(&mut self, id: &str) -> Result<Option<RefreshToken>, DatabaseError> {
            self.inner.find_refresh_token(id).await
        }

        async fn insert_refresh_token(&mut self, token: &RefreshToken) -> Result<u64, DatabaseError> {
            self.inner.insert_refresh_token(token).await
        }

        async fn delete_refresh_token(&mut self, id: &str) -> Result<u64, DatabaseError> {
            self.inner.delete_refresh_token(id).await
        }

        async fn delete_refresh_tokens_by_subject(
            &mut self,
            _subject: SubjectId,
        ) -> Result<u64, DatabaseError> {
            Err(DatabaseError::ConnectionPool("pool timed out".to_string()))
        }

        async fn delete_expired_refresh_tokens(
            &mut self,
            now: DateTime<Utc>,
        ) -> Result<u64, DatabaseError> {
            self.inner.delete_expired_refresh_tokens(now).await
        }

        async fn find_subject_role(
            &mut self,
            subject: SubjectId,
        ) -> Result<Option<Role>, DatabaseError> {
            self.inner.find_subject_role(subject).await
        }

        async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
            self.inner.rollback().await
        }
    }

    fn service(users: Arc<dyn UserDirectory>) -> SessionService {
        service_with_store(users, Arc::new(InMemoryTokenStore::new()))
    }

    fn service_with_store(users: Arc<dyn UserDirectory>, store: Arc<dyn TokenStore>) -> SessionService {
        let settings = JwtSettings {
            secret: "test-secret".to_string(),
            access_token_expiry: 900,
            refresh_token_expiry: 3600,
            issuer: "test".to_string(),
        };
        SessionService::new(
            users,
            PasswordHasher::new("test-pepper", 4).unwrap(),
            TokenFactory::new(&settings, Arc::new(ManualClock::starting_now())).unwrap(),
            SessionRepository::new(store),
        )
    }

    #[tokio::test]
    async fn test_lookup_failure_is_unauthorized() {
        let service = service(Arc::new(UnavailableDirectory));

        let err = service.create("a@b.com", "Topsecret1").await.unwrap_err();
        assert!(err.is_auth(AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_verify_returns_claims() {
        let users = InMemoryUserDirectory::new();
        let service = service(Arc::new(users.clone()));
        let subject = SubjectId::new();
        users
            .insert(User {
                id: subject,
                email: "a@b.com".to_string(),
                password_hash: service.hash_password("Topsecret1").await.unwrap(),
                role: Role::Admin,
            })
            .await;

        let session = service.create("a@b.com", "Topsecret1").await.unwrap();
        let claims = service.verify(session.access_token.signed()).unwrap();

        assert_eq!(claims, Claims::new(subject, Role::Admin));
        assert!(service.verify("not.a.token").is_err());
    }

    #[tokio::test]
    async fn test_weak_new_password_is_rejected_first() {
        let service = service(Arc::new(UnavailableDirectory));

        let err = service
            .change_password(SubjectId::new(), "Topsecret1", "weak")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_failed_purge_keeps_old_password() {
        let users = InMemoryUserDirectory::new();
        let tokens = InMemoryTokenStore::with_users(users.clone());
        let service = service_with_store(
            Arc::new(users.clone()),
            Arc::new(FailingPurgeStore {
                inner: tokens.clone(),
            }),
        );
        let subject = SubjectId::new();
        users
            .insert(User {
                id: subject,
                email: "a@b.com".to_string(),
                password_hash: service.hash_password("Topsecret1").await.unwrap(),
                role: Role::Author,
            })
            .await;
        let session = service.create("a@b.com", "Topsecret1").await.unwrap();

        let err = service
            .change_password(subject, "Topsecret1", "Newsecret2")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Persistence { .. }));
        assert!(tokens.contains(session.refresh_token.id()).await);
        assert!(service.create("a@b.com", "Topsecret1").await.is_ok());
        assert!(service.create("a@b.com", "Newsecret2").await.is_err());
    }
}
