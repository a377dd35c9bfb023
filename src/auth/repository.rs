/// Session Repository
///
/// Owns the durable refresh-token rows and runs the rotate-on-refresh
/// transaction. Storage is reached only through [`TokenStore`], an opaque
/// transactional executor: Postgres in production, in-memory in tests.
///
/// Single use is enforced by the delete step: inside one transaction the row
/// is read, then deleted with an exact row-count check. Of two concurrent
/// refreshes on the same id the database lets only one delete see the row;
/// the other gets `RefreshTokenNotFound`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;

use crate::auth::claims::{Role, SubjectId};
use crate::auth::refresh_token::{HasRefreshToken, RefreshToken};
use crate::error::{AppError, AuthError, DatabaseError};

/// Begins transactions against refresh-token storage
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn TokenTransaction>, DatabaseError>;
}

/// One open transaction. Dropping it without `commit` discards every write.
#[async_trait]
pub trait TokenTransaction: Send {
    async fn find_refresh_token(&mut self, id: &str) -> Result<Option<RefreshToken>, DatabaseError>;

    /// Returns the number of rows inserted
    async fn insert_refresh_token(&mut self, token: &RefreshToken) -> Result<u64, DatabaseError>;

    /// Returns the number of rows deleted
    async fn delete_refresh_token(&mut self, id: &str) -> Result<u64, DatabaseError>;

    async fn delete_refresh_tokens_by_subject(
        &mut self,
        subject: SubjectId,
    ) -> Result<u64, DatabaseError>;

    async fn delete_expired_refresh_tokens(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    /// Current role of a subject, read on this transaction's connection.
    /// `None` if the subject no longer exists.
    async fn find_subject_role(&mut self, subject: SubjectId) -> Result<Option<Role>, DatabaseError>;

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}

#[derive(Clone)]
pub struct SessionRepository {
    store: Arc<dyn TokenStore>,
}

impl SessionRepository {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    /// Persist a newly issued refresh token
    ///
    /// # Errors
    /// A persistence error unless exactly one row is inserted.
    pub async fn create_refresh_token(&self, token: &RefreshToken) -> Result<(), AppError> {
        let mut tx = self.begin("create.begin").await?;

        match tx.insert_refresh_token(token).await {
            Ok(1) => {}
            Ok(actual) => return abort(tx, row_count("create.insert", actual)).await,
            Err(e) => return abort(tx, AppError::persistence("create.insert", e)).await,
        }

        commit(tx, "create.commit").await
    }

    /// Consume a refresh token (logout)
    ///
    /// # Errors
    /// `RefreshTokenNotFound` if no row matched: already rotated, already
    /// logged out, or never issued.
    pub async fn delete_refresh_token(&self, id: &str) -> Result<(), AppError> {
        let mut tx = self.begin("delete.begin").await?;

        match tx.delete_refresh_token(id).await {
            Ok(1) => {}
            Ok(0) => return abort(tx, AuthError::RefreshTokenNotFound.into()).await,
            Ok(actual) => return abort(tx, row_count("delete.exec", actual)).await,
            Err(e) => return abort(tx, AppError::persistence("delete.exec", e)).await,
        }

        commit(tx, "delete.commit").await
    }

    /// Invalidate every session of a subject. Zero rows is not an error.
    pub async fn delete_refresh_tokens_by_subject(&self, subject: SubjectId) -> Result<u64, AppError> {
        let mut tx = self.begin("delete_by_subject.begin").await?;

        let deleted = match tx.delete_refresh_tokens_by_subject(subject).await {
            Ok(deleted) => deleted,
            Err(e) => return abort(tx, AppError::persistence("delete_by_subject.exec", e)).await,
        };

        commit(tx, "delete_by_subject.commit").await?;
        Ok(deleted)
    }

    /// Remove rows that expired before `now`
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut tx = self.begin("purge.begin").await?;

        let deleted = match tx.delete_expired_refresh_tokens(now).await {
            Ok(deleted) => deleted,
            Err(e) => return abort(tx, AppError::persistence("purge.exec", e)).await,
        };

        commit(tx, "purge.commit").await?;
        tracing::info!(deleted = deleted, "Purged expired refresh tokens");
        Ok(deleted)
    }

    /// Rotate a refresh token in one transaction: read it, claim it by
    /// deleting it, hand it to `rotate`, then insert the replacement `rotate`
    /// returns.
    ///
    /// `rotate` receives the consumed token and the subject's current role
    /// (`None` if the subject is gone), both read on the transaction's own
    /// connection, so a refresh never holds more than one. It must check the
    /// token's expiry itself.
    /// Its errors are returned unchanged. A `RefreshTokenExpired` failure
    /// still commits the delete, so an expired token is gone afterwards; any
    /// other failure rolls the whole transaction back.
    ///
    /// # Errors
    /// - `RefreshTokenNotFound` if the row is absent or a concurrent rotation
    ///   deleted it first
    /// - whatever `rotate` returns
    /// - a persistence error naming the failed step
    pub async fn refresh<F, Fut, T>(&self, id: &str, rotate: F) -> Result<T, AppError>
    where
        F: FnOnce(RefreshToken, Option<Role>) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
        T: HasRefreshToken,
    {
        let mut tx = self.begin("refresh.begin").await?;

        let current = match tx.find_refresh_token(id).await {
            Ok(Some(token)) => token,
            Ok(None) => return abort(tx, AuthError::RefreshTokenNotFound.into()).await,
            Err(e) => return abort(tx, AppError::persistence("refresh.read", e)).await,
        };

        // The claim: only one transaction can delete the row.
        match tx.delete_refresh_token(id).await {
            Ok(1) => {}
            Ok(0) => return abort(tx, AuthError::RefreshTokenNotFound.into()).await,
            Ok(actual) => return abort(tx, row_count("refresh.delete", actual)).await,
            Err(e) => return abort(tx, AppError::persistence("refresh.delete", e)).await,
        }

        let subject = current.subject_id();
        let role = match tx.find_subject_role(subject).await {
            Ok(role) => role,
            Err(e) => return abort(tx, AppError::persistence("refresh.read_role", e)).await,
        };

        let rotated = match rotate(current, role).await {
            Ok(rotated) => rotated,
            Err(err) if err.is_auth(AuthError::RefreshTokenExpired) => {
                commit(tx, "refresh.commit").await?;
                tracing::info!(subject_id = %subject, "Expired refresh token consumed");
                return Err(err);
            }
            Err(err) => return abort(tx, err).await,
        };

        match tx.insert_refresh_token(rotated.refresh_token()).await {
            Ok(1) => {}
            Ok(actual) => return abort(tx, row_count("refresh.insert", actual)).await,
            Err(e) => return abort(tx, AppError::persistence("refresh.insert", e)).await,
        }

        commit(tx, "refresh.commit").await?;
        tracing::debug!(subject_id = %subject, "Refresh token rotated");
        Ok(rotated)
    }

    async fn begin(&self, operation: &'static str) -> Result<Box<dyn TokenTransaction>, AppError> {
        self.store
            .begin()
            .await
            .map_err(|e| AppError::persistence(operation, e))
    }
}

fn row_count(operation: &'static str, actual: u64) -> AppError {
    AppError::persistence(operation, DatabaseError::RowCountMismatch { expected: 1, actual })
}

async fn commit(tx: Box<dyn TokenTransaction>, operation: &'static str) -> Result<(), AppError> {
    tx.commit()
        .await
        .map_err(|e| AppError::persistence(operation, e))
}

/// Roll back and return `err`. A failed rollback is logged; the original
/// error is still what the caller sees.
async fn abort<T>(tx: Box<dyn TokenTransaction>, err: AppError) -> Result<T, AppError> {
    if let Err(rollback_err) = tx.rollback().await {
        tracing::error!(error = %rollback_err, cause = %err, "Transaction rollback failed");
    }
    Err(err)
}
