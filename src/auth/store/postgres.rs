use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::auth::claims::{Role, SubjectId};
use crate::auth::refresh_token::RefreshToken;
use crate::auth::repository::{TokenStore, TokenTransaction};
use crate::error::DatabaseError;

/// Refresh tokens in the `refresh_tokens` table
#[derive(Clone)]
pub struct PgTokenStore {
    pool: PgPool,
}

impl PgTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn begin(&self) -> Result<Box<dyn TokenTransaction>, DatabaseError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTokenTransaction { tx }))
    }
}

struct PgTokenTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl TokenTransaction for PgTokenTransaction {
    async fn find_refresh_token(&mut self, id: &str) -> Result<Option<RefreshToken>, DatabaseError> {
        // Row lock: a concurrent rotation blocks here until this one commits,
        // then finds nothing.
        let row = sqlx::query_as::<_, (String, Uuid, DateTime<Utc>, DateTime<Utc>)>(
            r#"
            SELECT id, subject_id, expires_at, created_at
            FROM refresh_tokens
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            None => Ok(None),
            Some((id, subject_id, expires_at, created_at)) => {
                let subject_id = SubjectId::try_from(subject_id).map_err(|_| {
                    DatabaseError::QueryExecution("refresh token row has a nil subject".to_string())
                })?;
                Ok(Some(RefreshToken::from_fields(id, subject_id, expires_at, created_at)))
            }
        }
    }

    async fn insert_refresh_token(&mut self, token: &RefreshToken) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            r#"
            INSERT INTO refresh_tokens (id, subject_id, expires_at, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(token.id())
        .bind(token.subject_id().as_uuid())
        .bind(token.expires_at())
        .bind(token.created_at())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_refresh_token(&mut self, id: &str) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_refresh_tokens_by_subject(
        &mut self,
        subject: SubjectId,
    ) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE subject_id = $1")
            .bind(subject.as_uuid())
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_expired_refresh_tokens(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < $1")
            .bind(now)
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected())
    }

    async fn find_subject_role(&mut self, subject: SubjectId) -> Result<Option<Role>, DatabaseError> {
        let row = sqlx::query_as::<_, (String,)>("SELECT role FROM users WHERE id = $1")
            .bind(subject.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?;

        match row {
            None => Ok(None),
            Some((role,)) => role
                .parse::<Role>()
                .map(Some)
                .map_err(|e| DatabaseError::QueryExecution(e.to_string())),
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let PgTokenTransaction { tx } = *self;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        let PgTokenTransaction { tx } = *self;
        tx.rollback().await?;
        Ok(())
    }
}
