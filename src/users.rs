/// User Directory
///
/// Read access to the accounts that sessions are issued for, plus the one
/// write the session service needs: replacing a password hash.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::claims::{Role, SubjectId};
use crate::error::{AppError, DatabaseError};

#[derive(Debug, Clone)]
pub struct User {
    pub id: SubjectId,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn read_by_subject_id(&self, id: SubjectId) -> Result<Option<User>, AppError>;

    async fn read_by_email(&self, email: &str) -> Result<Option<User>, AppError>;

    /// Replace the stored hash. Fails with a persistence error if the user is gone.
    async fn update_password_hash(&self, id: SubjectId, password_hash: &str) -> Result<(), AppError>;
}

/// Users in the `users` table
#[derive(Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new account and return its subject id
    pub async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        role: Role,
    ) -> Result<SubjectId, AppError> {
        let id = SubjectId::new();
        sqlx::query(
            r#"
            INSERT INTO users (id, email, password_hash, role, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id.as_uuid())
        .bind(email)
        .bind(password_hash)
        .bind(role.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::persistence("users.insert", e.into()))?;

        Ok(id)
    }
}

type UserRow = (Uuid, String, String, String, DateTime<Utc>);

fn user_from_row(row: UserRow) -> Result<User, AppError> {
    let (id, email, password_hash, role, _created_at) = row;
    Ok(User {
        id: SubjectId::try_from(id)?,
        email,
        password_hash,
        role: role.parse()?,
    })
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn read_by_subject_id(&self, id: SubjectId) -> Result<Option<User>, AppError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, password_hash, role, created_at FROM users WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::persistence("users.read", e.into()))?;

        row.map(user_from_row).transpose()
    }

    async fn read_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, password_hash, role, created_at FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::persistence("users.read", e.into()))?;

        row.map(user_from_row).transpose()
    }

    async fn update_password_hash(&self, id: SubjectId, password_hash: &str) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE users SET password_hash = $1 WHERE id = $2")
            .bind(password_hash)
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::persistence("users.update_password", e.into()))?;

        match result.rows_affected() {
            1 => Ok(()),
            actual => Err(AppError::persistence(
                "users.update_password",
                DatabaseError::RowCountMismatch { expected: 1, actual },
            )),
        }
    }
}

/// Process-local users, keyed by subject id
#[derive(Clone, Default)]
pub struct InMemoryUserDirectory {
    users: Arc<RwLock<HashMap<SubjectId, User>>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: User) {
        self.users.write().await.insert(user.id, user);
    }

    pub async fn role_of(&self, id: SubjectId) -> Option<Role> {
        self.users.read().await.get(&id).map(|user| user.role)
    }

    pub async fn set_role(&self, id: SubjectId, role: Role) {
        if let Some(user) = self.users.write().await.get_mut(&id) {
            user.role = role;
        }
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn read_by_subject_id(&self, id: SubjectId) -> Result<Option<User>, AppError> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn read_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|user| user.email == email)
            .cloned())
    }

    async fn update_password_hash(&self, id: SubjectId, password_hash: &str) -> Result<(), AppError> {
        match self.users.write().await.get_mut(&id) {
            Some(user) => {
                user.password_hash = password_hash.to_string();
                Ok(())
            }
            None => Err(AppError::persistence(
                "users.update_password",
                DatabaseError::RowCountMismatch { expected: 1, actual: 0 },
            )),
        }
    }
}
