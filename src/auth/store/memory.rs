use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::auth::claims::{Role, SubjectId};
use crate::auth::refresh_token::RefreshToken;
use crate::auth::repository::{TokenStore, TokenTransaction};
use crate::error::DatabaseError;
use crate::users::InMemoryUserDirectory;

type Rows = HashMap<String, RefreshToken>;

/// Process-local token store.
///
/// Transactions are serialized: `begin` takes the table lock and holds it
/// until commit or rollback. Writes go to a staged copy that replaces the
/// table only on commit. Subject roles come from an attached user
/// directory; without one every subject reads as absent.
#[derive(Clone, Default)]
pub struct InMemoryTokenStore {
    rows: Arc<Mutex<Rows>>,
    users: Option<InMemoryUserDirectory>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: InMemoryUserDirectory) -> Self {
        Self {
            rows: Arc::default(),
            users: Some(users),
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.rows.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn tokens_for(&self, subject: SubjectId) -> Vec<RefreshToken> {
        self.rows
            .lock()
            .await
            .values()
            .filter(|token| token.subject_id() == subject)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn begin(&self) -> Result<Box<dyn TokenTransaction>, DatabaseError> {
        let table = Arc::clone(&self.rows).lock_owned().await;
        let staged = table.clone();
        Ok(Box::new(InMemoryTransaction {
            table,
            staged,
            users: self.users.clone(),
        }))
    }
}

struct InMemoryTransaction {
    table: OwnedMutexGuard<Rows>,
    staged: Rows,
    users: Option<InMemoryUserDirectory>,
}

#[async_trait]
impl TokenTransaction for InMemoryTransaction {
    async fn find_refresh_token(&mut self, id: &str) -> Result<Option<RefreshToken>, DatabaseError> {
        Ok(self.staged.get(id).cloned())
    }

    async fn insert_refresh_token(&mut self, token: &RefreshToken) -> Result<u64, DatabaseError> {
        if self.staged.contains_key(token.id()) {
            return Err(DatabaseError::UniqueConstraintViolation(
                "refresh_tokens_pkey".to_string(),
            ));
        }
        self.staged.insert(token.id().to_string(), token.clone());
        Ok(1)
    }

    async fn delete_refresh_token(&mut self, id: &str) -> Result<u64, DatabaseError> {
        Ok(self.staged.remove(id).map_or(0, |_| 1))
    }

    async fn delete_refresh_tokens_by_subject(
        &mut self,
        subject: SubjectId,
    ) -> Result<u64, DatabaseError> {
        let before = self.staged.len();
        self.staged.retain(|_, token| token.subject_id() != subject);
        Ok((before - self.staged.len()) as u64)
    }

    async fn delete_expired_refresh_tokens(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let before = self.staged.len();
        self.staged.retain(|_, token| token.expires_at() >= now);
        Ok((before - self.staged.len()) as u64)
    }

    async fn find_subject_role(&mut self, subject: SubjectId) -> Result<Option<Role>, DatabaseError> {
        match &self.users {
            Some(users) => Ok(users.role_of(subject).await),
            None => Ok(None),
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let InMemoryTransaction { mut table, staged, .. } = *self;
        *table = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(id: &str, subject: SubjectId) -> RefreshToken {
        let now = Utc::now();
        RefreshToken::from_fields(id.to_string(), subject, now + Duration::days(1), now)
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let store = InMemoryTokenStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_refresh_token(&token("a", SubjectId::new())).await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.contains("a").await);
    }

    #[tokio::test]
    async fn test_drop_discards_writes() {
        let store = InMemoryTokenStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_refresh_token(&token("a", SubjectId::new())).await.unwrap();
        }

        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_rollback_restores_deleted_row() {
        let store = InMemoryTokenStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_refresh_token(&token("a", SubjectId::new())).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.delete_refresh_token("a").await.unwrap(), 1);
        assert_eq!(tx.delete_refresh_token("a").await.unwrap(), 0);
        tx.rollback().await.unwrap();

        assert!(store.contains("a").await);
    }

    #[tokio::test]
    async fn test_delete_by_subject_counts_rows() {
        let store = InMemoryTokenStore::new();
        let subject = SubjectId::new();
        let other = SubjectId::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_refresh_token(&token("a", subject)).await.unwrap();
        tx.insert_refresh_token(&token("b", subject)).await.unwrap();
        tx.insert_refresh_token(&token("c", other)).await.unwrap();

        assert_eq!(tx.delete_refresh_tokens_by_subject(subject).await.unwrap(), 2);
        tx.commit().await.unwrap();

        assert!(store.tokens_for(subject).await.is_empty());
        assert_eq!(store.tokens_for(other).await.len(), 1);
    }

    #[tokio::test]
    async fn test_role_comes_from_attached_directory() {
        let users = InMemoryUserDirectory::new();
        let subject = SubjectId::new();
        users
            .insert(crate::users::User {
                id: subject,
                email: "a@b.com".to_string(),
                password_hash: "hash".to_string(),
                role: Role::Admin,
            })
            .await;

        let mut tx = InMemoryTokenStore::with_users(users).begin().await.unwrap();
        assert_eq!(tx.find_subject_role(subject).await.unwrap(), Some(Role::Admin));
        assert_eq!(tx.find_subject_role(SubjectId::new()).await.unwrap(), None);

        let mut detached = InMemoryTokenStore::new().begin().await.unwrap();
        assert_eq!(detached.find_subject_role(subject).await.unwrap(), None);
    }
}
