//! In-process stores with the same uniqueness rules as the Postgres ones.
//! Used by tests and local runs without a database.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::auth::{
    repo::{ResetTokenStore, RevocationStore, StoreError, UserStore},
    repo_types::{NewUser, PasswordResetToken, SessionRevocation, User, UserChanges},
};

/// Handles onto the in-memory stores behind an [`AppState`](crate::state::AppState).
#[derive(Clone, Default)]
pub struct MemoryStores {
    pub users: Arc<MemoryUserStore>,
    pub revocations: Arc<MemoryRevocationStore>,
    pub resets: Arc<MemoryResetTokenStore>,
}

#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of accounts registered under `email`, ignoring case.
    pub async fn count_email(&self, email: &str) -> usize {
        let email = email.to_lowercase();
        self.users
            .lock()
            .await
            .values()
            .filter(|u| u.email == email)
            .count()
    }

    pub async fn set_active(&self, id: Uuid, active: bool) {
        if let Some(user) = self.users.lock().await.get_mut(&id) {
            user.is_active = active;
        }
    }

    pub async fn remove(&self, id: Uuid) {
        self.users.lock().await.remove(&id);
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let email = email.to_lowercase();
        let users = self.users.lock().await;
        Ok(users.values().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.lock().await.get(&id).cloned())
    }

    async fn create(&self, user: NewUser) -> Result<User, StoreError> {
        let email = user.email.to_lowercase();
        let mut users = self.users.lock().await;
        if users.values().any(|u| u.email == email) {
            return Err(StoreError::Duplicate);
        }
        let record = User {
            id: Uuid::new_v4(),
            email,
            password_hash: user.password_hash,
            first_name: user.first_name,
            last_name: user.last_name,
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
            balances: Vec::new(),
        };
        users.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update(&self, id: Uuid, changes: &UserChanges) -> Result<Option<User>, StoreError> {
        let mut users = self.users.lock().await;
        if let Some(email) = &changes.email {
            let email = email.to_lowercase();
            if users.values().any(|u| u.id != id && u.email == email) {
                return Err(StoreError::Duplicate);
            }
        }
        let Some(user) = users.get_mut(&id) else {
            return Ok(None);
        };
        changes.apply(user);
        user.email = user.email.to_lowercase();
        Ok(Some(user.clone()))
    }
}

#[derive(Default)]
pub struct MemoryRevocationStore {
    tokens: Mutex<HashMap<String, SessionRevocation>>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tokens.lock().await.len()
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    async fn revoke(&self, token: &str, expires_at: OffsetDateTime) -> Result<(), StoreError> {
        self.tokens
            .lock()
            .await
            .entry(token.to_string())
            .or_insert_with(|| SessionRevocation {
                token: token.to_string(),
                revoked_at: OffsetDateTime::now_utc(),
                expires_at,
            });
        Ok(())
    }

    async fn is_revoked(&self, token: &str) -> Result<bool, StoreError> {
        Ok(self.tokens.lock().await.contains_key(token))
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        let mut tokens = self.tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, r| r.expires_at > now);
        Ok((before - tokens.len()) as u64)
    }
}

#[derive(Default)]
pub struct MemoryResetTokenStore {
    tokens: Mutex<HashMap<String, PasswordResetToken>>,
}

impl MemoryResetTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outstanding tokens for `email`, expired ones included.
    pub async fn count_for_email(&self, email: &str) -> usize {
        let email = email.to_lowercase();
        self.tokens
            .lock()
            .await
            .values()
            .filter(|t| t.email == email)
            .count()
    }
}

#[async_trait]
impl ResetTokenStore for MemoryResetTokenStore {
    async fn insert(&self, record: &PasswordResetToken) -> Result<(), StoreError> {
        let mut tokens = self.tokens.lock().await;
        if tokens.contains_key(&record.token) {
            return Err(StoreError::Duplicate);
        }
        let mut record = record.clone();
        record.email = record.email.to_lowercase();
        tokens.insert(record.token.clone(), record);
        Ok(())
    }

    async fn delete_for_email(&self, email: &str) -> Result<u64, StoreError> {
        let email = email.to_lowercase();
        let mut tokens = self.tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, t| t.email != email);
        Ok((before - tokens.len()) as u64)
    }

    async fn take(&self, token: &str) -> Result<Option<PasswordResetToken>, StoreError> {
        Ok(self.tokens.lock().await.remove(token))
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        let mut tokens = self.tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, t| t.is_live(now));
        Ok((before - tokens.len()) as u64)
    }
}
