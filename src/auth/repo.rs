use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::{Balance, NewUser, PasswordResetToken, User, UserChanges};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("duplicate key")]
    Duplicate,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.code().as_deref() == Some("23505") {
                return StoreError::Duplicate;
            }
        }
        StoreError::Backend(e.into())
    }
}

/// Accounts keyed by id, unique on lower-cased email.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    /// Fails with `Duplicate` if the email is taken.
    async fn create(&self, user: NewUser) -> Result<User, StoreError>;
    /// Returns `None` if no user has this id. Fails with `Duplicate` if an
    /// email change collides with another account.
    async fn update(&self, id: Uuid, changes: &UserChanges) -> Result<Option<User>, StoreError>;
}

/// Logged-out session tokens.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Inserting an already revoked token is a no-op.
    async fn revoke(&self, token: &str, expires_at: OffsetDateTime) -> Result<(), StoreError>;
    async fn is_revoked(&self, token: &str) -> Result<bool, StoreError>;
    async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, StoreError>;
}

/// Outstanding password reset tokens.
#[async_trait]
pub trait ResetTokenStore: Send + Sync {
    async fn insert(&self, record: &PasswordResetToken) -> Result<(), StoreError>;
    async fn delete_for_email(&self, email: &str) -> Result<u64, StoreError>;
    /// Removes the token and returns it. At most one caller gets `Some`.
    async fn take(&self, token: &str) -> Result<Option<PasswordResetToken>, StoreError>;
    async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, StoreError>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn with_balances(&self, user: Option<User>) -> Result<Option<User>, StoreError> {
        let Some(mut user) = user else {
            return Ok(None);
        };
        user.balances = sqlx::query_as::<_, Balance>(
            r#"
            SELECT currency, amount
            FROM user_balances
            WHERE user_id = $1
            ORDER BY position
            "#,
        )
        .bind(user.id)
        .fetch_all(&self.db)
        .await?;
        Ok(Some(user))
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_hash, first_name, last_name, is_active, created_at
            FROM users
            WHERE lower(email) = lower($1)
            "#,
        )
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        self.with_balances(user).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_hash, first_name, last_name, is_active, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        self.with_balances(user).await
    }

    async fn create(&self, user: NewUser) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email, password_hash, first_name, last_name)
            VALUES ($1, lower($2), $3, $4, $5)
            RETURNING id, email, password_hash, first_name, last_name, is_active, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .fetch_one(&self.db)
        .await?;
        Ok(user)
    }

    async fn update(&self, id: Uuid, changes: &UserChanges) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
               SET email         = COALESCE(lower($2), email),
                   password_hash = COALESCE($3, password_hash),
                   first_name    = COALESCE($4, first_name),
                   last_name     = COALESCE($5, last_name)
             WHERE id = $1
            RETURNING id, email, password_hash, first_name, last_name, is_active, created_at
            "#,
        )
        .bind(id)
        .bind(changes.email.as_deref())
        .bind(changes.password_hash.as_deref())
        .bind(changes.first_name.as_deref())
        .bind(changes.last_name.as_deref())
        .fetch_optional(&self.db)
        .await?;
        self.with_balances(user).await
    }
}

#[derive(Clone)]
pub struct PgRevocationStore {
    db: PgPool,
}

impl PgRevocationStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RevocationStore for PgRevocationStore {
    async fn revoke(&self, token: &str, expires_at: OffsetDateTime) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO session_revocations (token, expires_at)
            VALUES ($1, $2)
            ON CONFLICT (token) DO NOTHING
            "#,
        )
        .bind(token)
        .bind(expires_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn is_revoked(&self, token: &str) -> Result<bool, StoreError> {
        let found: Option<(i32,)> =
            sqlx::query_as(r#"SELECT 1 FROM session_revocations WHERE token = $1"#)
                .bind(token)
                .fetch_optional(&self.db)
                .await?;
        Ok(found.is_some())
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        let res = sqlx::query(r#"DELETE FROM session_revocations WHERE expires_at <= $1"#)
            .bind(now)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected())
    }
}

#[derive(Clone)]
pub struct PgResetTokenStore {
    db: PgPool,
}

impl PgResetTokenStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ResetTokenStore for PgResetTokenStore {
    async fn insert(&self, record: &PasswordResetToken) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO password_reset_tokens (token, email, created_at, expires_at)
            VALUES ($1, lower($2), $3, $4)
            "#,
        )
        .bind(&record.token)
        .bind(&record.email)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete_for_email(&self, email: &str) -> Result<u64, StoreError> {
        let res = sqlx::query(r#"DELETE FROM password_reset_tokens WHERE email = lower($1)"#)
            .bind(email)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected())
    }

    async fn take(&self, token: &str) -> Result<Option<PasswordResetToken>, StoreError> {
        let record = sqlx::query_as::<_, PasswordResetToken>(
            r#"
            DELETE FROM password_reset_tokens
            WHERE token = $1
            RETURNING token, email, created_at, expires_at
            "#,
        )
        .bind(token)
        .fetch_optional(&self.db)
        .await?;
        Ok(record)
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        let res = sqlx::query(r#"DELETE FROM password_reset_tokens WHERE expires_at <= $1"#)
            .bind(now)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected())
    }
}
