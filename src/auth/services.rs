use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use lazy_static::lazy_static;
use rand::{rngs::OsRng, RngCore};
use regex::Regex;
use time::Duration;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::{
            ForgotPasswordRequest, ForgotPasswordResponse, LoginRequest, MessageResponse,
            PublicUser, RegisterRequest, ResetPasswordRequest, TokenResponse,
            UpdateProfileRequest,
        },
        jwt::JwtKeys,
        password::{hash_password_blocking, verify_dummy_blocking, verify_password_blocking},
        repo::{ResetTokenStore, RevocationStore, StoreError, UserStore},
        repo_types::{NewUser, PasswordResetToken, User, UserChanges},
    },
    clock::Clock,
    error::AuthError,
};

pub const RESET_TOKEN_TTL: Duration = Duration::minutes(15);
const RESET_TOKEN_BYTES: usize = 32;
const MAX_EMAIL_LEN: usize = 254;
const MAX_PASSWORD_LEN: usize = 128;
const MAX_NAME_LEN: usize = 100;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    email.len() <= MAX_EMAIL_LEN && EMAIL_RE.is_match(email)
}

fn normalize_email(raw: &str) -> Result<String, AuthError> {
    let email = raw.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(AuthError::Validation("Invalid email".into()));
    }
    Ok(email)
}

fn check_password(password: &str) -> Result<(), AuthError> {
    if password.is_empty() {
        return Err(AuthError::Validation("Password must not be empty".into()));
    }
    if password.chars().count() > MAX_PASSWORD_LEN {
        return Err(AuthError::Validation("Password too long".into()));
    }
    Ok(())
}

fn normalize_name(field: &str, raw: &str) -> Result<String, AuthError> {
    let name = raw.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(AuthError::Validation(format!(
            "{field} must be between 1 and {MAX_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

/// 32 random bytes, URL-safe base64 without padding.
pub fn generate_reset_token() -> String {
    let mut bytes = [0u8; RESET_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Registration, sessions and password reset on top of the stores.
pub struct AuthService {
    users: Arc<dyn UserStore>,
    revocations: Arc<dyn RevocationStore>,
    resets: Arc<dyn ResetTokenStore>,
    keys: JwtKeys,
    clock: Arc<dyn Clock>,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserStore>,
        revocations: Arc<dyn RevocationStore>,
        resets: Arc<dyn ResetTokenStore>,
        keys: JwtKeys,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            users,
            revocations,
            resets,
            keys,
            clock,
        }
    }

    #[instrument(skip_all)]
    pub async fn register(&self, req: RegisterRequest) -> Result<PublicUser, AuthError> {
        let email = normalize_email(&req.email)?;
        check_password(&req.password)?;
        let first_name = normalize_name("first_name", &req.first_name)?;
        let last_name = normalize_name("last_name", &req.last_name)?;

        // Fast path only; the unique index decides.
        if self.users.find_by_email(&email).await?.is_some() {
            warn!(email = %email, "email already registered");
            return Err(AuthError::EmailAlreadyExists);
        }

        let password_hash = hash_password_blocking(req.password).await?;

        let user = match self
            .users
            .create(NewUser {
                email: email.clone(),
                password_hash,
                first_name,
                last_name,
            })
            .await
        {
            Ok(u) => u,
            Err(StoreError::Duplicate) => {
                warn!(email = %email, "lost registration race");
                return Err(AuthError::EmailAlreadyExists);
            }
            Err(StoreError::Backend(e)) => return Err(AuthError::Internal(e.context("create user"))),
        };

        info!(user_id = %user.id, email = %user.email, "user registered");
        Ok(user.into())
    }

    #[instrument(skip_all)]
    pub async fn login(&self, req: LoginRequest) -> Result<TokenResponse, AuthError> {
        let email = req.email.trim().to_lowercase();

        if req.password.is_empty() || req.password.chars().count() > MAX_PASSWORD_LEN {
            warn!(email = %email, "login password outside accepted length");
            return Err(AuthError::InvalidCredentials);
        }

        let Some(user) = self.users.find_by_email(&email).await? else {
            // same Argon2 work as a real verify
            verify_dummy_blocking(req.password).await;
            warn!(email = %email, "login unknown email");
            return Err(AuthError::InvalidCredentials);
        };

        if !verify_password_blocking(req.password, user.password_hash.clone()).await? {
            warn!(user_id = %user.id, "login invalid password");
            return Err(AuthError::InvalidCredentials);
        }

        if !user.is_active {
            warn!(user_id = %user.id, "login on inactive account");
            return Err(AuthError::InvalidCredentials);
        }

        let issued = self.keys.issue(user.id)?;
        info!(user_id = %user.id, "user logged in");
        Ok(TokenResponse {
            access_token: issued.token,
            token_type: "bearer".into(),
            expires_at: issued.expires_at,
        })
    }

    /// Signature and expiry, then revocation, then the subject itself. Every
    /// failure looks the same to the caller.
    #[instrument(skip_all)]
    pub async fn resolve_session(&self, token: &str) -> Result<User, AuthError> {
        let claims = self.keys.validate(token).map_err(|e| {
            warn!(reason = %e, "session token rejected");
            AuthError::Unauthorized
        })?;

        if self.revocations.is_revoked(token).await? {
            warn!(user_id = %claims.sub, "revoked session token presented");
            return Err(AuthError::Unauthorized);
        }

        match self.users.find_by_id(claims.sub).await? {
            Some(user) if user.is_active => Ok(user),
            Some(user) => {
                warn!(user_id = %user.id, "session for inactive account");
                Err(AuthError::Unauthorized)
            }
            None => {
                warn!(user_id = %claims.sub, "session subject no longer exists");
                Err(AuthError::Unauthorized)
            }
        }
    }

    pub async fn whoami(&self, token: &str) -> Result<PublicUser, AuthError> {
        Ok(self.resolve_session(token).await?.into())
    }

    #[instrument(skip_all)]
    pub async fn update_profile(
        &self,
        token: &str,
        req: UpdateProfileRequest,
    ) -> Result<PublicUser, AuthError> {
        let user = self.resolve_session(token).await?;

        let mut changes = UserChanges::default();
        if let Some(raw) = req.email.as_deref() {
            let email = normalize_email(raw)?;
            if email != user.email {
                if let Some(other) = self.users.find_by_email(&email).await? {
                    if other.id != user.id {
                        warn!(user_id = %user.id, email = %email, "email taken");
                        return Err(AuthError::EmailAlreadyExists);
                    }
                }
                changes.email = Some(email);
            }
        }
        if let Some(first) = req.first_name.as_deref() {
            changes.first_name = Some(normalize_name("first_name", first)?);
        }
        if let Some(last) = req.last_name.as_deref() {
            changes.last_name = Some(normalize_name("last_name", last)?);
        }
        if let Some(password) = req.password {
            check_password(&password)?;
            changes.password_hash = Some(hash_password_blocking(password).await?);
        }

        if changes.is_empty() {
            return Ok(user.into());
        }

        let updated = match self.users.update(user.id, &changes).await {
            Ok(Some(u)) => u,
            Ok(None) => return Err(AuthError::Unauthorized),
            Err(StoreError::Duplicate) => {
                warn!(user_id = %user.id, "lost email change race");
                return Err(AuthError::EmailAlreadyExists);
            }
            Err(StoreError::Backend(e)) => return Err(AuthError::Internal(e.context("update user"))),
        };

        info!(user_id = %updated.id, "profile updated");
        Ok(updated.into())
    }

    /// Revokes a validly signed token. Already revoked tokens are accepted
    /// again without error.
    #[instrument(skip_all)]
    pub async fn logout(&self, token: &str) -> Result<MessageResponse, AuthError> {
        let claims = self.keys.validate(token).map_err(|e| {
            warn!(reason = %e, "logout with unusable token");
            AuthError::Unauthorized
        })?;
        let expires_at = time::OffsetDateTime::from_unix_timestamp(claims.exp)
            .map_err(|e| AuthError::Internal(e.into()))?;

        self.revocations.revoke(token, expires_at).await?;
        info!(user_id = %claims.sub, "user logged out");
        Ok(MessageResponse::new("Successfully logged out"))
    }

    #[instrument(skip_all)]
    pub async fn forgot_password(
        &self,
        req: ForgotPasswordRequest,
    ) -> Result<ForgotPasswordResponse, AuthError> {
        let email = normalize_email(&req.email)?;

        if self.users.find_by_email(&email).await?.is_none() {
            warn!(email = %email, "password reset for unknown email");
            return Err(AuthError::UserNotFound);
        }

        // Not atomic with the insert below; two concurrent requests may
        // briefly leave zero or two live tokens.
        let dropped = self.resets.delete_for_email(&email).await?;

        let now = self.clock.now();
        let record = PasswordResetToken {
            token: generate_reset_token(),
            email: email.clone(),
            created_at: now,
            expires_at: now + RESET_TOKEN_TTL,
        };
        self.resets.insert(&record).await?;

        info!(email = %email, dropped, "password reset token issued");
        Ok(ForgotPasswordResponse {
            message: "Password reset token generated".into(),
            reset_token: record.token,
        })
    }

    #[instrument(skip_all)]
    pub async fn reset_password(
        &self,
        req: ResetPasswordRequest,
    ) -> Result<MessageResponse, AuthError> {
        if req.token.trim().is_empty() {
            return Err(AuthError::Validation("Token must not be empty".into()));
        }
        check_password(&req.new_password)?;

        // Claimed up front so two concurrent resets cannot both succeed.
        let record = match self.resets.take(&req.token).await? {
            Some(r) if r.is_live(self.clock.now()) => r,
            _ => {
                warn!("reset attempted with unknown or expired token");
                return Err(AuthError::InvalidOrExpiredToken);
            }
        };

        let Some(user) = self.users.find_by_email(&record.email).await? else {
            warn!(email = %record.email, "reset token owner no longer exists");
            return Err(AuthError::UserNotFound);
        };

        let changes = UserChanges {
            password_hash: Some(hash_password_blocking(req.new_password).await?),
            ..Default::default()
        };
        if self.users.update(user.id, &changes).await?.is_none() {
            return Err(AuthError::UserNotFound);
        }

        info!(user_id = %user.id, "password reset");
        Ok(MessageResponse::new("Password has been reset"))
    }

    /// Drops expired reset tokens and revocations of tokens past their `exp`.
    pub async fn purge_expired(&self) -> Result<(u64, u64), AuthError> {
        let now = self.clock.now();
        let resets = self.resets.purge_expired(now).await?;
        let revocations = self.revocations.purge_expired(now).await?;
        Ok((resets, revocations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation() {
        assert!(is_valid_email("alice@example.com"));
        assert!(!is_valid_email("alice"));
        assert!(!is_valid_email("alice@example"));
        assert!(!is_valid_email("al ice@example.com"));
        assert!(!is_valid_email(&format!("{}@example.com", "a".repeat(260))));
    }

    #[test]
    fn emails_are_trimmed_and_lowercased() {
        assert_eq!(
            normalize_email("  Alice@Example.COM ").unwrap(),
            "alice@example.com"
        );
        assert!(matches!(
            normalize_email("nope").unwrap_err(),
            AuthError::Validation(_)
        ));
    }

    #[test]
    fn names_must_be_non_blank() {
        assert_eq!(normalize_name("first_name", " Al ").unwrap(), "Al");
        assert!(normalize_name("first_name", "   ").is_err());
        assert!(normalize_name("last_name", &"x".repeat(101)).is_err());
    }

    #[test]
    fn password_bounds() {
        assert!(check_password("pw123").is_ok());
        assert!(check_password("").is_err());
        assert!(check_password(&"p".repeat(129)).is_err());
    }

    #[test]
    fn reset_tokens_carry_32_bytes() {
        let token = generate_reset_token();
        let decoded = URL_SAFE_NO_PAD.decode(&token).expect("base64");
        assert_eq!(decoded.len(), 32);
        assert_ne!(token, generate_reset_token());
    }
}
