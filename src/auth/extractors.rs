use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use tracing::warn;

use crate::error::AuthError;

/// Raw token from an `Authorization: Bearer <token>` header. Only the
/// transport is checked here; the auth service decides whether it is good.
pub struct BearerToken(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let auth = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| {
                warn!("missing Authorization header");
                AuthError::Unauthorized
            })?;

        let (scheme, token) = auth.split_once(' ').ok_or(AuthError::Unauthorized)?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            warn!("invalid auth scheme");
            return Err(AuthError::Unauthorized);
        }

        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Unauthorized);
        }
        Ok(BearerToken(token.to_string()))
    }
}
