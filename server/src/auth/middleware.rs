//! Authentication middleware.
//!
//! Clients present `Authorization: Bearer <token>`. When `AUTH_SECRET` is
//! configured the token must match it; otherwise any request is accepted.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Proof that a request passed authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthUser {
    /// No secret is configured.
    Anonymous,
    /// The request carried the configured secret.
    Token,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        authorize(header, state.config.auth_secret.as_deref())
    }
}

/// Check an `Authorization` header value against `secret`.
pub fn authorize(header: Option<&str>, secret: Option<&str>) -> Result<AuthUser, AppError> {
    let Some(secret) = secret else {
        return Ok(AuthUser::Anonymous);
    };

    let header = header.ok_or(AppError::Unauthorized("Missing authorization header"))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(AppError::Unauthorized("Invalid authorization header format"))?;

    if token.is_empty() {
        return Err(AppError::Unauthorized("Empty bearer token"));
    }
    if token != secret {
        tracing::debug!("rejected bearer token");
        return Err(AppError::Unauthorized("Invalid token"));
    }
    Ok(AuthUser::Token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_when_no_secret() {
        assert_eq!(authorize(None, None).unwrap(), AuthUser::Anonymous);
        assert_eq!(authorize(Some("garbage"), None).unwrap(), AuthUser::Anonymous);
    }

    #[test]
    fn secret_must_match() {
        assert_eq!(
            authorize(Some("Bearer s3cret"), Some("s3cret")).unwrap(),
            AuthUser::Token
        );
        assert!(authorize(None, Some("s3cret")).is_err());
        assert!(authorize(Some("s3cret"), Some("s3cret")).is_err());
        assert!(authorize(Some("Bearer "), Some("s3cret")).is_err());
        assert!(authorize(Some("Bearer nope"), Some("s3cret")).is_err());
    }
}
