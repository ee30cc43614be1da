// src/auth/mod.rs
pub mod jwt;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::AppError;
use crate::models::{ADMIN_ROLE_ID, STATUS_ACTIVE};
use crate::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64, // user id
    pub username: String,
    pub role_id: i64,
    pub exp: usize,
    pub iat: usize,
}

/// Caller of the administrative API. The role comes from the user row, so a
/// demotion takes effect without waiting for the token to expire.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: i64,
    pub username: String,
    pub role_id: i64,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role_id == ADMIN_ROLE_ID
    }
}

pub(crate) fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_string()))?;
        let claims = jwt::validate_token(&state.config.jwt_secret, token)
            .map_err(|_| AppError::Unauthorized("invalid or expired token".to_string()))?;

        let user = state
            .db
            .find_user(claims.sub)
            .await?
            .ok_or_else(|| AppError::Unauthorized("account no longer exists".to_string()))?;
        if user.status != STATUS_ACTIVE {
            return Err(AppError::Forbidden("account is disabled".to_string()));
        }

        Ok(AuthUser {
            id: user.id,
            username: user.user,
            role_id: user.role_id,
        })
    }
}

#[derive(Debug)]
pub struct AdminUser(pub AuthUser);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if user.is_admin() {
            Ok(AdminUser(user))
        } else {
            Err(AppError::Forbidden("administrator role required".to_string()))
        }
    }
}
