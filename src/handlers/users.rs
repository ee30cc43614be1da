// src/handlers/users.rs
use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::info;

use super::{success, ApiResult};
use crate::auth::{AdminUser, AuthUser};
use crate::error::AppError;
use crate::models::*;
use crate::utils::validation::validate_name;
use crate::AppState;

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult {
    validate_name(&req.user).map_err(AppError::Validation)?;
    if req.flow < 0 || req.exp_time < 0 || !(0..=31).contains(&req.flow_reset_time) {
        return Err(AppError::validation("invalid quota terms"));
    }

    let user = state
        .db
        .create_user(
            req.user.trim(),
            req.role_id,
            req.flow,
            req.exp_time,
            req.flow_reset_time,
        )
        .await?;
    info!(user_id = user.id, "User created");
    success(user)
}

pub async fn list_users(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
) -> ApiResult {
    success(state.db.list_users().await?)
}

/// Hourly usage snapshots; non-admins only see their own.
pub async fn flow_statistics(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(req): Json<IdRequest>,
) -> ApiResult {
    let user_id = if req.id == 0 { caller.id } else { req.id };
    if !caller.is_admin() && user_id != caller.id {
        return Err(AppError::not_found("user does not exist"));
    }
    success(state.db.list_statistics(user_id).await?)
}
