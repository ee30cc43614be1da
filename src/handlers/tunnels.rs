// src/handlers/tunnels.rs
use axum::{extract::State, Json};
use std::sync::Arc;

use super::{done, success, ApiResult};
use crate::auth::{AdminUser, AuthUser};
use crate::models::*;
use crate::AppState;

pub async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<TunnelRequest>,
) -> ApiResult {
    success(state.orchestrator.create_tunnel(req).await?)
}

pub async fn update_tunnel(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<TunnelRequest>,
) -> ApiResult {
    success(state.orchestrator.update_tunnel(req).await?)
}

pub async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<IdRequest>,
) -> ApiResult {
    state.orchestrator.delete_tunnel(req.id).await?;
    done()
}

pub async fn list_tunnels(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
) -> ApiResult {
    success(state.orchestrator.list_tunnels(&admin).await?)
}

/// Tunnels the caller may put forwards on.
pub async fn user_tunnels(State(state): State<Arc<AppState>>, caller: AuthUser) -> ApiResult {
    success(state.orchestrator.list_tunnels(&caller).await?)
}
