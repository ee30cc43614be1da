// src/handlers/permissions.rs
use axum::{extract::State, Json};
use serde_json::json;
use std::sync::Arc;

use super::{done, success, ApiResult};
use crate::auth::AdminUser;
use crate::models::*;
use crate::AppState;

pub async fn assign_user_tunnel(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<AssignUserTunnelRequest>,
) -> ApiResult {
    success(state.permissions.assign_user_tunnel(req).await?)
}

pub async fn remove_user_tunnel(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<RemoveUserTunnelRequest>,
) -> ApiResult {
    state.permissions.remove_user_tunnel(req).await?;
    done()
}

pub async fn create_user_group(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult {
    let id = state.permissions.create_user_group(req).await?;
    success(json!({ "id": id }))
}

pub async fn create_tunnel_group(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult {
    let id = state.permissions.create_tunnel_group(req).await?;
    success(json!({ "id": id }))
}

pub async fn assign_group_users(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<AssignGroupUsersRequest>,
) -> ApiResult {
    state.permissions.assign_group_users(req).await?;
    done()
}

pub async fn assign_group_tunnels(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<AssignGroupTunnelsRequest>,
) -> ApiResult {
    state.permissions.assign_group_tunnels(req).await?;
    done()
}

pub async fn assign_group_permission(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<AssignGroupPermissionRequest>,
) -> ApiResult {
    success(state.permissions.assign_group_permission(req).await?)
}

pub async fn remove_group_permission(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<IdRequest>,
) -> ApiResult {
    state.permissions.remove_group_permission(req.id).await?;
    done()
}
