// src/handlers/federation.rs
use axum::{extract::State, Extension, Json};
use std::sync::Arc;

use super::{done, success, ApiResult};
use crate::auth::AdminUser;
use crate::models::*;
use crate::services::dispatcher::CommandEnvelope;
use crate::AppState;

// Share administration

pub async fn create_share(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<CreatePeerShareRequest>,
) -> ApiResult {
    success(state.federation.create_share(req).await?)
}

pub async fn update_share(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<UpdatePeerShareRequest>,
) -> ApiResult {
    success(state.federation.update_share(req).await?)
}

pub async fn delete_share(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<IdRequest>,
) -> ApiResult {
    state.federation.delete_share(req.id).await?;
    done()
}

pub async fn reset_share_flow(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<IdRequest>,
) -> ApiResult {
    state.federation.reset_share_flow(req.id).await?;
    done()
}

pub async fn list_shares(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
) -> ApiResult {
    success(state.federation.list_shares().await?)
}

/// Always succeeds; unreachable partners are reported per item via `syncError`.
pub async fn list_remote_usage(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
) -> ApiResult {
    success(state.federation.list_remote_usage().await?)
}

// Partner API. `require_peer_share` has already resolved the share.

pub async fn connect(
    State(state): State<Arc<AppState>>,
    Extension(share): Extension<PeerShare>,
) -> ApiResult {
    success(state.federation.connect(&share).await?)
}

pub async fn usage(
    State(state): State<Arc<AppState>>,
    Extension(share): Extension<PeerShare>,
) -> ApiResult {
    success(state.federation.share_usage(&share).await?)
}

pub async fn reserve_runtime(
    State(state): State<Arc<AppState>>,
    Extension(share): Extension<PeerShare>,
    Json(req): Json<ReserveRuntimeRequest>,
) -> ApiResult {
    success(state.federation.reserve_runtime(&share, req).await?)
}

pub async fn apply_runtime(
    State(state): State<Arc<AppState>>,
    Extension(share): Extension<PeerShare>,
    Json(req): Json<RuntimeRefRequest>,
) -> ApiResult {
    state.federation.apply_runtime(&share, req).await?;
    done()
}

pub async fn release_runtime(
    State(state): State<Arc<AppState>>,
    Extension(share): Extension<PeerShare>,
    Json(req): Json<RuntimeRefRequest>,
) -> ApiResult {
    state.federation.release_runtime(&share, req).await?;
    done()
}

pub async fn relay_command(
    State(state): State<Arc<AppState>>,
    Extension(share): Extension<PeerShare>,
    Json(envelope): Json<CommandEnvelope>,
) -> ApiResult {
    state.federation.relay_command(&share, envelope).await?;
    done()
}
