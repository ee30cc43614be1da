// src/handlers/forwards.rs
use axum::{extract::State, Json};
use std::sync::Arc;

use super::{done, success, ApiResult};
use crate::auth::AuthUser;
use crate::models::*;
use crate::AppState;

pub async fn create_forward(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(req): Json<CreateForwardRequest>,
) -> ApiResult {
    success(state.orchestrator.create_forward(&caller, req).await?)
}

pub async fn update_forward(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(req): Json<UpdateForwardRequest>,
) -> ApiResult {
    success(state.orchestrator.update_forward(&caller, req).await?)
}

pub async fn batch_retunnel(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(req): Json<BatchRetunnelRequest>,
) -> ApiResult {
    success(state.orchestrator.batch_retunnel(&caller, req).await?)
}

pub async fn pause_forward(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(req): Json<IdRequest>,
) -> ApiResult {
    state.orchestrator.pause_forward(&caller, req.id).await?;
    done()
}

pub async fn resume_forward(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(req): Json<IdRequest>,
) -> ApiResult {
    state.orchestrator.resume_forward(&caller, req.id).await?;
    done()
}

pub async fn delete_forward(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Json(req): Json<IdRequest>,
) -> ApiResult {
    state.orchestrator.delete_forward(&caller, req.id).await?;
    done()
}

pub async fn list_forwards(State(state): State<Arc<AppState>>, caller: AuthUser) -> ApiResult {
    success(state.orchestrator.list_forwards(&caller).await?)
}
