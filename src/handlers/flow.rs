// src/handlers/flow.rs
//! Endpoints called by the agents themselves, authenticated by node secret.

use axum::extract::{Query, State};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::models::{FlowUpload, Node, NodeLiveConfig, NodeSecretQuery};
use crate::utils::now_millis;
use crate::AppState;

async fn authenticate_node(state: &AppState, secret: &str) -> Result<Node> {
    let node = state
        .db
        .find_node_by_secret(secret)
        .await?
        .ok_or_else(|| AppError::Unauthorized("unknown node secret".to_string()))?;
    state.db.mark_node_online(node.id, now_millis()).await?;
    Ok(node)
}

/// Accepts one `{n, u, d}` sample or an array of them.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodeSecretQuery>,
    body: String,
) -> Result<&'static str> {
    let node = authenticate_node(&state, &query.secret).await?;
    if body.trim().is_empty() {
        return Ok("ok");
    }

    let samples = serde_json::from_str::<FlowUpload>(&body)?.into_samples();
    let total = samples.len();
    let recorded = state.flow_policy.ingest_all(node.id, samples).await;
    debug!(node_id = node.id, total, recorded, "Flow upload processed");
    Ok("ok")
}

/// Live configuration snapshot; anything no longer backed by a row is removed.
/// Cleanup is advisory, so a snapshot that cannot be read is only logged.
pub async fn config(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodeSecretQuery>,
    body: String,
) -> Result<&'static str> {
    let node = authenticate_node(&state, &query.secret).await?;
    if body.trim().is_empty() {
        return Ok("ok");
    }
    match serde_json::from_str::<NodeLiveConfig>(&body) {
        Ok(live) => {
            state.reconciler.reconcile(node.id, &live).await;
        }
        Err(e) => warn!(node_id = node.id, "Ignoring unreadable config snapshot: {}", e),
    }
    Ok("ok")
}

pub async fn test() -> &'static str {
    "test"
}
