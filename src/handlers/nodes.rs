// src/handlers/nodes.rs
use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::info;

use super::{done, success, ApiResult};
use crate::auth::AdminUser;
use crate::db::NewNode;
use crate::error::AppError;
use crate::models::*;
use crate::utils::token::generate_node_secret;
use crate::utils::validation::{parse_port_ranges, validate_name};
use crate::AppState;

const DEFAULT_AGENT_API_PORT: i64 = 8088;

pub async fn create_node(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<CreateNodeRequest>,
) -> ApiResult {
    validate_name(&req.name).map_err(AppError::Validation)?;
    if req.server_ip.trim().is_empty() {
        return Err(AppError::validation("server IP must not be empty"));
    }
    parse_port_ranges(&req.port_range).map_err(AppError::Validation)?;
    let api_port = req.api_port.unwrap_or(DEFAULT_AGENT_API_PORT);
    if !(1..=65535).contains(&api_port) {
        return Err(AppError::validation("API port must be between 1 and 65535"));
    }

    let remote_url = req.remote_url.unwrap_or_default();
    let remote_token = req.remote_token.unwrap_or_default();
    if req.is_remote {
        url::Url::parse(&remote_url)
            .map_err(|e| AppError::validation(format!("invalid remote URL: {}", e)))?;
        if remote_token.is_empty() {
            return Err(AppError::validation("remote nodes need the partner's share token"));
        }
    }

    let secret = if req.secret.trim().is_empty() {
        generate_node_secret()
    } else {
        req.secret.trim().to_string()
    };

    let node = state
        .db
        .create_node(&NewNode {
            name: req.name.trim().to_string(),
            secret,
            server_ip: req.server_ip.trim().to_string(),
            api_port,
            port_range: req.port_range.trim().to_string(),
            tcp_listen_addr: req.tcp_listen_addr.unwrap_or_else(|| "[::]".to_string()),
            udp_listen_addr: req.udp_listen_addr.unwrap_or_else(|| "[::]".to_string()),
            interface_name: req.interface_name.unwrap_or_default(),
            http: req.http,
            tls: req.tls,
            socks: req.socks,
            is_remote: req.is_remote,
            remote_url,
            remote_token,
            remote_config: String::new(),
        })
        .await?;

    info!(node_id = node.id, remote = req.is_remote, "Node created");
    success(node)
}

pub async fn list_nodes(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
) -> ApiResult {
    success(state.db.list_nodes().await?)
}

/// Refused while any hop, forward port or share still sits on the node.
pub async fn delete_node(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<IdRequest>,
) -> ApiResult {
    if state.db.find_node(req.id).await?.is_none() {
        return Err(AppError::not_found("node does not exist"));
    }
    let references = state.db.count_node_references(req.id).await?;
    if references > 0 {
        return Err(AppError::validation(format!(
            "node is still used by {} tunnel hop(s), forward port(s) or share(s)",
            references
        )));
    }

    state.db.delete_node(req.id).await?;
    info!(node_id = req.id, "Node deleted");
    done()
}
