// src/routes.rs
use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{federation, flow, forwards, nodes, permissions, tunnels, users};
use crate::middleware::peer_auth::require_peer_share;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Partner-facing federation API, authenticated by share token
    let peer = Router::new()
        .route("/api/v1/federation/connect", post(federation::connect))
        .route("/api/v1/federation/usage", post(federation::usage))
        .route("/api/v1/federation/runtime/reserve", post(federation::reserve_runtime))
        .route("/api/v1/federation/runtime/apply", post(federation::apply_runtime))
        .route("/api/v1/federation/runtime/release", post(federation::release_runtime))
        .route("/api/v1/federation/command", post(federation::relay_command))
        .route_layer(from_fn_with_state(state.clone(), require_peer_share));

    Router::new()
        // Agent endpoints
        .route("/flow/upload", post(flow::upload))
        .route("/flow/config", post(flow::config))
        .route("/flow/test", get(flow::test).post(flow::test))
        // Nodes
        .route("/api/v1/node/create", post(nodes::create_node))
        .route("/api/v1/node/list", post(nodes::list_nodes))
        .route("/api/v1/node/delete", post(nodes::delete_node))
        // Tunnels
        .route("/api/v1/tunnel/create", post(tunnels::create_tunnel))
        .route("/api/v1/tunnel/update", post(tunnels::update_tunnel))
        .route("/api/v1/tunnel/delete", post(tunnels::delete_tunnel))
        .route("/api/v1/tunnel/list", post(tunnels::list_tunnels))
        .route("/api/v1/tunnel/user/tunnel", post(tunnels::user_tunnels))
        // Forwards
        .route("/api/v1/forward/create", post(forwards::create_forward))
        .route("/api/v1/forward/update", post(forwards::update_forward))
        .route("/api/v1/forward/batch-tunnel", post(forwards::batch_retunnel))
        .route("/api/v1/forward/pause", post(forwards::pause_forward))
        .route("/api/v1/forward/resume", post(forwards::resume_forward))
        .route("/api/v1/forward/delete", post(forwards::delete_forward))
        .route("/api/v1/forward/list", post(forwards::list_forwards))
        // Users and grants
        .route("/api/v1/user/create", post(users::create_user))
        .route("/api/v1/user/list", post(users::list_users))
        .route("/api/v1/user/flow-stats", post(users::flow_statistics))
        .route("/api/v1/user/tunnel/assign", post(permissions::assign_user_tunnel))
        .route("/api/v1/user/tunnel/remove", post(permissions::remove_user_tunnel))
        // Groups
        .route("/api/v1/group/user/create", post(permissions::create_user_group))
        .route("/api/v1/group/tunnel/create", post(permissions::create_tunnel_group))
        .route("/api/v1/group/user/assign", post(permissions::assign_group_users))
        .route("/api/v1/group/tunnel/assign", post(permissions::assign_group_tunnels))
        .route(
            "/api/v1/group/permission/assign",
            post(permissions::assign_group_permission),
        )
        .route(
            "/api/v1/group/permission/remove",
            post(permissions::remove_group_permission),
        )
        // Federation administration
        .route("/api/v1/federation/share/create", post(federation::create_share))
        .route("/api/v1/federation/share/update", post(federation::update_share))
        .route("/api/v1/federation/share/list", post(federation::list_shares))
        .route("/api/v1/federation/share/delete", post(federation::delete_share))
        .route(
            "/api/v1/federation/share/reset-flow",
            post(federation::reset_share_flow),
        )
        .route(
            "/api/v1/federation/share/remote-usage/list",
            post(federation::list_remote_usage),
        )
        .merge(peer)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
