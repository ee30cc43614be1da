// src/models.rs
use serde::{Deserialize, Serialize};

pub const BYTES_PER_GB: i64 = 1024 * 1024 * 1024;

/// Byte limit of a quota given in GiB. Saturates instead of wrapping, so an
/// oversized quota behaves as "practically unlimited".
pub fn quota_bytes(gb: i64) -> i64 {
    gb.saturating_mul(BYTES_PER_GB)
}

/// Service name reserved for the agent's own management API; never accounted.
pub const RESERVED_SERVICE_NAME: &str = "web_api";

pub const STATUS_ACTIVE: i64 = 1;
pub const STATUS_INACTIVE: i64 = 0;

pub const ADMIN_ROLE_ID: i64 = 0;

pub const DEFAULT_FORWARD_STRATEGY: &str = "fifo";
pub const DEFAULT_HOP_STRATEGY: &str = "round";
pub const DEFAULT_HOP_PROTOCOL: &str = "tls";

/// Hop role inside a tunnel, stored as `chain_tunnel.chain_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChainRole {
    Entry = 1,
    Middle = 2,
    Exit = 3,
}

impl ChainRole {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(ChainRole::Entry),
            2 => Some(ChainRole::Middle),
            3 => Some(ChainRole::Exit),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelType {
    Direct = 1,
    Chained = 2,
}

impl TunnelType {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(TunnelType::Direct),
            2 => Some(TunnelType::Chained),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

// Database models
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub server_ip: String,
    pub api_port: i64,
    pub port_range: String,
    pub tcp_listen_addr: String,
    pub udp_listen_addr: String,
    pub interface_name: String,
    pub http: i64,
    pub tls: i64,
    pub socks: i64,
    pub status: i64,
    pub is_remote: i64,
    pub remote_url: String,
    #[serde(skip_serializing)]
    pub remote_token: String,
    #[serde(skip_serializing)]
    pub remote_config: String,
    pub last_seen: i64,
    pub created_time: i64,
    pub updated_time: i64,
}

impl Node {
    pub fn is_remote(&self) -> bool {
        self.is_remote != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Tunnel {
    pub id: i64,
    pub name: String,
    pub tunnel_type: i64,
    pub traffic_ratio: f64,
    pub flow_factor: f64,
    pub flow_quota: i64,
    pub protocol: String,
    pub status: i64,
    pub created_time: i64,
    pub updated_time: i64,
}

/// One hop of a tunnel (`chain_tunnel` row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ChainTunnel {
    pub id: i64,
    pub tunnel_id: i64,
    pub chain_type: i64,
    pub inx: i64,
    pub node_id: i64,
    pub port: i64,
    pub protocol: String,
    pub strategy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Forward {
    pub id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub name: String,
    pub tunnel_id: i64,
    pub remote_addr: String,
    pub strategy: String,
    pub in_flow: i64,
    pub out_flow: i64,
    pub status: i64,
    pub created_time: i64,
    pub updated_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ForwardPort {
    pub id: i64,
    pub forward_id: i64,
    pub node_id: i64,
    pub port: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub user: String,
    pub role_id: i64,
    pub flow: i64,
    pub in_flow: i64,
    pub out_flow: i64,
    pub flow_reset_time: i64,
    pub num: i64,
    pub exp_time: i64,
    pub status: i64,
    pub created_time: i64,
    pub updated_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserTunnel {
    pub id: i64,
    pub user_id: i64,
    pub tunnel_id: i64,
    pub speed_id: Option<i64>,
    pub num: i64,
    pub flow: i64,
    pub in_flow: i64,
    pub out_flow: i64,
    pub flow_reset_time: i64,
    pub exp_time: i64,
    pub status: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsFlow {
    pub id: i64,
    pub user_id: i64,
    pub flow: i64,
    pub total_flow: i64,
    pub time: String,
    pub created_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct GroupPermission {
    pub id: i64,
    pub user_group_id: i64,
    pub tunnel_group_id: i64,
    pub created_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct GroupPermissionGrant {
    pub id: i64,
    pub group_permission_id: i64,
    pub user_id: i64,
    pub user_tunnel_id: i64,
    pub created_user_tunnel: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PeerShare {
    pub id: i64,
    pub name: String,
    pub node_id: i64,
    pub token: String,
    pub max_bandwidth: i64,
    pub current_flow: i64,
    pub port_range_start: i64,
    pub port_range_end: i64,
    pub allowed_ips: String,
    pub expiry_time: i64,
    pub is_active: i64,
    pub created_time: i64,
    pub updated_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PeerShareRuntime {
    pub id: i64,
    pub share_id: i64,
    pub node_id: i64,
    pub reservation_id: String,
    pub resource_key: String,
    pub binding_id: String,
    pub role: String,
    pub chain_name: String,
    pub service_name: String,
    pub protocol: String,
    pub strategy: String,
    pub port: i64,
    pub target: String,
    pub applied: i64,
    pub status: i64,
    pub created_time: i64,
    pub updated_time: i64,
}

/// Relay record kinds.
pub const RELAY_SERVICE: &str = "service";
pub const RELAY_CHAIN: &str = "chain";

/// A service or chain a federation partner created on the shared node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PeerShareRelay {
    pub id: i64,
    pub share_id: i64,
    pub node_id: i64,
    pub kind: String,
    pub name: String,
    pub port: i64,
    pub created_time: i64,
}

// Request/Response types
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IdRequest {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodeRequest {
    pub name: String,
    pub secret: String,
    pub server_ip: String,
    #[serde(default)]
    pub api_port: Option<i64>,
    pub port_range: String,
    #[serde(default)]
    pub tcp_listen_addr: Option<String>,
    #[serde(default)]
    pub udp_listen_addr: Option<String>,
    #[serde(default)]
    pub interface_name: Option<String>,
    #[serde(default)]
    pub http: i64,
    #[serde(default)]
    pub tls: i64,
    #[serde(default)]
    pub socks: i64,
    #[serde(default)]
    pub is_remote: bool,
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub remote_token: Option<String>,
}

/// One node slot of a tunnel definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HopNodeRequest {
    pub node_id: i64,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub port: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRequest {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    #[serde(rename = "type")]
    pub tunnel_type: i64,
    #[serde(default)]
    pub traffic_ratio: Option<f64>,
    #[serde(default)]
    pub flow_factor: Option<f64>,
    #[serde(default, rename = "flow")]
    pub flow_quota: i64,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default, rename = "inNodeId")]
    pub in_nodes: Vec<HopNodeRequest>,
    #[serde(default)]
    pub chain_nodes: Vec<Vec<HopNodeRequest>>,
    #[serde(default, rename = "outNodeId")]
    pub out_nodes: Vec<HopNodeRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelDetail {
    #[serde(flatten)]
    pub tunnel: Tunnel,
    pub hops: Vec<ChainTunnel>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateForwardRequest {
    pub name: String,
    pub tunnel_id: i64,
    pub remote_addr: String,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub in_port: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateForwardRequest {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tunnel_id: Option<i64>,
    #[serde(default)]
    pub remote_addr: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRetunnelRequest {
    pub ids: Vec<i64>,
    pub tunnel_id: i64,
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub success_count: usize,
    pub fail_count: usize,
    pub failures: Vec<BatchFailure>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub id: i64,
    pub msg: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardView {
    #[serde(flatten)]
    pub forward: Forward,
    pub tunnel_name: String,
    pub ports: Vec<ForwardPort>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignUserTunnelRequest {
    pub user_id: i64,
    pub tunnel_id: i64,
    #[serde(default)]
    pub flow: i64,
    #[serde(default)]
    pub num: i64,
    #[serde(default)]
    pub exp_time: i64,
    #[serde(default)]
    pub flow_reset_time: i64,
    #[serde(default)]
    pub speed_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveUserTunnelRequest {
    pub user_id: i64,
    pub tunnel_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignGroupUsersRequest {
    pub group_id: i64,
    #[serde(default)]
    pub user_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignGroupTunnelsRequest {
    pub group_id: i64,
    #[serde(default)]
    pub tunnel_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignGroupPermissionRequest {
    pub user_group_id: i64,
    pub tunnel_group_id: i64,
}

/// A single usage sample pushed by an agent.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowSample {
    /// Service name
    pub n: String,
    /// Outbound bytes
    #[serde(default)]
    pub u: i64,
    /// Inbound bytes
    #[serde(default)]
    pub d: i64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FlowUpload {
    Batch(Vec<FlowSample>),
    Single(FlowSample),
}

impl FlowUpload {
    pub fn into_samples(self) -> Vec<FlowSample> {
        match self {
            FlowUpload::Batch(samples) => samples,
            FlowUpload::Single(sample) => vec![sample],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NamedItem {
    pub name: String,
}

/// Live configuration reported by an agent.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NodeLiveConfig {
    #[serde(default)]
    pub services: Vec<NamedItem>,
    #[serde(default)]
    pub chains: Vec<NamedItem>,
    #[serde(default)]
    pub limiters: Vec<NamedItem>,
}

#[derive(Debug, Deserialize)]
pub struct NodeSecretQuery {
    pub secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePeerShareRequest {
    pub name: String,
    pub node_id: i64,
    #[serde(default)]
    pub max_bandwidth: i64,
    pub port_range_start: i64,
    pub port_range_end: i64,
    #[serde(default)]
    pub allowed_ips: String,
    #[serde(default)]
    pub expiry_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePeerShareRequest {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub max_bandwidth: Option<i64>,
    #[serde(default)]
    pub port_range_start: Option<i64>,
    #[serde(default)]
    pub port_range_end: Option<i64>,
    #[serde(default)]
    pub allowed_ips: Option<String>,
    #[serde(default)]
    pub expiry_time: Option<i64>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsedPortDetail {
    pub port: i64,
    pub role: String,
    pub resource_key: String,
    pub binding_id: String,
    pub service_name: String,
}

/// Usage view of one share, served to the partner and to the admin list.
/// Consumers cache it verbatim in `node.remote_config`, so every field defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShareUsage {
    pub share_id: i64,
    pub name: String,
    pub node_id: i64,
    pub max_bandwidth: i64,
    pub current_flow: i64,
    pub port_range_start: i64,
    pub port_range_end: i64,
    pub expiry_time: i64,
    pub is_active: i64,
    pub active_runtime_num: i64,
    pub used_ports: Vec<i64>,
    pub used_port_details: Vec<UsedPortDetail>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareListItem {
    #[serde(flatten)]
    pub share: PeerShare,
    pub node_name: String,
    pub active_runtime_num: i64,
    pub used_ports: Vec<i64>,
    pub used_port_details: Vec<UsedPortDetail>,
}

/// Consumer-side view of a remote node's lease.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUsageItem {
    pub node_id: i64,
    pub node_name: String,
    pub remote_url: String,
    pub share_id: i64,
    pub share_name: String,
    pub max_bandwidth: i64,
    pub current_flow: i64,
    pub port_range_start: i64,
    pub port_range_end: i64,
    pub active_runtime_num: i64,
    pub used_ports: Vec<i64>,
    pub bindings: Vec<RemoteBinding>,
    pub last_synced: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sync_error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteBinding {
    pub tunnel_id: i64,
    pub tunnel_name: String,
    pub chain_type: i64,
    pub port: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRuntimeRequest {
    #[serde(default)]
    pub resource_key: String,
    #[serde(default)]
    pub binding_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub chain_name: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub port: Option<i64>,
    #[serde(default)]
    pub target: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationResponse {
    pub reservation_id: String,
    pub port: i64,
    pub server_ip: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeRefRequest {
    pub reservation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub user: String,
    #[serde(default = "default_role")]
    pub role_id: i64,
    #[serde(default)]
    pub flow: i64,
    #[serde(default)]
    pub exp_time: i64,
    #[serde(default)]
    pub flow_reset_time: i64,
}

fn default_role() -> i64 {
    1
}
