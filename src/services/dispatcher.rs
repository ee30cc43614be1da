// src/services/dispatcher.rs
//! Node command dispatcher.
//!
//! Every change pushed to an agent goes through [`Dispatcher::dispatch`]. Callers
//! state up front whether a failure must gate their operation
//! ([`SyncMode::Required`]) or is only logged ([`SyncMode::BestEffort`]), and for
//! fan-out whether to stop at the first failing node ([`FanOut::FailFast`]) or try
//! them all ([`FanOut::AttemptAll`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::db::Database;
use crate::models::Node;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("node {0} does not exist")]
    NodeNotFound(i64),

    #[error("node {node_id} is unreachable: {reason}")]
    Unreachable { node_id: i64, reason: String },

    #[error("node {node_id} rejected the command (status {status}): {msg}")]
    Rejected { node_id: i64, status: u16, msg: String },

    #[error("node {node_id} sent a malformed reply: {reason}")]
    Malformed { node_id: i64, reason: String },

    #[error("node lookup failed: {0}")]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Failure is returned and must trigger compensation.
    Required,
    /// Failure is logged and swallowed.
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOut {
    FailFast,
    AttemptAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    CreateService,
    UpdateService,
    DeleteService,
    PauseService,
    ResumeService,
    AddChains,
    DeleteChains,
    DeleteLimiters,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::CreateService => "CreateService",
            CommandKind::UpdateService => "UpdateService",
            CommandKind::DeleteService => "DeleteService",
            CommandKind::PauseService => "PauseService",
            CommandKind::ResumeService => "ResumeService",
            CommandKind::AddChains => "AddChains",
            CommandKind::DeleteChains => "DeleteChains",
            CommandKind::DeleteLimiters => "DeleteLimiters",
        }
    }

    /// Agent replies that mean the desired state already holds.
    fn is_idempotent_reply(self, msg: &str) -> bool {
        let msg = msg.to_ascii_lowercase();
        match self {
            CommandKind::CreateService | CommandKind::AddChains => msg.contains("exists"),
            CommandKind::DeleteService
            | CommandKind::PauseService
            | CommandKind::ResumeService
            | CommandKind::DeleteChains
            | CommandKind::DeleteLimiters => msg.contains("not found"),
            CommandKind::UpdateService => false,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CreateService" => Ok(CommandKind::CreateService),
            "UpdateService" => Ok(CommandKind::UpdateService),
            "DeleteService" => Ok(CommandKind::DeleteService),
            "PauseService" => Ok(CommandKind::PauseService),
            "ResumeService" => Ok(CommandKind::ResumeService),
            "AddChains" => Ok(CommandKind::AddChains),
            "DeleteChains" => Ok(CommandKind::DeleteChains),
            "DeleteLimiters" => Ok(CommandKind::DeleteLimiters),
            other => Err(format!("unknown command type: {}", other)),
        }
    }
}

/// Agent-side name of a forward's services: `{forward}_{user}_{userTunnel}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceName {
    pub forward_id: i64,
    pub user_id: i64,
    pub user_tunnel_id: i64,
}

impl ServiceName {
    pub fn new(forward_id: i64, user_id: i64, user_tunnel_id: i64) -> Self {
        Self {
            forward_id,
            user_id,
            user_tunnel_id,
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.forward_id, self.user_id, self.user_tunnel_id)
    }
}

impl FromStr for ServiceName {
    type Err = String;

    /// Accepts the base name or a protocol-suffixed one (`1_2_3_tcp`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('_').collect();
        if parts.len() < 3 {
            return Err(format!("invalid service name: {}", s));
        }
        let parse = |v: &str| {
            v.parse::<i64>()
                .map_err(|_| format!("invalid service name: {}", s))
        };
        let forward_id = parse(parts[0])?;
        let user_id = parse(parts[1])?;
        let user_tunnel_id = parse(parts[2])?;
        if forward_id <= 0 || user_id <= 0 || user_tunnel_id < 0 {
            return Err(format!("invalid service name: {}", s));
        }
        Ok(Self::new(forward_id, user_id, user_tunnel_id))
    }
}

/// Names a service command operates on for a forward base name.
///
/// Pause and resume touch the protocol services only. Delete also removes the
/// un-suffixed base so services left by older agents do not linger.
pub fn expand_service_names(kind: CommandKind, base: &str) -> Vec<String> {
    match kind {
        CommandKind::DeleteService => vec![
            base.to_string(),
            format!("{}_tcp", base),
            format!("{}_udp", base),
        ],
        CommandKind::PauseService | CommandKind::ResumeService => {
            vec![format!("{}_tcp", base), format!("{}_udp", base)]
        }
        _ => vec![base.to_string()],
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceTarget {
    Forward(ServiceName),
    /// Sent verbatim.
    Named(Vec<String>),
}

impl ServiceTarget {
    fn names(&self, kind: CommandKind) -> Vec<String> {
        match self {
            ServiceTarget::Forward(name) => expand_service_names(kind, &name.to_string()),
            ServiceTarget::Named(names) => names.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorSpec {
    pub strategy: String,
    pub max_fails: u32,
    pub fail_timeout: String,
}

impl SelectorSpec {
    pub fn new(strategy: &str) -> Self {
        Self {
            strategy: strategy.to_string(),
            max_fails: 1,
            fail_timeout: "600s".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub name: String,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwarderSpec {
    pub nodes: Vec<TargetSpec>,
    pub selector: SelectorSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub addr: String,
    pub handler: TypeSpec,
    pub listener: TypeSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarder: Option<ForwarderSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limiter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainNodeSpec {
    pub name: String,
    pub addr: String,
    pub connector: TypeSpec,
    pub dialer: TypeSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopSpec {
    pub name: String,
    pub selector: SelectorSpec,
    pub nodes: Vec<ChainNodeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSpec {
    pub name: String,
    pub hops: Vec<HopSpec>,
}

/// A command addressed to one agent.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeCommand {
    CreateService(Vec<ServiceSpec>),
    UpdateService(Vec<ServiceSpec>),
    DeleteService(ServiceTarget),
    PauseService(ServiceTarget),
    ResumeService(ServiceTarget),
    AddChains(ChainSpec),
    DeleteChains(String),
    DeleteLimiters(String),
}

impl NodeCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            NodeCommand::CreateService(_) => CommandKind::CreateService,
            NodeCommand::UpdateService(_) => CommandKind::UpdateService,
            NodeCommand::DeleteService(_) => CommandKind::DeleteService,
            NodeCommand::PauseService(_) => CommandKind::PauseService,
            NodeCommand::ResumeService(_) => CommandKind::ResumeService,
            NodeCommand::AddChains(_) => CommandKind::AddChains,
            NodeCommand::DeleteChains(_) => CommandKind::DeleteChains,
            NodeCommand::DeleteLimiters(_) => CommandKind::DeleteLimiters,
        }
    }

    pub fn payload(&self) -> Value {
        let kind = self.kind();
        match self {
            NodeCommand::CreateService(specs) | NodeCommand::UpdateService(specs) => json!(specs),
            NodeCommand::DeleteService(target)
            | NodeCommand::PauseService(target)
            | NodeCommand::ResumeService(target) => json!({ "services": target.names(kind) }),
            NodeCommand::AddChains(chain) => json!(chain),
            NodeCommand::DeleteChains(name) => json!({ "chain": name }),
            NodeCommand::DeleteLimiters(name) => json!({ "limiter": name }),
        }
    }

    pub fn envelope(&self) -> CommandEnvelope {
        CommandEnvelope {
            kind: self.kind().as_str().to_string(),
            data: self.payload(),
        }
    }
}

/// Wire form: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandReply {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn send(
        &self,
        node: &Node,
        envelope: &CommandEnvelope,
    ) -> Result<CommandReply, DispatchError>;
}

/// Posts envelopes to the agent's management API, or to the partner's
/// federation relay when the node is leased from a peer.
pub struct HttpNodeTransport {
    client: reqwest::Client,
}

impl HttpNodeTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn endpoint(node: &Node) -> (String, &str) {
        if node.is_remote() {
            (
                format!(
                    "{}/api/v1/federation/command",
                    node.remote_url.trim_end_matches('/')
                ),
                node.remote_token.as_str(),
            )
        } else {
            let host = if node.server_ip.contains(':') && !node.server_ip.starts_with('[') {
                format!("[{}]", node.server_ip)
            } else {
                node.server_ip.clone()
            };
            (
                format!("http://{}:{}/api/command", host, node.api_port),
                node.secret.as_str(),
            )
        }
    }
}

#[async_trait]
impl NodeTransport for HttpNodeTransport {
    async fn send(
        &self,
        node: &Node,
        envelope: &CommandEnvelope,
    ) -> Result<CommandReply, DispatchError> {
        let (url, token) = Self::endpoint(node);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(envelope)
            .send()
            .await
            .map_err(|e| DispatchError::Unreachable {
                node_id: node.id,
                reason: e.to_string(),
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DispatchError::Unreachable {
                node_id: node.id,
                reason: e.to_string(),
            })?;

        if !status.is_success() {
            return Err(DispatchError::Rejected {
                node_id: node.id,
                status: status.as_u16(),
                msg: body.chars().take(200).collect(),
            });
        }

        serde_json::from_str::<CommandReply>(&body).map_err(|e| DispatchError::Malformed {
            node_id: node.id,
            reason: e.to_string(),
        })
    }
}

pub struct Dispatcher {
    db: Database,
    transport: Arc<dyn NodeTransport>,
}

impl Dispatcher {
    pub fn new(db: Database, transport: Arc<dyn NodeTransport>) -> Self {
        Self { db, transport }
    }

    pub async fn dispatch(
        &self,
        node_id: i64,
        command: &NodeCommand,
        mode: SyncMode,
    ) -> Result<(), DispatchError> {
        self.dispatch_envelope(node_id, &command.envelope(), mode)
            .await
    }

    /// Sends a pre-built envelope, e.g. one relayed from a federation partner.
    pub async fn dispatch_envelope(
        &self,
        node_id: i64,
        envelope: &CommandEnvelope,
        mode: SyncMode,
    ) -> Result<(), DispatchError> {
        match self.send(node_id, envelope).await {
            Ok(()) => Ok(()),
            Err(e) if mode == SyncMode::BestEffort => {
                warn!(node_id, command = %envelope.kind, "Best-effort dispatch failed: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Sends one command to several nodes, returning the first failure.
    pub async fn dispatch_all(
        &self,
        node_ids: &[i64],
        command: &NodeCommand,
        mode: SyncMode,
        fan_out: FanOut,
    ) -> Result<(), DispatchError> {
        let mut first_error = None;
        for &node_id in node_ids {
            if let Err(e) = self.dispatch(node_id, command, mode).await {
                if fan_out == FanOut::FailFast {
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn send(&self, node_id: i64, envelope: &CommandEnvelope) -> Result<(), DispatchError> {
        let node = self
            .db
            .find_node(node_id)
            .await?
            .ok_or(DispatchError::NodeNotFound(node_id))?;

        let kind = CommandKind::from_str(&envelope.kind).map_err(|reason| {
            DispatchError::Malformed {
                node_id,
                reason,
            }
        })?;

        let reply = self.transport.send(&node, envelope).await?;
        if reply.code == 0 || kind.is_idempotent_reply(&reply.msg) {
            debug!(node_id, command = %kind, "Node accepted command");
            return Ok(());
        }

        Err(DispatchError::Rejected {
            node_id,
            status: 200,
            msg: reply.msg,
        })
    }
}

/// A command observed by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentCommand {
    pub node_id: i64,
    pub kind: String,
    pub data: Value,
}

/// In-process transport that records every envelope and refuses to deliver to
/// nodes marked unreachable. Used by tests and local dry runs.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentCommand>>,
    unreachable: Mutex<HashSet<i64>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_node(&self, node_id: i64) {
        self.unreachable.lock().await.insert(node_id);
    }

    pub async fn restore_node(&self, node_id: i64) {
        self.unreachable.lock().await.remove(&node_id);
    }

    pub async fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self, node_id: i64) -> Vec<SentCommand> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|c| c.node_id == node_id)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }
}

#[async_trait]
impl NodeTransport for RecordingTransport {
    async fn send(
        &self,
        node: &Node,
        envelope: &CommandEnvelope,
    ) -> Result<CommandReply, DispatchError> {
        if self.unreachable.lock().await.contains(&node.id) {
            return Err(DispatchError::Unreachable {
                node_id: node.id,
                reason: "connection refused".to_string(),
            });
        }
        self.sent.lock().await.push(SentCommand {
            node_id: node.id,
            kind: envelope.kind.clone(),
            data: envelope.data.clone(),
        });
        Ok(CommandReply {
            code: 0,
            msg: "OK".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewNode;

    async fn setup() -> (Database, Arc<RecordingTransport>, Dispatcher) {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = Dispatcher::new(db.clone(), transport.clone());
        (db, transport, dispatcher)
    }

    async fn node(db: &Database, name: &str) -> i64 {
        db.create_node(&NewNode {
            name: name.to_string(),
            secret: format!("{}-secret", name),
            server_ip: "10.0.0.1".to_string(),
            api_port: 8088,
            port_range: "20000-20010".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
        .id
    }

    #[test]
    fn test_pause_and_resume_expand_to_protocol_services() {
        for kind in [CommandKind::PauseService, CommandKind::ResumeService] {
            assert_eq!(
                expand_service_names(kind, "7_3_2"),
                vec!["7_3_2_tcp".to_string(), "7_3_2_udp".to_string()]
            );
        }
    }

    #[test]
    fn test_delete_expands_to_base_and_protocol_services() {
        assert_eq!(
            expand_service_names(CommandKind::DeleteService, "7_3_2"),
            vec![
                "7_3_2".to_string(),
                "7_3_2_tcp".to_string(),
                "7_3_2_udp".to_string()
            ]
        );
    }

    #[test]
    fn test_service_name_parsing() {
        let name: ServiceName = "12_4_9".parse().unwrap();
        assert_eq!(name, ServiceName::new(12, 4, 9));
        assert_eq!(name.to_string(), "12_4_9");

        let suffixed: ServiceName = "12_4_0_tcp".parse().unwrap();
        assert_eq!(suffixed.user_tunnel_id, 0);

        assert!("web_api".parse::<ServiceName>().is_err());
        assert!("0_4_9".parse::<ServiceName>().is_err());
        assert!("12_0_9".parse::<ServiceName>().is_err());
        assert!("12_4".parse::<ServiceName>().is_err());
    }

    #[test]
    fn test_envelope_shape() {
        let cmd = NodeCommand::PauseService(ServiceTarget::Forward(ServiceName::new(1, 2, 3)));
        let envelope = cmd.envelope();
        assert_eq!(envelope.kind, "PauseService");
        assert_eq!(envelope.data, json!({"services": ["1_2_3_tcp", "1_2_3_udp"]}));

        let chains = NodeCommand::DeleteChains("chains_4".to_string()).envelope();
        assert_eq!(chains.data, json!({"chain": "chains_4"}));
    }

    #[test]
    fn test_idempotent_replies() {
        assert!(CommandKind::CreateService.is_idempotent_reply("service 1_2_3_tcp already exists"));
        assert!(CommandKind::DeleteService.is_idempotent_reply("service 1_2_3 not found"));
        assert!(!CommandKind::UpdateService.is_idempotent_reply("not found"));
        assert!(!CommandKind::CreateService.is_idempotent_reply("not found"));
    }

    #[tokio::test]
    async fn test_required_dispatch_surfaces_failure() {
        let (db, transport, dispatcher) = setup().await;
        let id = node(&db, "edge").await;
        transport.fail_node(id).await;

        let cmd = NodeCommand::DeleteChains("chains_1".to_string());
        let err = dispatcher
            .dispatch(id, &cmd, SyncMode::Required)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unreachable { .. }));

        assert!(dispatcher.dispatch(id, &cmd, SyncMode::BestEffort).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_node_is_reported() {
        let (_db, _transport, dispatcher) = setup().await;
        let cmd = NodeCommand::DeleteLimiters("1".to_string());
        let err = dispatcher
            .dispatch(99, &cmd, SyncMode::Required)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("node 99"));
    }

    #[tokio::test]
    async fn test_fan_out_modes() {
        let (db, transport, dispatcher) = setup().await;
        let a = node(&db, "a").await;
        let b = node(&db, "b").await;
        let c = node(&db, "c").await;
        transport.fail_node(b).await;

        let cmd = NodeCommand::DeleteChains("chains_9".to_string());

        let err = dispatcher
            .dispatch_all(&[a, b, c], &cmd, SyncMode::Required, FanOut::FailFast)
            .await;
        assert!(err.is_err());
        assert!(transport.sent_to(c).await.is_empty());

        transport.clear().await;
        let err = dispatcher
            .dispatch_all(&[a, b, c], &cmd, SyncMode::Required, FanOut::AttemptAll)
            .await;
        assert!(matches!(err, Err(DispatchError::Unreachable { node_id, .. }) if node_id == b));
        assert_eq!(transport.sent_to(a).await.len(), 1);
        assert_eq!(transport.sent_to(c).await.len(), 1);
    }
}
