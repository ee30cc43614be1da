// src/services/federation.rs
//! Capacity leasing between control planes.
//!
//! Provider side: shares of a local node, handed to a partner together with a
//! bearer token. The partner reserves ports inside the share range, applies
//! services on them and may relay plain node commands.
//!
//! Consumer side: nodes marked remote are backed by a partner's share. Their
//! usage is pulled from the partner and cached on the node row; when the pull
//! fails the cache is served with a `syncError` note.

use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::*;
use crate::services::agent_config::{chain_tunnel_id, classify_service, ServiceOwner};
use crate::services::allocator::lowest_free_port;
use crate::services::dispatcher::{
    ChainSpec, CommandEnvelope, CommandKind, Dispatcher, ForwarderSpec, NodeCommand,
    SelectorSpec, ServiceSpec, ServiceTarget, SyncMode, TargetSpec, TypeSpec,
};
use crate::utils::now_millis;
use crate::utils::token::{generate_reservation_id, generate_share_token};
use crate::utils::validation::{validate_name, AllowList, PortRange};

pub struct FederationService {
    db: Database,
    dispatcher: Arc<Dispatcher>,
    http: reqwest::Client,
}

impl FederationService {
    pub fn new(db: Database, dispatcher: Arc<Dispatcher>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            db,
            dispatcher,
            http,
        })
    }

    // ------------------------------------------------------------------
    // Share administration
    // ------------------------------------------------------------------

    pub async fn create_share(&self, req: CreatePeerShareRequest) -> Result<PeerShare> {
        validate_name(&req.name).map_err(AppError::Validation)?;
        let node = self
            .db
            .find_node(req.node_id)
            .await?
            .ok_or_else(|| AppError::validation("node does not exist"))?;
        if node.is_remote() {
            return Err(AppError::validation("Only local nodes can be shared"));
        }
        let range = share_range(req.port_range_start, req.port_range_end)?;
        let allow = AllowList::parse(&req.allowed_ips).map_err(AppError::Validation)?;
        if req.max_bandwidth < 0 {
            return Err(AppError::validation("max bandwidth must not be negative"));
        }

        let share = self
            .db
            .insert_share(
                req.name.trim(),
                node.id,
                &generate_share_token(),
                req.max_bandwidth,
                i64::from(range.start),
                i64::from(range.end),
                &allow.to_storage(),
                req.expiry_time,
            )
            .await?;

        info!(share_id = share.id, node_id = node.id, "Peer share created");
        Ok(share)
    }

    pub async fn update_share(&self, req: UpdatePeerShareRequest) -> Result<PeerShare> {
        let mut share = self
            .db
            .find_share(req.id)
            .await?
            .ok_or_else(|| AppError::not_found("share does not exist"))?;

        if let Some(name) = req.name {
            validate_name(&name).map_err(AppError::Validation)?;
            share.name = name.trim().to_string();
        }
        if let Some(max_bandwidth) = req.max_bandwidth {
            if max_bandwidth < 0 {
                return Err(AppError::validation("max bandwidth must not be negative"));
            }
            share.max_bandwidth = max_bandwidth;
        }
        let start = req.port_range_start.unwrap_or(share.port_range_start);
        let end = req.port_range_end.unwrap_or(share.port_range_end);
        share_range(start, end)?;
        share.port_range_start = start;
        share.port_range_end = end;
        if let Some(allowed_ips) = req.allowed_ips {
            share.allowed_ips = AllowList::parse(&allowed_ips)
                .map_err(AppError::Validation)?
                .to_storage();
        }
        if let Some(expiry_time) = req.expiry_time {
            share.expiry_time = expiry_time;
        }
        if let Some(active) = req.is_active {
            share.is_active = active as i64;
        }

        self.db.update_share(&share).await?;
        Ok(self.db.get_share(share.id).await?)
    }

    /// Removes the share with its runtimes and relay records. Services and
    /// chains the partner put on the node are withdrawn best-effort.
    pub async fn delete_share(&self, id: i64) -> Result<()> {
        let share = self
            .db
            .find_share(id)
            .await?
            .ok_or_else(|| AppError::not_found("share does not exist"))?;

        let mut services: BTreeSet<String> = self
            .db
            .list_runtimes(share.id)
            .await?
            .into_iter()
            .filter(|r| r.applied == 1)
            .map(|r| r.service_name)
            .collect();
        let mut chains = Vec::new();
        for relay in self.db.list_relays(share.id).await? {
            if relay.kind == RELAY_CHAIN {
                chains.push(relay.name);
            } else {
                services.insert(relay.name);
            }
        }
        if !services.is_empty() {
            let _ = self
                .dispatcher
                .dispatch(
                    share.node_id,
                    &NodeCommand::DeleteService(ServiceTarget::Named(services.into_iter().collect())),
                    SyncMode::BestEffort,
                )
                .await;
        }
        for chain in chains {
            let _ = self
                .dispatcher
                .dispatch(share.node_id, &NodeCommand::DeleteChains(chain), SyncMode::BestEffort)
                .await;
        }

        let runtimes = self.db.delete_share_cascade(share.id).await?;
        info!(share_id = share.id, runtimes, "Peer share deleted");
        Ok(())
    }

    pub async fn reset_share_flow(&self, id: i64) -> Result<()> {
        if self.db.find_share(id).await?.is_none() {
            return Err(AppError::not_found("share does not exist"));
        }
        self.db.reset_share_flow(id).await?;
        Ok(())
    }

    pub async fn list_shares(&self) -> Result<Vec<ShareListItem>> {
        let mut items = Vec::new();
        for share in self.db.list_shares().await? {
            let node_name = self
                .db
                .find_node(share.node_id)
                .await?
                .map(|n| n.name)
                .unwrap_or_default();
            let usage = self.share_usage(&share).await?;
            items.push(ShareListItem {
                share,
                node_name,
                active_runtime_num: usage.active_runtime_num,
                used_ports: usage.used_ports,
                used_port_details: usage.used_port_details,
            });
        }
        Ok(items)
    }

    /// Usage computed from applied runtimes only.
    pub async fn share_usage(&self, share: &PeerShare) -> Result<ShareUsage> {
        let runtimes = self.db.list_applied_runtimes(share.id).await?;
        let mut used_ports: Vec<i64> = runtimes.iter().map(|r| r.port).collect();
        used_ports.sort_unstable();
        used_ports.dedup();

        Ok(ShareUsage {
            share_id: share.id,
            name: share.name.clone(),
            node_id: share.node_id,
            max_bandwidth: share.max_bandwidth,
            current_flow: share.current_flow,
            port_range_start: share.port_range_start,
            port_range_end: share.port_range_end,
            expiry_time: share.expiry_time,
            is_active: share.is_active,
            active_runtime_num: runtimes.len() as i64,
            used_ports,
            used_port_details: runtimes
                .into_iter()
                .map(|r| UsedPortDetail {
                    port: r.port,
                    role: r.role,
                    resource_key: r.resource_key,
                    binding_id: r.binding_id,
                    service_name: r.service_name,
                })
                .collect(),
        })
    }

    // ------------------------------------------------------------------
    // Provider API, called by the partner with the share token
    // ------------------------------------------------------------------

    pub async fn connect(&self, share: &PeerShare) -> Result<ShareUsage> {
        self.ensure_usable(share)?;
        info!(share_id = share.id, "Federation partner connected");
        self.share_usage(share).await
    }

    /// Reserves a port in the share range. A repeated request for the same
    /// binding gets the existing reservation back.
    pub async fn reserve_runtime(
        &self,
        share: &PeerShare,
        req: ReserveRuntimeRequest,
    ) -> Result<ReservationResponse> {
        self.ensure_usable(share)?;
        let node = self.db.get_node(share.node_id).await?;

        let _port_guard = self.db.lock_ports().await;
        let existing = self.db.list_runtimes(share.id).await?;
        if !req.binding_id.is_empty() {
            if let Some(runtime) = existing.iter().find(|r| {
                r.resource_key == req.resource_key
                    && r.binding_id == req.binding_id
                    && r.role == req.role
            }) {
                return Ok(ReservationResponse {
                    reservation_id: runtime.reservation_id.clone(),
                    port: runtime.port,
                    server_ip: node.server_ip,
                });
            }
        }

        let range = share_range(share.port_range_start, share.port_range_end)?;
        let taken: HashSet<i64> = self
            .db
            .taken_ports_on_node(node.id, None, None)
            .await?
            .into_iter()
            .collect();
        let port = match req.port {
            Some(port) => {
                if lowest_free_port(&[range], &taken, Some(port)) != Some(port) {
                    return Err(AppError::Allocation(format!(
                        "port {} is unavailable in this share",
                        port
                    )));
                }
                port
            }
            None => lowest_free_port(&[range], &taken, None)
                .ok_or_else(|| AppError::Allocation("no free port left in this share".to_string()))?,
        };

        let reservation_id = generate_reservation_id();
        let service_name = if req.service_name.trim().is_empty() {
            format!("share_{}_{}", share.id, port)
        } else {
            req.service_name.trim().to_string()
        };
        let runtime = self
            .db
            .insert_runtime(&PeerShareRuntime {
                id: 0,
                share_id: share.id,
                node_id: node.id,
                reservation_id: reservation_id.clone(),
                resource_key: req.resource_key,
                binding_id: req.binding_id,
                role: req.role,
                chain_name: req.chain_name,
                service_name,
                protocol: req
                    .protocol
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| DEFAULT_HOP_PROTOCOL.to_string()),
                strategy: req
                    .strategy
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| DEFAULT_HOP_STRATEGY.to_string()),
                port,
                target: req.target,
                applied: 0,
                status: STATUS_ACTIVE,
                created_time: 0,
                updated_time: 0,
            })
            .await?;

        info!(share_id = share.id, port, reservation = %reservation_id, "Share port reserved");
        Ok(ReservationResponse {
            reservation_id: runtime.reservation_id,
            port: runtime.port,
            server_ip: node.server_ip,
        })
    }

    pub async fn apply_runtime(&self, share: &PeerShare, req: RuntimeRefRequest) -> Result<()> {
        self.ensure_usable(share)?;
        let runtime = self
            .db
            .find_runtime(share.id, &req.reservation_id)
            .await?
            .ok_or_else(|| AppError::not_found("reservation does not exist"))?;
        if runtime.applied == 1 {
            return Ok(());
        }

        let node = self.db.get_node(runtime.node_id).await?;
        let spec = runtime_service(&runtime, &node);
        self.dispatcher
            .dispatch(
                node.id,
                &NodeCommand::CreateService(vec![spec]),
                SyncMode::Required,
            )
            .await?;
        self.db.mark_runtime_applied(runtime.id).await?;

        info!(share_id = share.id, port = runtime.port, "Share runtime applied");
        Ok(())
    }

    pub async fn release_runtime(&self, share: &PeerShare, req: RuntimeRefRequest) -> Result<()> {
        let runtime = self
            .db
            .find_runtime(share.id, &req.reservation_id)
            .await?
            .ok_or_else(|| AppError::not_found("reservation does not exist"))?;

        if runtime.applied == 1 {
            let _ = self
                .dispatcher
                .dispatch(
                    runtime.node_id,
                    &NodeCommand::DeleteService(ServiceTarget::Named(vec![runtime
                        .service_name
                        .clone()])),
                    SyncMode::BestEffort,
                )
                .await;
        }
        self.db.delete_runtime(runtime.id).await?;

        info!(share_id = share.id, port = runtime.port, "Share runtime released");
        Ok(())
    }

    /// Relays a partner's node command to the shared node.
    ///
    /// Services must listen inside the share range on a port nothing else
    /// holds. Objects the partner creates are recorded against the share, and
    /// only recorded objects may later be updated, paused, resumed or deleted.
    /// Limiters belong to the provider and are never relayed.
    pub async fn relay_command(&self, share: &PeerShare, envelope: CommandEnvelope) -> Result<()> {
        self.ensure_usable(share)?;
        let kind: CommandKind = envelope.kind.parse().map_err(AppError::Validation)?;

        match kind {
            CommandKind::CreateService | CommandKind::UpdateService => {
                let specs: Vec<ServiceSpec> = serde_json::from_value(envelope.data.clone())?;
                let entries = self.check_relayed_services(share, kind, &specs).await?;
                self.relay_and_record(share, &envelope, RELAY_SERVICE, &entries)
                    .await
            }
            CommandKind::DeleteService | CommandKind::PauseService | CommandKind::ResumeService => {
                let names = relayed_names(&envelope.data, "services")?;
                for name in &names {
                    self.require_owned_service(share, name).await?;
                }
                self.dispatcher
                    .dispatch_envelope(share.node_id, &envelope, SyncMode::Required)
                    .await?;
                if kind == CommandKind::DeleteService {
                    let mut forgotten = Vec::with_capacity(names.len() * 3);
                    for name in &names {
                        forgotten.push(name.clone());
                        forgotten.push(format!("{}_tcp", name));
                        forgotten.push(format!("{}_udp", name));
                    }
                    self.db
                        .forget_relays(share.id, RELAY_SERVICE, &forgotten)
                        .await?;
                }
                Ok(())
            }
            CommandKind::AddChains => {
                let chain: ChainSpec = serde_json::from_value(envelope.data.clone())?;
                self.check_chain_name_free(share, &chain.name).await?;
                self.relay_and_record(share, &envelope, RELAY_CHAIN, &[(chain.name, 0)])
                    .await
            }
            CommandKind::DeleteChains => {
                let name = envelope
                    .data
                    .get("chain")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AppError::validation("chain name is required"))?
                    .to_string();
                if self.db.shared_name_owner(share.node_id, RELAY_CHAIN, &name).await?
                    != Some(share.id)
                {
                    return Err(AppError::Forbidden(format!(
                        "chain {} does not belong to this share",
                        name
                    )));
                }
                self.dispatcher
                    .dispatch_envelope(share.node_id, &envelope, SyncMode::Required)
                    .await?;
                self.db.forget_relays(share.id, RELAY_CHAIN, &[name]).await?;
                Ok(())
            }
            CommandKind::DeleteLimiters => Err(AppError::Forbidden(
                "limiters cannot be managed through a share".to_string(),
            )),
        }
    }

    /// Validates relayed service definitions and returns `(name, port)` for each.
    async fn check_relayed_services(
        &self,
        share: &PeerShare,
        kind: CommandKind,
        specs: &[ServiceSpec],
    ) -> Result<Vec<(String, i64)>> {
        let mut entries = Vec::with_capacity(specs.len());
        for spec in specs {
            let port = listen_port(&spec.addr).ok_or_else(|| {
                AppError::validation(format!("invalid listen address: {}", spec.addr))
            })?;
            if port < share.port_range_start || port > share.port_range_end {
                return Err(AppError::Forbidden(format!(
                    "port {} is outside the shared range",
                    port
                )));
            }
            if kind == CommandKind::UpdateService {
                self.require_owned_service(share, &spec.name).await?;
            } else {
                self.check_service_name_free(share, &spec.name).await?;
            }
            entries.push((spec.name.clone(), port));
        }
        Ok(entries)
    }

    /// Stages the relay records, sends the command and drops the records that
    /// were new if the node refused it. Service ports are checked against the
    /// node while the port lock is held.
    async fn relay_and_record(
        &self,
        share: &PeerShare,
        envelope: &CommandEnvelope,
        kind: &str,
        entries: &[(String, i64)],
    ) -> Result<()> {
        let port_guard = self.db.lock_ports().await;
        if kind == RELAY_SERVICE {
            let taken: HashSet<i64> = self
                .db
                .taken_ports_on_node(share.node_id, None, None)
                .await?
                .into_iter()
                .collect();
            let own_ports: HashSet<i64> =
                self.db.share_ports(share.id).await?.into_iter().collect();
            if let Some((_, port)) = entries
                .iter()
                .find(|(_, port)| taken.contains(port) && !own_ports.contains(port))
            {
                return Err(AppError::Forbidden(format!(
                    "port {} is in use on the shared node",
                    port
                )));
            }
        }
        let added = self
            .db
            .record_relays(share.id, share.node_id, kind, entries)
            .await?;
        drop(port_guard);

        if let Err(e) = self
            .dispatcher
            .dispatch_envelope(share.node_id, envelope, SyncMode::Required)
            .await
        {
            self.db.forget_relays(share.id, kind, &added).await?;
            return Err(e.into());
        }
        info!(share_id = share.id, command = %envelope.kind, "Relayed partner command");
        Ok(())
    }

    /// A service name is relayable by this share when the share holds it, or
    /// when it is a base name whose protocol listeners the share holds.
    async fn require_owned_service(&self, share: &PeerShare, name: &str) -> Result<()> {
        for candidate in [
            name.to_string(),
            format!("{}_tcp", name),
            format!("{}_udp", name),
        ] {
            if self
                .db
                .shared_name_owner(share.node_id, RELAY_SERVICE, &candidate)
                .await?
                == Some(share.id)
            {
                return Ok(());
            }
        }
        Err(AppError::Forbidden(format!(
            "service {} does not belong to this share",
            name
        )))
    }

    /// New names must not collide with another share's objects or with the
    /// provider's own services on the node.
    async fn check_service_name_free(&self, share: &PeerShare, name: &str) -> Result<()> {
        match self
            .db
            .shared_name_owner(share.node_id, RELAY_SERVICE, name)
            .await?
        {
            Some(owner) if owner == share.id => return Ok(()),
            Some(_) => return Err(name_in_use("service", name)),
            None => {}
        }
        let provider_owned = match classify_service(name) {
            ServiceOwner::Tunnel(id) => self.db.tunnel_uses_node(id, share.node_id).await?,
            ServiceOwner::Forward { forward_id, .. } => {
                self.db.forward_listens_on(forward_id, share.node_id).await?
            }
            ServiceOwner::Unknown => false,
        };
        if provider_owned {
            return Err(name_in_use("service", name));
        }
        Ok(())
    }

    async fn check_chain_name_free(&self, share: &PeerShare, name: &str) -> Result<()> {
        match self
            .db
            .shared_name_owner(share.node_id, RELAY_CHAIN, name)
            .await?
        {
            Some(owner) if owner == share.id => return Ok(()),
            Some(_) => return Err(name_in_use("chain", name)),
            None => {}
        }
        if let Some(tunnel_id) = chain_tunnel_id(name) {
            if self.db.tunnel_uses_node(tunnel_id, share.node_id).await? {
                return Err(name_in_use("chain", name));
            }
        }
        Ok(())
    }

    fn ensure_usable(&self, share: &PeerShare) -> Result<()> {
        if share.is_active != STATUS_ACTIVE {
            return Err(AppError::Forbidden("share is disabled".to_string()));
        }
        if share.expiry_time > 0 && share.expiry_time <= now_millis() {
            return Err(AppError::Forbidden("share has expired".to_string()));
        }
        if share.max_bandwidth > 0 && share.current_flow >= quota_bytes(share.max_bandwidth) {
            return Err(AppError::Forbidden("share traffic quota exhausted".to_string()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Consumer side
    // ------------------------------------------------------------------

    /// Usage of every remote node. A peer that cannot be reached contributes
    /// its cached snapshot plus a `syncError`; this never fails as a whole.
    pub async fn list_remote_usage(&self) -> Result<Vec<RemoteUsageItem>> {
        let mut items = Vec::new();
        for node in self.db.list_remote_nodes().await? {
            items.push(self.remote_usage(&node).await?);
        }
        Ok(items)
    }

    async fn remote_usage(&self, node: &Node) -> Result<RemoteUsageItem> {
        let (usage, last_synced, sync_error) = match self.fetch_usage(node).await {
            Ok(usage) => {
                let now = now_millis();
                match serde_json::to_string(&usage) {
                    Ok(cache) => self.db.update_remote_config(node.id, &cache).await?,
                    Err(e) => warn!(node_id = node.id, "Failed to cache remote usage: {}", e),
                }
                (usage, now, String::new())
            }
            Err(reason) => {
                warn!(node_id = node.id, "Remote usage refresh failed, serving cache: {}", reason);
                let cached = serde_json::from_str::<ShareUsage>(&node.remote_config)
                    .unwrap_or_default();
                (cached, node.updated_time, reason)
            }
        };

        let mut bindings = Vec::new();
        for hop in self.db.list_hops_on_node(node.id).await? {
            let tunnel_name = self
                .db
                .find_tunnel(hop.tunnel_id)
                .await?
                .map(|t| t.name)
                .unwrap_or_default();
            bindings.push(RemoteBinding {
                tunnel_id: hop.tunnel_id,
                tunnel_name,
                chain_type: hop.chain_type,
                port: hop.port,
            });
        }

        Ok(RemoteUsageItem {
            node_id: node.id,
            node_name: node.name.clone(),
            remote_url: node.remote_url.clone(),
            share_id: usage.share_id,
            share_name: usage.name,
            max_bandwidth: usage.max_bandwidth,
            current_flow: usage.current_flow,
            port_range_start: usage.port_range_start,
            port_range_end: usage.port_range_end,
            active_runtime_num: usage.active_runtime_num,
            used_ports: usage.used_ports,
            bindings,
            last_synced,
            sync_error,
        })
    }

    async fn fetch_usage(&self, node: &Node) -> std::result::Result<ShareUsage, String> {
        if node.remote_url.is_empty() {
            return Err("node has no remote URL".to_string());
        }
        let url = format!(
            "{}/api/v1/federation/usage",
            node.remote_url.trim_end_matches('/')
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&node.remote_token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| format!("peer unreachable: {}", e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("peer answered HTTP {}", status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| format!("invalid peer response: {}", e))?;
        let code = body.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            let msg = body
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(format!("peer refused usage request: {}", msg));
        }
        serde_json::from_value(body.get("data").cloned().unwrap_or(Value::Null))
            .map_err(|e| format!("invalid usage payload: {}", e))
    }
}

fn share_range(start: i64, end: i64) -> Result<PortRange> {
    let start = u16::try_from(start).map_err(|_| AppError::validation("invalid port range"))?;
    let end = u16::try_from(end).map_err(|_| AppError::validation("invalid port range"))?;
    PortRange::new(start, end).map_err(AppError::Validation)
}

fn name_in_use(what: &str, name: &str) -> AppError {
    AppError::Forbidden(format!("{} {} is already in use on the shared node", what, name))
}

/// String list under `key` in a relayed payload.
fn relayed_names(data: &Value, key: &str) -> Result<Vec<String>> {
    let names: Vec<String> = data
        .get(key)
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    if names.is_empty() {
        return Err(AppError::validation(format!("{} must not be empty", key)));
    }
    Ok(names)
}

fn listen_port(addr: &str) -> Option<i64> {
    addr.rsplit_once(':')
        .and_then(|(_, port)| port.parse::<u16>().ok())
        .map(i64::from)
}

/// Service applied for a reserved runtime: a relay listener, forwarding to
/// `target` when the partner gave one.
fn runtime_service(runtime: &PeerShareRuntime, node: &Node) -> ServiceSpec {
    let forwarder = (!runtime.target.is_empty()).then(|| ForwarderSpec {
        nodes: runtime
            .target
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .enumerate()
            .map(|(i, addr)| TargetSpec {
                name: format!("node_{}", i + 1),
                addr: addr.to_string(),
            })
            .collect(),
        selector: SelectorSpec::new(&runtime.strategy),
    });
    let chain = (!runtime.chain_name.is_empty()).then(|| runtime.chain_name.clone());

    ServiceSpec {
        name: runtime.service_name.clone(),
        addr: format!("{}:{}", node.tcp_listen_addr, runtime.port),
        handler: TypeSpec {
            kind: "relay".to_string(),
            chain,
        },
        listener: TypeSpec {
            kind: runtime.protocol.clone(),
            chain: None,
        },
        forwarder,
        limiter: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewNode;
    use crate::services::dispatcher::RecordingTransport;

    struct Fixture {
        db: Database,
        transport: Arc<RecordingTransport>,
        federation: FederationService,
        node_id: i64,
    }

    async fn fixture() -> Fixture {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = Arc::new(Dispatcher::new(db.clone(), transport.clone()));
        let federation =
            FederationService::new(db.clone(), dispatcher, Duration::from_secs(2)).unwrap();
        let node_id = db
            .create_node(&NewNode {
                name: "shared".to_string(),
                secret: "shared-secret".to_string(),
                server_ip: "198.51.100.7".to_string(),
                api_port: 8088,
                port_range: "20000-20100".to_string(),
                tcp_listen_addr: "[::]".to_string(),
                udp_listen_addr: "[::]".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .id;
        Fixture {
            db,
            transport,
            federation,
            node_id,
        }
    }

    fn share_request(node_id: i64, allowed_ips: &str) -> CreatePeerShareRequest {
        CreatePeerShareRequest {
            name: "lease".to_string(),
            node_id,
            max_bandwidth: 0,
            port_range_start: 20050,
            port_range_end: 20052,
            allowed_ips: allowed_ips.to_string(),
            expiry_time: 0,
        }
    }

    fn reserve(binding: &str) -> ReserveRuntimeRequest {
        ReserveRuntimeRequest {
            resource_key: "tunnel:9".to_string(),
            binding_id: binding.to_string(),
            role: "exit".to_string(),
            chain_name: String::new(),
            service_name: String::new(),
            protocol: None,
            strategy: None,
            port: None,
            target: String::new(),
        }
    }

    #[tokio::test]
    async fn test_create_share_rejects_remote_nodes_and_bad_allow_lists() {
        let f = fixture().await;
        let remote = f
            .db
            .create_node(&NewNode {
                name: "leased".to_string(),
                secret: "x".to_string(),
                server_ip: "203.0.113.1".to_string(),
                api_port: 8088,
                port_range: "1000-2000".to_string(),
                is_remote: true,
                remote_url: "http://127.0.0.1:1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = f
            .federation
            .create_share(share_request(remote.id, ""))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Only local nodes can be shared");

        let err = f
            .federation
            .create_share(share_request(f.node_id, "10.0.0.1, not-an-ip"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid allowed IP or CIDR"));
        assert!(f.db.list_shares().await.unwrap().is_empty());

        let share = f
            .federation
            .create_share(share_request(f.node_id, "203.0.113.0/24"))
            .await
            .unwrap();
        assert_eq!(share.token.len(), 48);
        assert_eq!(share.allowed_ips, "203.0.113.0/24");
    }

    #[tokio::test]
    async fn test_reserve_apply_and_usage() {
        let f = fixture().await;
        let share = f
            .federation
            .create_share(share_request(f.node_id, ""))
            .await
            .unwrap();

        let first = f.federation.reserve_runtime(&share, reserve("a")).await.unwrap();
        let again = f.federation.reserve_runtime(&share, reserve("a")).await.unwrap();
        let second = f.federation.reserve_runtime(&share, reserve("b")).await.unwrap();
        assert_eq!(first.port, 20050);
        assert_eq!(again.reservation_id, first.reservation_id);
        assert_eq!(second.port, 20051);
        assert_eq!(first.server_ip, "198.51.100.7");

        // Reserved but not applied ports do not count as used.
        assert_eq!(f.federation.share_usage(&share).await.unwrap().active_runtime_num, 0);

        f.federation
            .apply_runtime(
                &share,
                RuntimeRefRequest {
                    reservation_id: second.reservation_id.clone(),
                },
            )
            .await
            .unwrap();
        let usage = f.federation.share_usage(&share).await.unwrap();
        assert_eq!(usage.active_runtime_num, 1);
        assert_eq!(usage.used_ports, vec![20051]);
        assert_eq!(f.transport.sent_to(f.node_id).await[0].kind, "CreateService");
    }

    #[tokio::test]
    async fn test_delete_share_cascades_runtimes() {
        let f = fixture().await;
        let share = f
            .federation
            .create_share(share_request(f.node_id, ""))
            .await
            .unwrap();
        f.federation.reserve_runtime(&share, reserve("a")).await.unwrap();
        f.federation.reserve_runtime(&share, reserve("b")).await.unwrap();

        f.federation.delete_share(share.id).await.unwrap();
        assert!(f.db.find_share(share.id).await.unwrap().is_none());
        assert!(f.db.list_runtimes(share.id).await.unwrap().is_empty());
    }

    fn relayed_service(name: &str, port: i64) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            addr: format!("[::]:{}", port),
            handler: TypeSpec {
                kind: "tcp".to_string(),
                chain: None,
            },
            listener: TypeSpec {
                kind: "tcp".to_string(),
                chain: None,
            },
            forwarder: None,
            limiter: None,
        }
    }

    #[tokio::test]
    async fn test_relay_only_touches_objects_of_the_share() {
        let f = fixture().await;
        let share = f
            .federation
            .create_share(share_request(f.node_id, ""))
            .await
            .unwrap();

        let create = NodeCommand::CreateService(vec![relayed_service("77_5_3_tcp", 20051)]);
        f.federation
            .relay_command(&share, create.envelope())
            .await
            .unwrap();
        assert_eq!(
            f.db.shared_name_owner(f.node_id, RELAY_SERVICE, "77_5_3_tcp")
                .await
                .unwrap(),
            Some(share.id)
        );
        f.transport.clear().await;

        // Names the share never created stay out of reach.
        for command in [
            NodeCommand::DeleteService(ServiceTarget::Named(vec![
                "1_1_0_tcp".to_string(),
                "1_tls".to_string(),
            ])),
            NodeCommand::PauseService(ServiceTarget::Named(vec!["1_1_0_tcp".to_string()])),
            NodeCommand::DeleteChains("chains_1".to_string()),
            NodeCommand::DeleteLimiters("1".to_string()),
        ] {
            let err = f
                .federation
                .relay_command(&share, command.envelope())
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Forbidden(_)), "{:?}", command);
        }
        assert!(f.transport.sent().await.is_empty());

        // The base name expands to the listeners the share created.
        let delete = NodeCommand::DeleteService(ServiceTarget::Named(vec![
            "77_5_3".to_string(),
            "77_5_3_tcp".to_string(),
        ]));
        f.federation
            .relay_command(&share, delete.envelope())
            .await
            .unwrap();
        assert_eq!(f.transport.sent().await.len(), 1);
        assert!(f.db.list_relays(share.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_relay_rejects_names_held_by_another_share() {
        let f = fixture().await;
        let first = f
            .federation
            .create_share(share_request(f.node_id, ""))
            .await
            .unwrap();
        let second = f
            .federation
            .create_share(CreatePeerShareRequest {
                port_range_start: 20060,
                port_range_end: 20062,
                ..share_request(f.node_id, "")
            })
            .await
            .unwrap();

        let create = NodeCommand::CreateService(vec![relayed_service("9_9_9_tcp", 20050)]);
        f.federation
            .relay_command(&first, create.envelope())
            .await
            .unwrap();

        let clash = NodeCommand::CreateService(vec![relayed_service("9_9_9_tcp", 20060)]);
        let err = f
            .federation
            .relay_command(&second, clash.envelope())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let update = NodeCommand::UpdateService(vec![relayed_service("9_9_9_tcp", 20061)]);
        let err = f
            .federation
            .relay_command(&second, update.envelope())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_failed_relay_leaves_no_record() {
        let f = fixture().await;
        let share = f
            .federation
            .create_share(share_request(f.node_id, ""))
            .await
            .unwrap();
        f.transport.fail_node(f.node_id).await;

        let create = NodeCommand::CreateService(vec![relayed_service("5_5_5_tcp", 20050)]);
        assert!(f
            .federation
            .relay_command(&share, create.envelope())
            .await
            .is_err());
        assert!(f.db.list_relays(share.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_share_withdraws_relayed_objects() {
        let f = fixture().await;
        let share = f
            .federation
            .create_share(share_request(f.node_id, ""))
            .await
            .unwrap();
        let create = NodeCommand::CreateService(vec![relayed_service("3_3_3_tcp", 20052)]);
        f.federation
            .relay_command(&share, create.envelope())
            .await
            .unwrap();
        f.transport.clear().await;

        f.federation.delete_share(share.id).await.unwrap();
        let sent = f.transport.sent_to(f.node_id).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, "DeleteService");
        assert_eq!(sent[0].data, serde_json::json!({ "services": ["3_3_3_tcp"] }));
        assert!(f.db.list_relays(share.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_byte_scale_bandwidth_does_not_overflow() {
        let f = fixture().await;
        let share = f
            .federation
            .create_share(CreatePeerShareRequest {
                max_bandwidth: 10_737_418_240,
                ..share_request(f.node_id, "")
            })
            .await
            .unwrap();
        assert!(f.federation.connect(&share).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_reservations_get_distinct_ports() {
        let f = fixture().await;
        let share = f
            .federation
            .create_share(share_request(f.node_id, ""))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            f.federation.reserve_runtime(&share, reserve("a")),
            f.federation.reserve_runtime(&share, reserve("b")),
        );
        assert_ne!(a.unwrap().port, b.unwrap().port);
    }

    #[tokio::test]
    async fn test_relay_refuses_ports_outside_the_share() {
        let f = fixture().await;
        let share = f
            .federation
            .create_share(share_request(f.node_id, ""))
            .await
            .unwrap();
        let spec = ServiceSpec {
            name: "x_tls".to_string(),
            addr: "[::]:20099".to_string(),
            handler: TypeSpec {
                kind: "relay".to_string(),
                chain: None,
            },
            listener: TypeSpec {
                kind: "tls".to_string(),
                chain: None,
            },
            forwarder: None,
            limiter: None,
        };
        let envelope = NodeCommand::CreateService(vec![spec]).envelope();

        let err = f
            .federation
            .relay_command(&share, envelope)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert!(f.transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_remote_usage_falls_back_to_cache() {
        let f = fixture().await;
        let remote = f
            .db
            .create_node(&NewNode {
                name: "leased".to_string(),
                secret: "x".to_string(),
                server_ip: "203.0.113.1".to_string(),
                api_port: 8088,
                port_range: "1000-2000".to_string(),
                is_remote: true,
                remote_url: "http://127.0.0.1:1".to_string(),
                remote_token: "peer-token".to_string(),
                remote_config: r#"{"shareId":42,"maxBandwidth":100,"currentFlow":999999,"portRangeStart":1000,"portRangeEnd":2000}"#.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let items = f.federation.list_remote_usage().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].node_id, remote.id);
        assert_eq!(items[0].share_id, 42);
        assert_eq!(items[0].current_flow, 999999);
        assert!(!items[0].sync_error.is_empty());
    }
}
