// src/services/orchestrator.rs
//! Topology orchestration.
//!
//! Multi-step operations follow the same shape: stage rows in the store, sync the
//! affected agents, then either keep the staged rows or compensate by writing the
//! pre-stage snapshot back. Deletes run the other way round: agents are told
//! best-effort first and the rows go regardless, so an unreachable node never
//! strands database state.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::AuthUser;
use crate::db::{Database, NewForward, NewTunnel};
use crate::error::{AppError, Result};
use crate::models::*;
use crate::services::agent_config;
use crate::services::allocator::{self, HopRequest};
use crate::services::dispatcher::{
    DispatchError, Dispatcher, FanOut, NodeCommand, ServiceName, ServiceTarget, SyncMode,
};
use crate::utils::validation::{validate_name, validate_remote_addr};

type HopGroupKey = (i64, i64);

pub struct Orchestrator {
    db: Database,
    dispatcher: Arc<Dispatcher>,
}

impl Orchestrator {
    pub fn new(db: Database, dispatcher: Arc<Dispatcher>) -> Self {
        Self { db, dispatcher }
    }

    // ------------------------------------------------------------------
    // Tunnels
    // ------------------------------------------------------------------

    pub async fn create_tunnel(&self, req: TunnelRequest) -> Result<TunnelDetail> {
        let (new_tunnel, requests) = validate_tunnel_request(&req)?;
        let port_guard = self.db.lock_ports().await;
        let planned = allocator::plan_hops(&self.db, None, &[], &requests).await?;
        let (tunnel, hops) = self.db.insert_tunnel_with_hops(&new_tunnel, &planned).await?;
        drop(port_guard);

        if let Err(e) = self.push_tunnel(tunnel.id, &hops, &[], SyncMode::Required).await {
            warn!(tunnel_id = tunnel.id, "Tunnel sync failed, rolling back: {}", e);
            self.remove_tunnel_config(tunnel.id, &hops).await;
            self.db.delete_tunnel_rows(tunnel.id).await?;
            return Err(e.into());
        }

        info!(tunnel_id = tunnel.id, hops = hops.len(), "Tunnel created");
        Ok(TunnelDetail { tunnel, hops })
    }

    pub async fn update_tunnel(&self, req: TunnelRequest) -> Result<TunnelDetail> {
        let id = req
            .id
            .ok_or_else(|| AppError::validation("tunnel id is required"))?;
        let before = self
            .db
            .find_tunnel(id)
            .await?
            .ok_or_else(|| AppError::not_found("tunnel does not exist"))?;
        let (changes, requests) = validate_tunnel_request(&req)?;
        let old_hops = self.db.list_hops(id).await?;

        let forwards = self.db.count_forwards_on_tunnel(id).await?;
        if forwards > 0 {
            let old_entry = entry_nodes(&old_hops);
            let new_entry: Vec<i64> = requests
                .iter()
                .filter(|r| r.role == ChainRole::Entry)
                .map(|r| r.node_id)
                .collect();
            if old_entry != new_entry || before.tunnel_type != changes.tunnel_type {
                return Err(AppError::validation(
                    "tunnel has forwards; move them before changing its entry nodes or type",
                ));
            }
        }

        let port_guard = self.db.lock_ports().await;
        let planned = allocator::plan_hops(&self.db, Some(id), &old_hops, &requests).await?;

        let mut updated = before.clone();
        updated.name = changes.name;
        updated.tunnel_type = changes.tunnel_type;
        updated.traffic_ratio = changes.traffic_ratio;
        updated.flow_factor = changes.flow_factor;
        updated.flow_quota = changes.flow_quota;
        updated.protocol = changes.protocol;

        self.db.update_tunnel_fields(&updated).await?;
        let new_hops = self.db.replace_hops(id, &planned).await?;
        drop(port_guard);

        if let Err(e) = self
            .push_tunnel(id, &new_hops, &old_hops, SyncMode::Required)
            .await
        {
            warn!(tunnel_id = id, "Tunnel update sync failed, restoring: {}", e);
            self.db.update_tunnel_fields(&before).await?;
            self.db.restore_hops(id, &old_hops).await?;
            // Put back whatever the partial sync already replaced.
            if let Err(e) = self
                .push_tunnel(id, &old_hops, &new_hops, SyncMode::BestEffort)
                .await
            {
                warn!(tunnel_id = id, "Restoring agent config failed: {}", e);
            }
            return Err(e.into());
        }

        self.remove_dropped_hop_config(id, &old_hops, &new_hops).await;

        info!(tunnel_id = id, "Tunnel updated");
        Ok(TunnelDetail {
            tunnel: self.db.get_tunnel(id).await?,
            hops: new_hops,
        })
    }

    pub async fn delete_tunnel(&self, id: i64) -> Result<()> {
        if self.db.find_tunnel(id).await?.is_none() {
            return Err(AppError::not_found("tunnel does not exist"));
        }
        let forwards = self.db.count_forwards_on_tunnel(id).await?;
        if forwards > 0 {
            return Err(AppError::validation(format!(
                "tunnel still has {} forward(s)",
                forwards
            )));
        }

        let hops = self.db.list_hops(id).await?;
        self.remove_tunnel_config(id, &hops).await;
        self.db.delete_tunnel_rows(id).await?;

        info!(tunnel_id = id, "Tunnel deleted");
        Ok(())
    }

    pub async fn list_tunnels(&self, caller: &AuthUser) -> Result<Vec<TunnelDetail>> {
        let tunnels = if caller.is_admin() {
            self.db.list_tunnels().await?
        } else {
            self.db.list_tunnels_for_user(caller.id).await?
        };

        let mut details = Vec::with_capacity(tunnels.len());
        for tunnel in tunnels {
            let hops = self.db.list_hops(tunnel.id).await?;
            details.push(TunnelDetail { tunnel, hops });
        }
        Ok(details)
    }

    /// Pushes chains and relay services for every hop group that differs from
    /// `previous`. A group's chain is also refreshed when the group after it changed.
    async fn push_tunnel(
        &self,
        tunnel_id: i64,
        hops: &[ChainTunnel],
        previous: &[ChainTunnel],
        mode: SyncMode,
    ) -> std::result::Result<(), DispatchError> {
        let groups = hop_groups(hops);
        let old_groups = hop_groups(previous);
        let nodes = self.load_nodes(hops).await?;
        let keys: Vec<HopGroupKey> = groups.keys().copied().collect();
        let changed: Vec<bool> = keys
            .iter()
            .map(|k| old_groups.get(k).map(|g| !same_group(g, &groups[k])).unwrap_or(true))
            .collect();

        let previously_served: HashSet<i64> = previous
            .iter()
            .filter(|h| h.chain_type != ChainRole::Entry.as_i64())
            .map(|h| h.node_id)
            .collect();

        // Listeners first, walking back from the exit group.
        for (i, key) in keys.iter().enumerate().rev() {
            if i == 0 || !changed[i] {
                continue;
            }
            for hop in &groups[key] {
                let node = nodes
                    .get(&hop.node_id)
                    .ok_or(DispatchError::NodeNotFound(hop.node_id))?;
                let spec = agent_config::tunnel_service(tunnel_id, hop, node);
                let command = if previously_served.contains(&hop.node_id) {
                    NodeCommand::UpdateService(vec![spec])
                } else {
                    NodeCommand::CreateService(vec![spec])
                };
                self.dispatcher.dispatch(hop.node_id, &command, mode).await?;
            }
        }

        for (i, key) in keys.iter().enumerate() {
            let Some(next_key) = keys.get(i + 1) else {
                break;
            };
            if !changed[i] && !changed[i + 1] {
                continue;
            }
            let next: Vec<(&ChainTunnel, &Node)> = groups[next_key]
                .iter()
                .filter_map(|h| nodes.get(&h.node_id).map(|n| (h, n)))
                .collect();
            let chain = agent_config::tunnel_chain(tunnel_id, &next);
            for hop in &groups[key] {
                if !previous.is_empty() {
                    let _ = self
                        .dispatcher
                        .dispatch(
                            hop.node_id,
                            &NodeCommand::DeleteChains(agent_config::chain_name(tunnel_id)),
                            SyncMode::BestEffort,
                        )
                        .await;
                }
                self.dispatcher
                    .dispatch(hop.node_id, &NodeCommand::AddChains(chain.clone()), mode)
                    .await?;
            }
        }

        Ok(())
    }

    /// Best-effort removal of every chain and relay service of the tunnel.
    async fn remove_tunnel_config(&self, tunnel_id: i64, hops: &[ChainTunnel]) {
        let mut chain_nodes = BTreeSet::new();
        let mut service_nodes = BTreeSet::new();
        for hop in hops {
            match ChainRole::from_i64(hop.chain_type) {
                Some(ChainRole::Entry) => {
                    chain_nodes.insert(hop.node_id);
                }
                Some(ChainRole::Middle) => {
                    chain_nodes.insert(hop.node_id);
                    service_nodes.insert(hop.node_id);
                }
                Some(ChainRole::Exit) => {
                    service_nodes.insert(hop.node_id);
                }
                None => {}
            }
        }
        if hop_groups(hops).len() < 2 {
            return;
        }
        let chain_nodes: Vec<i64> = chain_nodes.into_iter().collect();
        let service_nodes: Vec<i64> = service_nodes.into_iter().collect();

        let _ = self
            .dispatcher
            .dispatch_all(
                &chain_nodes,
                &NodeCommand::DeleteChains(agent_config::chain_name(tunnel_id)),
                SyncMode::BestEffort,
                FanOut::AttemptAll,
            )
            .await;
        let _ = self
            .dispatcher
            .dispatch_all(
                &service_nodes,
                &NodeCommand::DeleteService(ServiceTarget::Named(vec![
                    agent_config::tunnel_service_name(tunnel_id),
                ])),
                SyncMode::BestEffort,
                FanOut::AttemptAll,
            )
            .await;
    }

    async fn remove_dropped_hop_config(
        &self,
        tunnel_id: i64,
        old_hops: &[ChainTunnel],
        new_hops: &[ChainTunnel],
    ) {
        let still_chained: HashSet<i64> = new_hops
            .iter()
            .filter(|h| h.chain_type != ChainRole::Exit.as_i64())
            .map(|h| h.node_id)
            .collect();
        let still_serving: HashSet<i64> = new_hops
            .iter()
            .filter(|h| h.chain_type != ChainRole::Entry.as_i64())
            .map(|h| h.node_id)
            .collect();
        let single_group = hop_groups(new_hops).len() < 2;

        for hop in old_hops {
            let role = hop.chain_type;
            if role != ChainRole::Exit.as_i64()
                && (single_group || !still_chained.contains(&hop.node_id))
            {
                let _ = self
                    .dispatcher
                    .dispatch(
                        hop.node_id,
                        &NodeCommand::DeleteChains(agent_config::chain_name(tunnel_id)),
                        SyncMode::BestEffort,
                    )
                    .await;
            }
            if role != ChainRole::Entry.as_i64() && !still_serving.contains(&hop.node_id) {
                let _ = self
                    .dispatcher
                    .dispatch(
                        hop.node_id,
                        &NodeCommand::DeleteService(ServiceTarget::Named(vec![
                            agent_config::tunnel_service_name(tunnel_id),
                        ])),
                        SyncMode::BestEffort,
                    )
                    .await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Forwards
    // ------------------------------------------------------------------

    pub async fn create_forward(
        &self,
        caller: &AuthUser,
        req: CreateForwardRequest,
    ) -> Result<ForwardView> {
        validate_name(&req.name).map_err(AppError::Validation)?;
        let targets = validate_remote_addr(&req.remote_addr).map_err(AppError::Validation)?;
        let tunnel = self.usable_tunnel(req.tunnel_id).await?;
        let user_tunnel_id = self.check_forward_quota(caller, &tunnel).await?;

        let entry_hops = self.entry_hops(tunnel.id).await?;
        let port_guard = self.db.lock_ports().await;
        let mut ports = Vec::with_capacity(entry_hops.len());
        for hop in &entry_hops {
            let node = self.db.get_node(hop.node_id).await?;
            let port = allocator::allocate_forward_port(&self.db, &node, None, req.in_port).await?;
            ports.push((node.id, port));
        }

        let new_forward = NewForward {
            user_id: caller.id,
            user_name: caller.username.clone(),
            name: req.name.trim().to_string(),
            tunnel_id: tunnel.id,
            remote_addr: targets.join(","),
            strategy: req
                .strategy
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FORWARD_STRATEGY.to_string()),
        };
        let (forward, forward_ports) =
            self.db.insert_forward_with_ports(&new_forward, &ports).await?;
        drop(port_guard);

        let name = ServiceName::new(forward.id, forward.user_id, user_tunnel_id);
        if let Err(e) = self
            .create_forward_services(&forward, &forward_ports, &tunnel, &name, &HashSet::new())
            .await
        {
            warn!(forward_id = forward.id, "Forward sync failed, rolling back: {}", e);
            self.db.delete_forward_rows(forward.id).await?;
            return Err(e.into());
        }

        info!(forward_id = forward.id, tunnel_id = tunnel.id, "Forward created");
        Ok(ForwardView {
            forward,
            tunnel_name: tunnel.name,
            ports: forward_ports,
        })
    }

    pub async fn update_forward(
        &self,
        caller: &AuthUser,
        req: UpdateForwardRequest,
    ) -> Result<ForwardView> {
        let snapshot = self.owned_forward(caller, req.id).await?;
        let old_ports = self.db.list_forward_ports(snapshot.id).await?;

        let mut updated = snapshot.clone();
        if let Some(name) = &req.name {
            validate_name(name).map_err(AppError::Validation)?;
            updated.name = name.trim().to_string();
        }
        if let Some(remote_addr) = &req.remote_addr {
            updated.remote_addr = validate_remote_addr(remote_addr)
                .map_err(AppError::Validation)?
                .join(",");
        }
        if let Some(strategy) = req.strategy.as_ref().filter(|s| !s.trim().is_empty()) {
            updated.strategy = strategy.trim().to_string();
        }

        match req.tunnel_id {
            Some(tunnel_id) if tunnel_id != snapshot.tunnel_id => {
                updated.tunnel_id = tunnel_id;
                self.switch_forward(caller, &snapshot, &old_ports, updated).await
            }
            _ => self.update_forward_in_place(&snapshot, &old_ports, updated).await,
        }
    }

    /// Moves every listed forward independently; failures are compensated one by one.
    pub async fn batch_retunnel(
        &self,
        caller: &AuthUser,
        req: BatchRetunnelRequest,
    ) -> Result<BatchResult> {
        let mut result = BatchResult::default();
        for id in req.ids {
            let update = UpdateForwardRequest {
                id,
                name: None,
                tunnel_id: Some(req.tunnel_id),
                remote_addr: None,
                strategy: None,
            };
            match self.update_forward(caller, update).await {
                Ok(_) => result.success_count += 1,
                Err(e) => {
                    warn!(forward_id = id, "Retunnel failed: {}", e);
                    result.fail_count += 1;
                    result.failures.push(BatchFailure {
                        id,
                        msg: e.to_string(),
                    });
                }
            }
        }
        info!(
            tunnel_id = req.tunnel_id,
            success = result.success_count,
            failed = result.fail_count,
            "Batch retunnel finished"
        );
        Ok(result)
    }

    pub async fn pause_forward(&self, caller: &AuthUser, id: i64) -> Result<()> {
        let forward = self.owned_forward(caller, id).await?;
        self.pause_forward_best_effort(&forward).await
    }

    /// Pause primitive shared with policy enforcement: agents are told
    /// best-effort and the row is flipped regardless.
    pub async fn pause_forward_best_effort(&self, forward: &Forward) -> Result<()> {
        let name = self.service_name_for(forward).await?;
        let nodes = self.forward_nodes(forward.id).await?;
        let _ = self
            .dispatcher
            .dispatch_all(
                &nodes,
                &NodeCommand::PauseService(ServiceTarget::Forward(name)),
                SyncMode::BestEffort,
                FanOut::AttemptAll,
            )
            .await;
        self.db.set_forward_status(forward.id, STATUS_INACTIVE).await?;
        info!(forward_id = forward.id, "Forward paused");
        Ok(())
    }

    pub async fn resume_forward(&self, caller: &AuthUser, id: i64) -> Result<()> {
        let forward = self.owned_forward(caller, id).await?;
        self.check_resume_allowed(&forward).await?;

        let name = self.service_name_for(&forward).await?;
        let nodes = self.forward_nodes(forward.id).await?;
        self.dispatcher
            .dispatch_all(
                &nodes,
                &NodeCommand::ResumeService(ServiceTarget::Forward(name)),
                SyncMode::Required,
                FanOut::FailFast,
            )
            .await?;
        self.db.set_forward_status(forward.id, STATUS_ACTIVE).await?;
        info!(forward_id = forward.id, "Forward resumed");
        Ok(())
    }

    pub async fn delete_forward(&self, caller: &AuthUser, id: i64) -> Result<()> {
        let forward = self.owned_forward(caller, id).await?;
        self.delete_forward_unchecked(&forward).await
    }

    pub(crate) async fn delete_forward_unchecked(&self, forward: &Forward) -> Result<()> {
        let name = self.service_name_for(forward).await?;
        let nodes = self.forward_nodes(forward.id).await?;
        let _ = self
            .dispatcher
            .dispatch_all(
                &nodes,
                &NodeCommand::DeleteService(ServiceTarget::Forward(name)),
                SyncMode::BestEffort,
                FanOut::AttemptAll,
            )
            .await;
        self.db.delete_forward_rows(forward.id).await?;
        info!(forward_id = forward.id, "Forward deleted");
        Ok(())
    }

    pub async fn list_forwards(&self, caller: &AuthUser) -> Result<Vec<ForwardView>> {
        let owner = (!caller.is_admin()).then_some(caller.id);
        let forwards = self.db.list_forwards(owner).await?;

        let mut tunnel_names: HashMap<i64, String> = HashMap::new();
        let mut views = Vec::with_capacity(forwards.len());
        for forward in forwards {
            if !tunnel_names.contains_key(&forward.tunnel_id) {
                let name = self
                    .db
                    .find_tunnel(forward.tunnel_id)
                    .await?
                    .map(|t| t.name)
                    .unwrap_or_default();
                tunnel_names.insert(forward.tunnel_id, name);
            }
            let ports = self.db.list_forward_ports(forward.id).await?;
            views.push(ForwardView {
                tunnel_name: tunnel_names[&forward.tunnel_id].clone(),
                forward,
                ports,
            });
        }
        Ok(views)
    }

    async fn update_forward_in_place(
        &self,
        snapshot: &Forward,
        ports: &[ForwardPort],
        updated: Forward,
    ) -> Result<ForwardView> {
        let tunnel = self.db.get_tunnel(snapshot.tunnel_id).await?;
        let name = self.service_name_for(snapshot).await?;
        let port_pairs: Vec<(i64, i64)> = ports.iter().map(|p| (p.node_id, p.port)).collect();

        let staged_ports = self
            .db
            .update_forward_with_ports(&updated, &port_pairs)
            .await?;

        for port in &staged_ports {
            let command = self
                .forward_command(&updated, port, &tunnel, &name, true)
                .await?;
            if let Err(e) = self
                .dispatcher
                .dispatch(port.node_id, &command, SyncMode::Required)
                .await
            {
                warn!(forward_id = snapshot.id, "Forward update sync failed, restoring: {}", e);
                self.db.restore_forward(snapshot, ports).await?;
                for old in ports {
                    let restore = self
                        .forward_command(snapshot, old, &tunnel, &name, true)
                        .await?;
                    let _ = self
                        .dispatcher
                        .dispatch(old.node_id, &restore, SyncMode::BestEffort)
                        .await;
                }
                return Err(e.into());
            }
        }

        if snapshot.status == STATUS_INACTIVE {
            self.pause_services(&name, &staged_ports).await;
        }

        info!(forward_id = snapshot.id, "Forward updated");
        Ok(ForwardView {
            forward: self.db.get_forward(snapshot.id).await?,
            tunnel_name: tunnel.name,
            ports: staged_ports,
        })
    }

    async fn switch_forward(
        &self,
        caller: &AuthUser,
        snapshot: &Forward,
        old_ports: &[ForwardPort],
        updated: Forward,
    ) -> Result<ForwardView> {
        let tunnel = self.usable_tunnel(updated.tunnel_id).await?;
        // Admins may move anyone's forward without the owner holding a grant.
        let owner = AuthUser {
            id: snapshot.user_id,
            username: snapshot.user_name.clone(),
            role_id: caller.role_id,
        };
        let new_user_tunnel_id = self.grant_for(&owner, &tunnel).await?;

        let old_name = self.service_name_for(snapshot).await?;
        let new_name = ServiceName::new(snapshot.id, snapshot.user_id, new_user_tunnel_id);
        let preferred = old_ports.first().map(|p| p.port);

        let entry_hops = self.entry_hops(tunnel.id).await?;
        let port_guard = self.db.lock_ports().await;
        let mut port_pairs = Vec::with_capacity(entry_hops.len());
        for hop in &entry_hops {
            let node = self.db.get_node(hop.node_id).await?;
            // Keep the old listen port when the new node can take it.
            let port = match allocator::allocate_forward_port(
                &self.db,
                &node,
                Some(snapshot.id),
                preferred,
            )
            .await
            {
                Ok(port) => port,
                Err(_) => {
                    allocator::allocate_forward_port(&self.db, &node, Some(snapshot.id), None)
                        .await?
                }
            };
            port_pairs.push((node.id, port));
        }

        let new_ports = self
            .db
            .update_forward_with_ports(&updated, &port_pairs)
            .await?;
        drop(port_guard);

        // Same name on a node that already serves it: update instead of create,
        // and keep it out of the old-node cleanup below.
        let old_nodes: HashSet<i64> = old_ports.iter().map(|p| p.node_id).collect();
        let shared: HashSet<i64> = if old_name == new_name {
            new_ports
                .iter()
                .map(|p| p.node_id)
                .filter(|n| old_nodes.contains(n))
                .collect()
        } else {
            HashSet::new()
        };

        if let Err(e) = self
            .create_forward_services(&updated, &new_ports, &tunnel, &new_name, &shared)
            .await
        {
            warn!(
                forward_id = snapshot.id,
                tunnel_id = tunnel.id,
                "Forward switch failed, restoring snapshot: {}",
                e
            );
            self.db.restore_forward(snapshot, old_ports).await?;
            // Nodes that took an update in place get the old definition back.
            if !shared.is_empty() {
                let old_tunnel = self.db.get_tunnel(snapshot.tunnel_id).await?;
                for old in old_ports.iter().filter(|p| shared.contains(&p.node_id)) {
                    let restore = self
                        .forward_command(snapshot, old, &old_tunnel, &old_name, true)
                        .await?;
                    let _ = self
                        .dispatcher
                        .dispatch(old.node_id, &restore, SyncMode::BestEffort)
                        .await;
                }
            }
            return Err(e.into());
        }

        let stale: Vec<i64> = old_nodes
            .iter()
            .copied()
            .filter(|n| !shared.contains(n))
            .collect();
        let _ = self
            .dispatcher
            .dispatch_all(
                &stale,
                &NodeCommand::DeleteService(ServiceTarget::Forward(old_name)),
                SyncMode::BestEffort,
                FanOut::AttemptAll,
            )
            .await;

        if snapshot.status == STATUS_INACTIVE {
            self.pause_services(&new_name, &new_ports).await;
        }

        info!(
            forward_id = snapshot.id,
            from = snapshot.tunnel_id,
            to = tunnel.id,
            "Forward moved to another tunnel"
        );
        Ok(ForwardView {
            forward: self.db.get_forward(snapshot.id).await?,
            tunnel_name: tunnel.name,
            ports: new_ports,
        })
    }

    /// Creates the forward's services on each entry node. On failure the nodes
    /// that already accepted are cleaned up best-effort before returning.
    async fn create_forward_services(
        &self,
        forward: &Forward,
        ports: &[ForwardPort],
        tunnel: &Tunnel,
        name: &ServiceName,
        update_on: &HashSet<i64>,
    ) -> std::result::Result<(), DispatchError> {
        let mut created = Vec::new();
        for port in ports {
            let update = update_on.contains(&port.node_id);
            let command = self
                .forward_command(forward, port, tunnel, name, update)
                .await
                .map_err(|_| DispatchError::NodeNotFound(port.node_id))?;

            if let Err(e) = self
                .dispatcher
                .dispatch(port.node_id, &command, SyncMode::Required)
                .await
            {
                let _ = self
                    .dispatcher
                    .dispatch_all(
                        &created,
                        &NodeCommand::DeleteService(ServiceTarget::Forward(*name)),
                        SyncMode::BestEffort,
                        FanOut::AttemptAll,
                    )
                    .await;
                return Err(e);
            }
            if !update {
                created.push(port.node_id);
            }
        }
        Ok(())
    }

    async fn forward_command(
        &self,
        forward: &Forward,
        port: &ForwardPort,
        tunnel: &Tunnel,
        name: &ServiceName,
        update: bool,
    ) -> Result<NodeCommand> {
        let node = self.db.get_node(port.node_id).await?;
        let targets: Vec<String> = forward
            .remote_addr
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let tunnel_type = TunnelType::from_i64(tunnel.tunnel_type).unwrap_or(TunnelType::Direct);
        let specs =
            agent_config::forward_services(name, forward, &targets, &node, port.port, tunnel_type);
        Ok(if update {
            NodeCommand::UpdateService(specs)
        } else {
            NodeCommand::CreateService(specs)
        })
    }

    async fn pause_services(&self, name: &ServiceName, ports: &[ForwardPort]) {
        let nodes: Vec<i64> = ports.iter().map(|p| p.node_id).collect();
        let _ = self
            .dispatcher
            .dispatch_all(
                &nodes,
                &NodeCommand::PauseService(ServiceTarget::Forward(*name)),
                SyncMode::BestEffort,
                FanOut::AttemptAll,
            )
            .await;
    }

    // ------------------------------------------------------------------
    // Lookups and checks
    // ------------------------------------------------------------------

    /// Non-owners get the same answer as for a missing row.
    async fn owned_forward(&self, caller: &AuthUser, id: i64) -> Result<Forward> {
        match self.db.find_forward(id).await? {
            Some(forward) if caller.is_admin() || forward.user_id == caller.id => Ok(forward),
            _ => Err(AppError::not_found("forward does not exist")),
        }
    }

    async fn usable_tunnel(&self, id: i64) -> Result<Tunnel> {
        let tunnel = self
            .db
            .find_tunnel(id)
            .await?
            .ok_or_else(|| AppError::not_found("tunnel does not exist"))?;
        if tunnel.status != STATUS_ACTIVE {
            return Err(AppError::validation("tunnel is disabled"));
        }
        Ok(tunnel)
    }

    async fn entry_hops(&self, tunnel_id: i64) -> Result<Vec<ChainTunnel>> {
        let hops: Vec<ChainTunnel> = self
            .db
            .list_hops(tunnel_id)
            .await?
            .into_iter()
            .filter(|h| h.chain_type == ChainRole::Entry.as_i64())
            .collect();
        if hops.is_empty() {
            return Err(AppError::validation("tunnel has no entry node"));
        }
        Ok(hops)
    }

    async fn forward_nodes(&self, forward_id: i64) -> Result<Vec<i64>> {
        let nodes: BTreeSet<i64> = self
            .db
            .list_forward_ports(forward_id)
            .await?
            .into_iter()
            .map(|p| p.node_id)
            .collect();
        Ok(nodes.into_iter().collect())
    }

    /// Service name the forward is currently deployed under.
    pub async fn service_name_for(&self, forward: &Forward) -> Result<ServiceName> {
        let user_tunnel_id = self
            .db
            .find_user_tunnel_by_pair(forward.user_id, forward.tunnel_id)
            .await?
            .map(|ut| ut.id)
            .unwrap_or(0);
        Ok(ServiceName::new(forward.id, forward.user_id, user_tunnel_id))
    }

    /// Grant id used in service names. Admins may ride a tunnel without one (0).
    async fn grant_for(&self, caller: &AuthUser, tunnel: &Tunnel) -> Result<i64> {
        let grant = self
            .db
            .find_user_tunnel_by_pair(caller.id, tunnel.id)
            .await?;
        match grant {
            Some(ut) if ut.status == STATUS_ACTIVE => Ok(ut.id),
            Some(ut) if caller.is_admin() => Ok(ut.id),
            None if caller.is_admin() => Ok(0),
            _ => Err(AppError::Forbidden("no permission for this tunnel".to_string())),
        }
    }

    async fn check_forward_quota(&self, caller: &AuthUser, tunnel: &Tunnel) -> Result<i64> {
        let user_tunnel_id = self.grant_for(caller, tunnel).await?;
        if caller.is_admin() {
            return Ok(user_tunnel_id);
        }

        let user = self
            .db
            .find_user(caller.id)
            .await?
            .ok_or_else(|| AppError::Unauthorized("unknown user".to_string()))?;
        if user.status != STATUS_ACTIVE {
            return Err(AppError::Forbidden("account is disabled".to_string()));
        }
        if user.num > 0 {
            let owned = self.db.list_forwards(Some(user.id)).await?.len() as i64;
            if owned >= user.num {
                return Err(AppError::validation("forward limit reached"));
            }
        }

        let grant = self.db.get_user_tunnel(user_tunnel_id).await?;
        if grant.num > 0 {
            let on_tunnel = self
                .db
                .list_user_forwards_on_tunnel(user.id, tunnel.id)
                .await?
                .len() as i64;
            if on_tunnel >= grant.num {
                return Err(AppError::validation("forward limit reached for this tunnel"));
            }
        }
        Ok(user_tunnel_id)
    }

    /// Resuming is refused while the owner or the grant is over quota or expired.
    async fn check_resume_allowed(&self, forward: &Forward) -> Result<()> {
        let now = crate::utils::now_millis();
        if let Some(user) = self.db.find_user(forward.user_id).await? {
            if user.role_id != ADMIN_ROLE_ID
                && (user.status != STATUS_ACTIVE
                    || (user.exp_time > 0 && user.exp_time <= now)
                    || quota_bytes(user.flow) < user.in_flow.saturating_add(user.out_flow))
            {
                return Err(AppError::Forbidden("account quota exhausted or expired".to_string()));
            }
        }
        if let Some(grant) = self
            .db
            .find_user_tunnel_by_pair(forward.user_id, forward.tunnel_id)
            .await?
        {
            if grant.status != STATUS_ACTIVE
                || (grant.exp_time > 0 && grant.exp_time <= now)
                || grant.in_flow.saturating_add(grant.out_flow) >= quota_bytes(grant.flow)
            {
                return Err(AppError::Forbidden("tunnel quota exhausted or expired".to_string()));
            }
        }
        Ok(())
    }

    async fn load_nodes(
        &self,
        hops: &[ChainTunnel],
    ) -> std::result::Result<HashMap<i64, Node>, DispatchError> {
        let mut nodes = HashMap::new();
        for hop in hops {
            if nodes.contains_key(&hop.node_id) {
                continue;
            }
            let node = self
                .db
                .find_node(hop.node_id)
                .await?
                .ok_or(DispatchError::NodeNotFound(hop.node_id))?;
            nodes.insert(hop.node_id, node);
        }
        Ok(nodes)
    }
}

fn validate_tunnel_request(req: &TunnelRequest) -> Result<(NewTunnel, Vec<HopRequest>)> {
    validate_name(&req.name).map_err(AppError::Validation)?;
    let tunnel_type = TunnelType::from_i64(req.tunnel_type)
        .ok_or_else(|| AppError::validation("invalid tunnel type"))?;

    let traffic_ratio = req.traffic_ratio.unwrap_or(1.0);
    let flow_factor = req.flow_factor.unwrap_or(1.0);
    if !(traffic_ratio.is_finite() && traffic_ratio > 0.0) {
        return Err(AppError::validation("traffic ratio must be positive"));
    }
    if !(flow_factor.is_finite() && flow_factor > 0.0) {
        return Err(AppError::validation("flow factor must be positive"));
    }
    if req.flow_quota < 0 {
        return Err(AppError::validation("flow quota must not be negative"));
    }
    if req.in_nodes.is_empty() {
        return Err(AppError::validation("at least one entry node is required"));
    }
    if tunnel_type == TunnelType::Chained && req.out_nodes.is_empty() {
        return Err(AppError::validation("a chained tunnel needs at least one exit node"));
    }

    let protocol = req
        .protocol
        .clone()
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOP_PROTOCOL.to_string());

    let mut groups: Vec<(ChainRole, i64, &Vec<HopNodeRequest>)> =
        vec![(ChainRole::Entry, 0, &req.in_nodes)];
    if tunnel_type == TunnelType::Chained {
        for (i, group) in req.chain_nodes.iter().enumerate() {
            if group.is_empty() {
                return Err(AppError::validation("middle hop groups must not be empty"));
            }
            groups.push((ChainRole::Middle, i as i64 + 1, group));
        }
        groups.push((ChainRole::Exit, 0, &req.out_nodes));
    }

    let mut requests = Vec::new();
    for (role, inx, nodes) in groups {
        let mut seen = HashSet::new();
        for slot in nodes {
            if !seen.insert(slot.node_id) {
                return Err(AppError::validation(format!(
                    "node {} appears twice in the same hop group",
                    slot.node_id
                )));
            }
            requests.push(HopRequest {
                role,
                inx,
                node_id: slot.node_id,
                protocol: slot
                    .protocol
                    .clone()
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or_else(|| protocol.clone()),
                strategy: slot
                    .strategy
                    .clone()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_HOP_STRATEGY.to_string()),
                port: slot.port,
            });
        }
    }

    let tunnel = NewTunnel {
        name: req.name.trim().to_string(),
        tunnel_type: tunnel_type.as_i64(),
        traffic_ratio,
        flow_factor,
        flow_quota: req.flow_quota,
        protocol,
    };
    Ok((tunnel, requests))
}

/// Hops keyed by (role, ordinal), in chain order.
fn hop_groups(hops: &[ChainTunnel]) -> BTreeMap<HopGroupKey, Vec<ChainTunnel>> {
    let mut groups: BTreeMap<HopGroupKey, Vec<ChainTunnel>> = BTreeMap::new();
    for hop in hops {
        groups
            .entry((hop.chain_type, hop.inx))
            .or_default()
            .push(hop.clone());
    }
    groups
}

fn same_group(a: &[ChainTunnel], b: &[ChainTunnel]) -> bool {
    let key = |h: &ChainTunnel| (h.node_id, h.port, h.protocol.clone(), h.strategy.clone());
    let mut left: Vec<_> = a.iter().map(key).collect();
    let mut right: Vec<_> = b.iter().map(key).collect();
    left.sort();
    right.sort();
    left == right
}

fn entry_nodes(hops: &[ChainTunnel]) -> Vec<i64> {
    hops.iter()
        .filter(|h| h.chain_type == ChainRole::Entry.as_i64())
        .map(|h| h.node_id)
        .collect()
}
