// src/services/reconcile.rs
//! Orphan cleanup for agent configuration.
//!
//! Every name a node reports is mapped back to the row it was created for. If
//! that row is gone, the item is deleted from the node best-effort. Objects a
//! federation partner holds on the node belong to its share and are left alone.
//! Nothing in here fails the caller: a lookup error skips the item.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::Result;
use crate::models::{NodeLiveConfig, RELAY_CHAIN, RELAY_SERVICE};
use crate::services::agent_config::{chain_tunnel_id, classify_service, ServiceOwner};
use crate::services::dispatcher::{Dispatcher, NodeCommand, ServiceTarget, SyncMode};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub services: usize,
    pub chains: usize,
    pub limiters: usize,
}

pub struct Reconciler {
    db: Database,
    dispatcher: Arc<Dispatcher>,
}

impl Reconciler {
    pub fn new(db: Database, dispatcher: Arc<Dispatcher>) -> Self {
        Self { db, dispatcher }
    }

    pub async fn reconcile(&self, node_id: i64, live: &NodeLiveConfig) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for item in &live.services {
            match self.orphaned_service(node_id, &item.name).await {
                Ok(Some(mut names)) => {
                    names.sort();
                    names.dedup();
                    self.delete(node_id, NodeCommand::DeleteService(ServiceTarget::Named(names)))
                        .await;
                    report.services += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(node_id, service = %item.name, "Skipping service check: {}", e),
            }
        }

        for item in &live.chains {
            match self.orphaned_chain(node_id, &item.name).await {
                Ok(true) => {
                    self.delete(node_id, NodeCommand::DeleteChains(item.name.clone()))
                        .await;
                    report.chains += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(node_id, chain = %item.name, "Skipping chain check: {}", e),
            }
        }

        for item in &live.limiters {
            let Ok(limit_id) = item.name.parse::<i64>() else {
                continue;
            };
            match self.db.speed_limit_exists(limit_id).await {
                Ok(true) => {}
                Ok(false) => {
                    self.delete(node_id, NodeCommand::DeleteLimiters(item.name.clone()))
                        .await;
                    report.limiters += 1;
                }
                Err(e) => warn!(node_id, limiter = %item.name, "Skipping limiter check: {}", e),
            }
        }

        if report != ReconcileReport::default() {
            info!(
                node_id,
                services = report.services,
                chains = report.chains,
                limiters = report.limiters,
                "Removed orphaned agent configuration"
            );
        }
        report
    }

    /// Names to delete when the service no longer has a backing row.
    async fn orphaned_service(&self, node_id: i64, name: &str) -> Result<Option<Vec<String>>> {
        if self
            .db
            .shared_name_owner(node_id, RELAY_SERVICE, name)
            .await?
            .is_some()
        {
            return Ok(None);
        }

        Ok(match classify_service(name) {
            ServiceOwner::Tunnel(id) => {
                if self.db.find_tunnel(id).await?.is_some() {
                    None
                } else {
                    Some(vec![name.to_string()])
                }
            }
            ServiceOwner::Forward { forward_id, base } => {
                if self.db.find_forward(forward_id).await?.is_some() {
                    None
                } else {
                    Some(vec![
                        name.to_string(),
                        format!("{}_tcp", base),
                        format!("{}_udp", base),
                        base,
                    ])
                }
            }
            ServiceOwner::Unknown => {
                debug!(node_id, service = %name, "Unrecognised service name");
                None
            }
        })
    }

    async fn orphaned_chain(&self, node_id: i64, name: &str) -> Result<bool> {
        let Some(tunnel_id) = chain_tunnel_id(name) else {
            return Ok(false);
        };
        if self
            .db
            .shared_name_owner(node_id, RELAY_CHAIN, name)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        Ok(self.db.find_tunnel(tunnel_id).await?.is_none())
    }

    async fn delete(&self, node_id: i64, command: NodeCommand) {
        let _ = self
            .dispatcher
            .dispatch(node_id, &command, SyncMode::BestEffort)
            .await;
    }
}
