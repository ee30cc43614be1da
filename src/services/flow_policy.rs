// src/services/flow_policy.rs
//! Usage ingestion and quota enforcement.
//!
//! Agents report per-service byte counters. Each sample is attributed to its
//! forward, owner and user-tunnel grant, scaled by the tunnel multipliers and
//! added to the counters. The owner and the grant are then checked against
//! their quota, expiry and status; a breach pauses the affected forwards.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::Result;
use crate::models::{quota_bytes, FlowSample, Forward, RESERVED_SERVICE_NAME, STATUS_ACTIVE};
use crate::services::dispatcher::ServiceName;
use crate::services::orchestrator::Orchestrator;
use crate::utils::now_millis;

/// What happened to one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Recorded,
    Discarded,
}

pub struct FlowPolicy {
    db: Database,
    orchestrator: Arc<Orchestrator>,
}

impl FlowPolicy {
    pub fn new(db: Database, orchestrator: Arc<Orchestrator>) -> Self {
        Self { db, orchestrator }
    }

    /// Ingests a batch reported by one node; a failing sample is logged and
    /// does not stop the rest. Samples of leased share services are metered
    /// against their share instead.
    pub async fn ingest_all(&self, node_id: i64, samples: Vec<FlowSample>) -> usize {
        let mut recorded = 0;
        for sample in samples {
            let outcome = match self.ingest(&sample).await {
                Ok(IngestOutcome::Discarded) => self.meter_share(node_id, &sample).await,
                other => other,
            };
            match outcome {
                Ok(IngestOutcome::Recorded) => recorded += 1,
                Ok(IngestOutcome::Discarded) => {}
                Err(e) => warn!(service = %sample.n, "Flow sample failed: {}", e),
            }
        }
        recorded
    }

    async fn meter_share(&self, node_id: i64, sample: &FlowSample) -> Result<IngestOutcome> {
        let base = sample
            .n
            .strip_suffix("_tcp")
            .or_else(|| sample.n.strip_suffix("_udp"))
            .unwrap_or(&sample.n);
        match self.db.find_runtime_by_service(node_id, base).await? {
            Some(runtime) => {
                self.db
                    .add_share_flow(runtime.share_id, sample.u + sample.d)
                    .await?;
                Ok(IngestOutcome::Recorded)
            }
            None => Ok(IngestOutcome::Discarded),
        }
    }

    pub async fn ingest(&self, sample: &FlowSample) -> Result<IngestOutcome> {
        if sample.n == RESERVED_SERVICE_NAME {
            return Ok(IngestOutcome::Discarded);
        }
        let name: ServiceName = match sample.n.parse() {
            Ok(name) => name,
            Err(e) => {
                debug!(service = %sample.n, "Discarding flow sample: {}", e);
                return Ok(IngestOutcome::Discarded);
            }
        };

        // The last counters of a deleted forward are still billed, unscaled.
        let (in_delta, out_delta) = match self.db.find_forward(name.forward_id).await? {
            Some(forward) => {
                let (ratio, factor) = match self.db.find_tunnel(forward.tunnel_id).await? {
                    Some(tunnel) => (tunnel.traffic_ratio, tunnel.flow_factor),
                    None => (1.0, 1.0),
                };
                let in_delta = scale(sample.d, ratio, factor);
                let out_delta = scale(sample.u, ratio, factor);
                self.db.add_forward_flow(forward.id, in_delta, out_delta).await?;
                (in_delta, out_delta)
            }
            None => {
                debug!(forward_id = name.forward_id, "Flow sample for a removed forward");
                (sample.d, sample.u)
            }
        };

        self.db.add_user_flow(name.user_id, in_delta, out_delta).await?;
        if name.user_tunnel_id > 0 {
            self.db
                .add_user_tunnel_flow(name.user_tunnel_id, in_delta, out_delta)
                .await?;
            self.enforce(&name, now_millis()).await?;
        }

        Ok(IngestOutcome::Recorded)
    }

    async fn enforce(&self, name: &ServiceName, now: i64) -> Result<()> {
        if let Some(user) = self.db.find_user(name.user_id).await? {
            // Strictly greater than the quota.
            let over_quota = quota_bytes(user.flow) < user.in_flow.saturating_add(user.out_flow);
            let expired = user.exp_time > 0 && user.exp_time <= now;
            if over_quota || expired || user.status != STATUS_ACTIVE {
                let forwards = self.db.list_active_forwards_by_user(user.id).await?;
                if !forwards.is_empty() {
                    info!(
                        user_id = user.id,
                        over_quota, expired, "User limit reached, pausing all forwards"
                    );
                }
                self.pause_all(&forwards).await;
            }
        }

        if let Some(grant) = self.db.find_user_tunnel(name.user_tunnel_id).await? {
            // Reaching the quota is enough here.
            let over_quota = grant.in_flow.saturating_add(grant.out_flow) >= quota_bytes(grant.flow);
            let expired = grant.exp_time > 0 && grant.exp_time <= now;
            if over_quota || expired || grant.status != STATUS_ACTIVE {
                let forwards = self
                    .db
                    .list_active_forwards_by_user_tunnel(grant.user_id, grant.tunnel_id)
                    .await?;
                if !forwards.is_empty() {
                    info!(
                        user_tunnel_id = grant.id,
                        over_quota, expired, "Tunnel grant limit reached, pausing forwards"
                    );
                }
                self.pause_all(&forwards).await;
            }
        }

        Ok(())
    }

    pub(crate) async fn pause_all(&self, forwards: &[Forward]) {
        for forward in forwards {
            if let Err(e) = self.orchestrator.pause_forward_best_effort(forward).await {
                warn!(forward_id = forward.id, "Failed to pause forward: {}", e);
            }
        }
    }
}

/// Applies both tunnel multipliers, then truncates to whole bytes.
fn scale(bytes: i64, traffic_ratio: f64, flow_factor: f64) -> i64 {
    (bytes as f64 * traffic_ratio * flow_factor) as i64
}
