// src/lib.rs
//! Control plane for a fleet of forwarding agents: multi-hop tunnels, user
//! forwards with quotas, usage accounting and capacity sharing between
//! control planes.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod utils;

use std::sync::Arc;

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::services::dispatcher::{Dispatcher, NodeTransport};
use crate::services::federation::FederationService;
use crate::services::flow_policy::FlowPolicy;
use crate::services::orchestrator::Orchestrator;
use crate::services::permissions::PermissionService;
use crate::services::reconcile::Reconciler;
use crate::services::scheduler::{MaintenanceJobs, MaintenanceScheduler};

pub struct AppState {
    pub db: Database,
    pub config: Config,
    pub dispatcher: Arc<Dispatcher>,
    pub orchestrator: Arc<Orchestrator>,
    pub flow_policy: Arc<FlowPolicy>,
    pub federation: Arc<FederationService>,
    pub reconciler: Arc<Reconciler>,
    pub permissions: Arc<PermissionService>,
    pub scheduler: Arc<MaintenanceScheduler>,
}

impl AppState {
    /// Wires every service over one store and one node transport. The
    /// scheduler is created stopped.
    pub fn new(db: Database, config: Config, transport: Arc<dyn NodeTransport>) -> Result<Arc<Self>> {
        let dispatcher = Arc::new(Dispatcher::new(db.clone(), transport));
        let orchestrator = Arc::new(Orchestrator::new(db.clone(), dispatcher.clone()));
        let flow_policy = Arc::new(FlowPolicy::new(db.clone(), orchestrator.clone()));
        let federation = Arc::new(FederationService::new(
            db.clone(),
            dispatcher.clone(),
            config.federation_timeout,
        )?);
        let reconciler = Arc::new(Reconciler::new(db.clone(), dispatcher.clone()));
        let permissions = Arc::new(PermissionService::new(db.clone(), orchestrator.clone()));
        let jobs = Arc::new(MaintenanceJobs::new(db.clone(), flow_policy.clone()));
        let scheduler = Arc::new(MaintenanceScheduler::new(jobs));

        Ok(Arc::new(AppState {
            db,
            config,
            dispatcher,
            orchestrator,
            flow_policy,
            federation,
            reconciler,
            permissions,
            scheduler,
        }))
    }
}
