// src/services/mod.rs
pub mod agent_config;
pub mod allocator;
pub mod dispatcher;
pub mod federation;
pub mod flow_policy;
pub mod orchestrator;
pub mod permissions;
pub mod reconcile;
pub mod scheduler;
