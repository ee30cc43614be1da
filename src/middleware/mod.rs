// src/middleware/mod.rs
pub mod peer_auth;
