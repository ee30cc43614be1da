// src/db/mod.rs
//! Topology store. Plain data access over SQLite; policy lives in `services`.

mod federation;
mod forwards;
mod groups;
mod nodes;
mod tunnels;
mod users;

pub use forwards::NewForward;
pub use nodes::NewNode;
pub use tunnels::{NewHop, NewTunnel};
pub use users::{ResetDay, UserTunnelGrant};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    port_lock: Arc<Mutex<()>>,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Ok(Self::with_pool(pool))
    }

    /// Single shared connection so every query sees the same in-memory database.
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self::with_pool(pool))
    }

    fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            port_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Guards listen-port selection. Hold it from reading the taken ports until
    /// the rows claiming the chosen ports are written; release before talking
    /// to agents.
    pub async fn lock_ports(&self) -> MutexGuard<'_, ()> {
        self.port_lock.lock().await
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
