// src/db/federation.rs
use super::Database;
use crate::models::{PeerShare, PeerShareRelay, PeerShareRuntime, RELAY_SERVICE};
use crate::utils::now_millis;

impl Database {
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_share(
        &self,
        name: &str,
        node_id: i64,
        token: &str,
        max_bandwidth: i64,
        port_range_start: i64,
        port_range_end: i64,
        allowed_ips: &str,
        expiry_time: i64,
    ) -> Result<PeerShare, sqlx::Error> {
        let now = now_millis();
        let result = sqlx::query(
            "INSERT INTO peer_share (name, node_id, token, max_bandwidth, current_flow,
                                     port_range_start, port_range_end, allowed_ips, expiry_time,
                                     is_active, created_time, updated_time)
             VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(name)
        .bind(node_id)
        .bind(token)
        .bind(max_bandwidth)
        .bind(port_range_start)
        .bind(port_range_end)
        .bind(allowed_ips)
        .bind(expiry_time)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_share(result.last_insert_rowid()).await
    }

    pub async fn get_share(&self, id: i64) -> Result<PeerShare, sqlx::Error> {
        sqlx::query_as::<_, PeerShare>("SELECT * FROM peer_share WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn find_share(&self, id: i64) -> Result<Option<PeerShare>, sqlx::Error> {
        sqlx::query_as::<_, PeerShare>("SELECT * FROM peer_share WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn find_share_by_token(&self, token: &str) -> Result<Option<PeerShare>, sqlx::Error> {
        sqlx::query_as::<_, PeerShare>("SELECT * FROM peer_share WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_shares(&self) -> Result<Vec<PeerShare>, sqlx::Error> {
        sqlx::query_as::<_, PeerShare>("SELECT * FROM peer_share ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn update_share(&self, share: &PeerShare) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE peer_share SET name = ?, max_bandwidth = ?, port_range_start = ?,
                                   port_range_end = ?, allowed_ips = ?, expiry_time = ?,
                                   is_active = ?, updated_time = ?
             WHERE id = ?",
        )
        .bind(&share.name)
        .bind(share.max_bandwidth)
        .bind(share.port_range_start)
        .bind(share.port_range_end)
        .bind(&share.allowed_ips)
        .bind(share.expiry_time)
        .bind(share.is_active)
        .bind(now_millis())
        .bind(share.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes the share with every runtime and relay record it holds.
    pub async fn delete_share_cascade(&self, id: i64) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let runtimes = sqlx::query("DELETE FROM peer_share_runtime WHERE share_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM peer_share_relay WHERE share_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM peer_share WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(runtimes)
    }

    pub async fn reset_share_flow(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE peer_share SET current_flow = 0, updated_time = ? WHERE id = ?")
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_share_flow(&self, id: i64, delta: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE peer_share SET current_flow = current_flow + ? WHERE id = ?")
            .bind(delta)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Runtimes

    pub async fn list_runtimes(&self, share_id: i64) -> Result<Vec<PeerShareRuntime>, sqlx::Error> {
        sqlx::query_as::<_, PeerShareRuntime>(
            "SELECT * FROM peer_share_runtime WHERE share_id = ? ORDER BY port, id",
        )
        .bind(share_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_applied_runtimes(
        &self,
        share_id: i64,
    ) -> Result<Vec<PeerShareRuntime>, sqlx::Error> {
        sqlx::query_as::<_, PeerShareRuntime>(
            "SELECT * FROM peer_share_runtime
             WHERE share_id = ? AND applied = 1 AND status = 1
             ORDER BY port, id",
        )
        .bind(share_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn insert_runtime(&self, runtime: &PeerShareRuntime) -> Result<PeerShareRuntime, sqlx::Error> {
        let now = now_millis();
        let result = sqlx::query(
            "INSERT INTO peer_share_runtime
                (share_id, node_id, reservation_id, resource_key, binding_id, role, chain_name,
                 service_name, protocol, strategy, port, target, applied, status,
                 created_time, updated_time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 1, ?, ?)",
        )
        .bind(runtime.share_id)
        .bind(runtime.node_id)
        .bind(&runtime.reservation_id)
        .bind(&runtime.resource_key)
        .bind(&runtime.binding_id)
        .bind(&runtime.role)
        .bind(&runtime.chain_name)
        .bind(&runtime.service_name)
        .bind(&runtime.protocol)
        .bind(&runtime.strategy)
        .bind(runtime.port)
        .bind(&runtime.target)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        sqlx::query_as::<_, PeerShareRuntime>("SELECT * FROM peer_share_runtime WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await
    }

    pub async fn find_runtime(
        &self,
        share_id: i64,
        reservation_id: &str,
    ) -> Result<Option<PeerShareRuntime>, sqlx::Error> {
        sqlx::query_as::<_, PeerShareRuntime>(
            "SELECT * FROM peer_share_runtime WHERE share_id = ? AND reservation_id = ?",
        )
        .bind(share_id)
        .bind(reservation_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Applied runtime serving `service_name` on a node, used to meter share traffic.
    pub async fn find_runtime_by_service(
        &self,
        node_id: i64,
        service_name: &str,
    ) -> Result<Option<PeerShareRuntime>, sqlx::Error> {
        sqlx::query_as::<_, PeerShareRuntime>(
            "SELECT * FROM peer_share_runtime
             WHERE node_id = ? AND service_name = ? AND applied = 1
             LIMIT 1",
        )
        .bind(node_id)
        .bind(service_name)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn mark_runtime_applied(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE peer_share_runtime SET applied = 1, updated_time = ? WHERE id = ?")
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_runtime(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM peer_share_runtime WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Relayed objects

    /// Share holding `name` on a node, either as a relayed object of `kind` or,
    /// for services, as a reserved runtime.
    pub async fn shared_name_owner(
        &self,
        node_id: i64,
        kind: &str,
        name: &str,
    ) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT share_id FROM peer_share_relay WHERE node_id = ?1 AND kind = ?2 AND name = ?3
             UNION
             SELECT share_id FROM peer_share_runtime
             WHERE node_id = ?1 AND ?2 = ?4 AND service_name = ?3
             LIMIT 1",
        )
        .bind(node_id)
        .bind(kind)
        .bind(name)
        .bind(RELAY_SERVICE)
        .fetch_optional(&self.pool)
        .await
    }

    /// Ports the share holds on its node through runtimes or relayed services.
    pub async fn share_ports(&self, share_id: i64) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT port FROM peer_share_runtime WHERE share_id = ?1
             UNION
             SELECT port FROM peer_share_relay WHERE share_id = ?1 AND port > 0",
        )
        .bind(share_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_relays(&self, share_id: i64) -> Result<Vec<PeerShareRelay>, sqlx::Error> {
        sqlx::query_as::<_, PeerShareRelay>(
            "SELECT * FROM peer_share_relay WHERE share_id = ? ORDER BY id",
        )
        .bind(share_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Records relayed objects; a name already held by the share keeps its row
    /// with the new port. Returns the names that were not recorded before.
    pub async fn record_relays(
        &self,
        share_id: i64,
        node_id: i64,
        kind: &str,
        entries: &[(String, i64)],
    ) -> Result<Vec<String>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut added = Vec::new();
        for (name, port) in entries {
            let updated = sqlx::query(
                "UPDATE peer_share_relay SET port = ?
                 WHERE share_id = ? AND node_id = ? AND kind = ? AND name = ?",
            )
            .bind(port)
            .bind(share_id)
            .bind(node_id)
            .bind(kind)
            .bind(name)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated > 0 {
                continue;
            }
            sqlx::query(
                "INSERT INTO peer_share_relay (share_id, node_id, kind, name, port, created_time)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(share_id)
            .bind(node_id)
            .bind(kind)
            .bind(name)
            .bind(port)
            .bind(now_millis())
            .execute(&mut *tx)
            .await?;
            added.push(name.clone());
        }
        tx.commit().await?;
        Ok(added)
    }

    pub async fn forget_relays(
        &self,
        share_id: i64,
        kind: &str,
        names: &[String],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for name in names {
            sqlx::query("DELETE FROM peer_share_relay WHERE share_id = ? AND kind = ? AND name = ?")
                .bind(share_id)
                .bind(kind)
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Whether the provider's own forward listens on this node.
    pub async fn forward_listens_on(&self, forward_id: i64, node_id: i64) -> Result<bool, sqlx::Error> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(1) FROM forward_port WHERE forward_id = ? AND node_id = ?",
        )
        .bind(forward_id)
        .bind(node_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Whether the provider's own tunnel has a hop on this node.
    pub async fn tunnel_uses_node(&self, tunnel_id: i64, node_id: i64) -> Result<bool, sqlx::Error> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(1) FROM chain_tunnel WHERE tunnel_id = ? AND node_id = ?",
        )
        .bind(tunnel_id)
        .bind(node_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}
