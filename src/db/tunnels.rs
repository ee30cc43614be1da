// src/db/tunnels.rs
use super::Database;
use crate::models::{ChainTunnel, Tunnel};
use crate::utils::now_millis;

#[derive(Debug, Clone)]
pub struct NewTunnel {
    pub name: String,
    pub tunnel_type: i64,
    pub traffic_ratio: f64,
    pub flow_factor: f64,
    pub flow_quota: i64,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewHop {
    pub chain_type: i64,
    pub inx: i64,
    pub node_id: i64,
    pub port: i64,
    pub protocol: String,
    pub strategy: String,
}

impl Database {
    /// Inserts the tunnel and all of its hops atomically.
    pub async fn insert_tunnel_with_hops(
        &self,
        tunnel: &NewTunnel,
        hops: &[NewHop],
    ) -> Result<(Tunnel, Vec<ChainTunnel>), sqlx::Error> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let tunnel_id = sqlx::query(
            "INSERT INTO tunnel (name, tunnel_type, traffic_ratio, flow_factor, flow_quota,
                                 protocol, status, created_time, updated_time)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&tunnel.name)
        .bind(tunnel.tunnel_type)
        .bind(tunnel.traffic_ratio)
        .bind(tunnel.flow_factor)
        .bind(tunnel.flow_quota)
        .bind(&tunnel.protocol)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for hop in hops {
            insert_hop(&mut tx, tunnel_id, hop).await?;
        }

        tx.commit().await?;

        let tunnel = self.get_tunnel(tunnel_id).await?;
        let hops = self.list_hops(tunnel_id).await?;
        Ok((tunnel, hops))
    }

    pub async fn get_tunnel(&self, id: i64) -> Result<Tunnel, sqlx::Error> {
        sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnel WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn find_tunnel(&self, id: i64) -> Result<Option<Tunnel>, sqlx::Error> {
        sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnel WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_tunnels(&self) -> Result<Vec<Tunnel>, sqlx::Error> {
        sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnel ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    /// Tunnels the user holds an active grant for.
    pub async fn list_tunnels_for_user(&self, user_id: i64) -> Result<Vec<Tunnel>, sqlx::Error> {
        sqlx::query_as::<_, Tunnel>(
            "SELECT t.* FROM tunnel t
             JOIN user_tunnel ut ON ut.tunnel_id = t.id
             WHERE ut.user_id = ? AND ut.status = 1 AND t.status = 1
             ORDER BY t.id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn update_tunnel_fields(&self, tunnel: &Tunnel) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tunnel SET name = ?, tunnel_type = ?, traffic_ratio = ?, flow_factor = ?,
                               flow_quota = ?, protocol = ?, status = ?, updated_time = ?
             WHERE id = ?",
        )
        .bind(&tunnel.name)
        .bind(tunnel.tunnel_type)
        .bind(tunnel.traffic_ratio)
        .bind(tunnel.flow_factor)
        .bind(tunnel.flow_quota)
        .bind(&tunnel.protocol)
        .bind(tunnel.status)
        .bind(now_millis())
        .bind(tunnel.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Hops ordered entry -> middle (by ordinal) -> exit.
    pub async fn list_hops(&self, tunnel_id: i64) -> Result<Vec<ChainTunnel>, sqlx::Error> {
        sqlx::query_as::<_, ChainTunnel>(
            "SELECT * FROM chain_tunnel WHERE tunnel_id = ? ORDER BY chain_type, inx, id",
        )
        .bind(tunnel_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_hops_on_node(&self, node_id: i64) -> Result<Vec<ChainTunnel>, sqlx::Error> {
        sqlx::query_as::<_, ChainTunnel>(
            "SELECT * FROM chain_tunnel WHERE node_id = ? ORDER BY tunnel_id, chain_type, inx",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Swaps the hop set of a tunnel for a freshly planned one.
    pub async fn replace_hops(
        &self,
        tunnel_id: i64,
        hops: &[NewHop],
    ) -> Result<Vec<ChainTunnel>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chain_tunnel WHERE tunnel_id = ?")
            .bind(tunnel_id)
            .execute(&mut *tx)
            .await?;
        for hop in hops {
            insert_hop(&mut tx, tunnel_id, hop).await?;
        }
        tx.commit().await?;

        self.list_hops(tunnel_id).await
    }

    /// Puts back a hop snapshot exactly, ids included.
    pub async fn restore_hops(
        &self,
        tunnel_id: i64,
        snapshot: &[ChainTunnel],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chain_tunnel WHERE tunnel_id = ?")
            .bind(tunnel_id)
            .execute(&mut *tx)
            .await?;
        for hop in snapshot {
            sqlx::query(
                "INSERT INTO chain_tunnel (id, tunnel_id, chain_type, inx, node_id, port, protocol, strategy)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(hop.id)
            .bind(hop.tunnel_id)
            .bind(hop.chain_type)
            .bind(hop.inx)
            .bind(hop.node_id)
            .bind(hop.port)
            .bind(&hop.protocol)
            .bind(&hop.strategy)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Removes the tunnel, its hops, its grants and its group links.
    pub async fn delete_tunnel_rows(&self, tunnel_id: i64) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chain_tunnel WHERE tunnel_id = ?")
            .bind(tunnel_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM group_permission_grant
             WHERE user_tunnel_id IN (SELECT id FROM user_tunnel WHERE tunnel_id = ?)",
        )
        .bind(tunnel_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM user_tunnel WHERE tunnel_id = ?")
            .bind(tunnel_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tunnel_group_tunnel WHERE tunnel_id = ?")
            .bind(tunnel_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tunnel WHERE id = ?")
            .bind(tunnel_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Ports held on a node by hops, forward ports and share runtimes.
    /// Rows of `exclude_tunnel` / `exclude_forward` are left out so their
    /// owner can be re-planned.
    pub async fn taken_ports_on_node(
        &self,
        node_id: i64,
        exclude_tunnel: Option<i64>,
        exclude_forward: Option<i64>,
    ) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT port FROM chain_tunnel WHERE node_id = ?1 AND port > 0 AND tunnel_id != ?2
             UNION
             SELECT port FROM forward_port WHERE node_id = ?1 AND forward_id != ?3
             UNION
             SELECT port FROM peer_share_runtime WHERE node_id = ?1 AND status = 1
             UNION
             SELECT port FROM peer_share_relay WHERE node_id = ?1 AND port > 0",
        )
        .bind(node_id)
        .bind(exclude_tunnel.unwrap_or(-1))
        .bind(exclude_forward.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await
    }
}

async fn insert_hop(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    tunnel_id: i64,
    hop: &NewHop,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO chain_tunnel (tunnel_id, chain_type, inx, node_id, port, protocol, strategy)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(tunnel_id)
    .bind(hop.chain_type)
    .bind(hop.inx)
    .bind(hop.node_id)
    .bind(hop.port)
    .bind(&hop.protocol)
    .bind(&hop.strategy)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
