// src/db/nodes.rs
use super::Database;
use crate::models::Node;
use crate::utils::now_millis;

#[derive(Debug, Clone, Default)]
pub struct NewNode {
    pub name: String,
    pub secret: String,
    pub server_ip: String,
    pub api_port: i64,
    pub port_range: String,
    pub tcp_listen_addr: String,
    pub udp_listen_addr: String,
    pub interface_name: String,
    pub http: i64,
    pub tls: i64,
    pub socks: i64,
    pub is_remote: bool,
    pub remote_url: String,
    pub remote_token: String,
    pub remote_config: String,
}

impl Database {
    pub async fn create_node(&self, node: &NewNode) -> Result<Node, sqlx::Error> {
        let now = now_millis();
        let result = sqlx::query(
            "INSERT INTO node (name, secret, server_ip, api_port, port_range, tcp_listen_addr,
                               udp_listen_addr, interface_name, http, tls, socks, status,
                               is_remote, remote_url, remote_token, remote_config,
                               created_time, updated_time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&node.name)
        .bind(&node.secret)
        .bind(&node.server_ip)
        .bind(node.api_port)
        .bind(&node.port_range)
        .bind(&node.tcp_listen_addr)
        .bind(&node.udp_listen_addr)
        .bind(&node.interface_name)
        .bind(node.http)
        .bind(node.tls)
        .bind(node.socks)
        .bind(node.is_remote as i64)
        .bind(&node.remote_url)
        .bind(&node.remote_token)
        .bind(&node.remote_config)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_node(result.last_insert_rowid()).await
    }

    pub async fn get_node(&self, id: i64) -> Result<Node, sqlx::Error> {
        sqlx::query_as::<_, Node>("SELECT * FROM node WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn find_node(&self, id: i64) -> Result<Option<Node>, sqlx::Error> {
        sqlx::query_as::<_, Node>("SELECT * FROM node WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn find_node_by_secret(&self, secret: &str) -> Result<Option<Node>, sqlx::Error> {
        sqlx::query_as::<_, Node>("SELECT * FROM node WHERE secret = ?")
            .bind(secret)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>, sqlx::Error> {
        sqlx::query_as::<_, Node>("SELECT * FROM node ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn list_remote_nodes(&self) -> Result<Vec<Node>, sqlx::Error> {
        sqlx::query_as::<_, Node>("SELECT * FROM node WHERE is_remote = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn mark_node_online(&self, id: i64, now: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE node SET status = 1, last_seen = ?, updated_time = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_remote_config(
        &self,
        id: i64,
        remote_config: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE node SET remote_config = ?, updated_time = ? WHERE id = ?")
            .bind(remote_config)
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Hop bindings, forward ports and share runtimes referencing the node.
    pub async fn count_node_references(&self, id: i64) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT (SELECT COUNT(*) FROM chain_tunnel WHERE node_id = ?1)
                  + (SELECT COUNT(*) FROM forward_port WHERE node_id = ?1)
                  + (SELECT COUNT(*) FROM peer_share WHERE node_id = ?1)",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn delete_node(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM node WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
