// src/db/forwards.rs
use super::Database;
use crate::models::{Forward, ForwardPort};
use crate::utils::now_millis;

#[derive(Debug, Clone)]
pub struct NewForward {
    pub user_id: i64,
    pub user_name: String,
    pub name: String,
    pub tunnel_id: i64,
    pub remote_addr: String,
    pub strategy: String,
}

impl Database {
    /// Inserts the forward together with its entry-node ports.
    pub async fn insert_forward_with_ports(
        &self,
        forward: &NewForward,
        ports: &[(i64, i64)],
    ) -> Result<(Forward, Vec<ForwardPort>), sqlx::Error> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let forward_id = sqlx::query(
            "INSERT INTO forward (user_id, user_name, name, tunnel_id, remote_addr, strategy,
                                  in_flow, out_flow, status, created_time, updated_time)
             VALUES (?, ?, ?, ?, ?, ?, 0, 0, 1, ?, ?)",
        )
        .bind(forward.user_id)
        .bind(&forward.user_name)
        .bind(&forward.name)
        .bind(forward.tunnel_id)
        .bind(&forward.remote_addr)
        .bind(&forward.strategy)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for (node_id, port) in ports {
            sqlx::query("INSERT INTO forward_port (forward_id, node_id, port) VALUES (?, ?, ?)")
                .bind(forward_id)
                .bind(node_id)
                .bind(port)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        let forward = self.get_forward(forward_id).await?;
        let ports = self.list_forward_ports(forward_id).await?;
        Ok((forward, ports))
    }

    pub async fn get_forward(&self, id: i64) -> Result<Forward, sqlx::Error> {
        sqlx::query_as::<_, Forward>("SELECT * FROM forward WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn find_forward(&self, id: i64) -> Result<Option<Forward>, sqlx::Error> {
        sqlx::query_as::<_, Forward>("SELECT * FROM forward WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_forwards(&self, owner: Option<i64>) -> Result<Vec<Forward>, sqlx::Error> {
        match owner {
            Some(user_id) => {
                sqlx::query_as::<_, Forward>(
                    "SELECT * FROM forward WHERE user_id = ? ORDER BY id",
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, Forward>("SELECT * FROM forward ORDER BY id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
    }

    pub async fn list_forwards_on_tunnel(&self, tunnel_id: i64) -> Result<Vec<Forward>, sqlx::Error> {
        sqlx::query_as::<_, Forward>("SELECT * FROM forward WHERE tunnel_id = ? ORDER BY id")
            .bind(tunnel_id)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn count_forwards_on_tunnel(&self, tunnel_id: i64) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM forward WHERE tunnel_id = ?")
            .bind(tunnel_id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn list_user_forwards_on_tunnel(
        &self,
        user_id: i64,
        tunnel_id: i64,
    ) -> Result<Vec<Forward>, sqlx::Error> {
        sqlx::query_as::<_, Forward>(
            "SELECT * FROM forward WHERE user_id = ? AND tunnel_id = ? ORDER BY id",
        )
        .bind(user_id)
        .bind(tunnel_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_active_forwards_by_user(
        &self,
        user_id: i64,
    ) -> Result<Vec<Forward>, sqlx::Error> {
        sqlx::query_as::<_, Forward>(
            "SELECT * FROM forward WHERE user_id = ? AND status = 1 ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_active_forwards_by_user_tunnel(
        &self,
        user_id: i64,
        tunnel_id: i64,
    ) -> Result<Vec<Forward>, sqlx::Error> {
        sqlx::query_as::<_, Forward>(
            "SELECT * FROM forward WHERE user_id = ? AND tunnel_id = ? AND status = 1 ORDER BY id",
        )
        .bind(user_id)
        .bind(tunnel_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_forward_ports(&self, forward_id: i64) -> Result<Vec<ForwardPort>, sqlx::Error> {
        sqlx::query_as::<_, ForwardPort>(
            "SELECT * FROM forward_port WHERE forward_id = ? ORDER BY id",
        )
        .bind(forward_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Stages a forward edit: new fields plus a fresh set of entry ports.
    pub async fn update_forward_with_ports(
        &self,
        forward: &Forward,
        ports: &[(i64, i64)],
    ) -> Result<Vec<ForwardPort>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE forward SET name = ?, tunnel_id = ?, remote_addr = ?, strategy = ?,
                                updated_time = ?
             WHERE id = ?",
        )
        .bind(&forward.name)
        .bind(forward.tunnel_id)
        .bind(&forward.remote_addr)
        .bind(&forward.strategy)
        .bind(now_millis())
        .bind(forward.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM forward_port WHERE forward_id = ?")
            .bind(forward.id)
            .execute(&mut *tx)
            .await?;
        for (node_id, port) in ports {
            sqlx::query("INSERT INTO forward_port (forward_id, node_id, port) VALUES (?, ?, ?)")
                .bind(forward.id)
                .bind(node_id)
                .bind(port)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        self.list_forward_ports(forward.id).await
    }

    /// Writes a pre-stage snapshot back verbatim, port row ids included.
    pub async fn restore_forward(
        &self,
        forward: &Forward,
        ports: &[ForwardPort],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE forward SET name = ?, tunnel_id = ?, remote_addr = ?, strategy = ?,
                                status = ?, updated_time = ?
             WHERE id = ?",
        )
        .bind(&forward.name)
        .bind(forward.tunnel_id)
        .bind(&forward.remote_addr)
        .bind(&forward.strategy)
        .bind(forward.status)
        .bind(forward.updated_time)
        .bind(forward.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM forward_port WHERE forward_id = ?")
            .bind(forward.id)
            .execute(&mut *tx)
            .await?;
        for port in ports {
            sqlx::query(
                "INSERT INTO forward_port (id, forward_id, node_id, port) VALUES (?, ?, ?, ?)",
            )
            .bind(port.id)
            .bind(port.forward_id)
            .bind(port.node_id)
            .bind(port.port)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_forward_status(&self, id: i64, status: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE forward SET status = ?, updated_time = ? WHERE id = ?")
            .bind(status)
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_forward_flow(
        &self,
        id: i64,
        in_delta: i64,
        out_delta: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE forward SET in_flow = in_flow + ?, out_flow = out_flow + ? WHERE id = ?")
            .bind(in_delta)
            .bind(out_delta)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_forward_rows(&self, id: i64) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM forward_port WHERE forward_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM forward WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
