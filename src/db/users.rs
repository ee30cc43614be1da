// src/db/users.rs
use super::Database;
use crate::models::{StatisticsFlow, User, UserTunnel};
use crate::utils::now_millis;

/// Quota terms written onto a user-tunnel grant.
#[derive(Debug, Clone, Default)]
pub struct UserTunnelGrant {
    pub user_id: i64,
    pub tunnel_id: i64,
    pub speed_id: Option<i64>,
    pub num: i64,
    pub flow: i64,
    pub flow_reset_time: i64,
    pub exp_time: i64,
}

/// Day-of-month selector for the monthly counter reset.
#[derive(Debug, Clone, Copy)]
pub struct ResetDay {
    pub day: u32,
    /// Set on the last day of the month; also matches reset days past the month's end.
    pub last_day_of_month: Option<u32>,
}

impl Database {
    pub async fn create_user(
        &self,
        user: &str,
        role_id: i64,
        flow: i64,
        exp_time: i64,
        flow_reset_time: i64,
    ) -> Result<User, sqlx::Error> {
        let now = now_millis();
        let result = sqlx::query(
            "INSERT INTO user (user, role_id, flow, flow_reset_time, exp_time, status,
                               created_time, updated_time)
             VALUES (?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(user)
        .bind(role_id)
        .bind(flow)
        .bind(flow_reset_time)
        .bind(exp_time)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_user(result.last_insert_rowid()).await
    }

    pub async fn get_user(&self, id: i64) -> Result<User, sqlx::Error> {
        sqlx::query_as::<_, User>("SELECT * FROM user WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn find_user(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>("SELECT * FROM user WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_users(&self) -> Result<Vec<User>, sqlx::Error> {
        sqlx::query_as::<_, User>("SELECT * FROM user ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn add_user_flow(
        &self,
        id: i64,
        in_delta: i64,
        out_delta: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE user SET in_flow = in_flow + ?, out_flow = out_flow + ? WHERE id = ?")
            .bind(in_delta)
            .bind(out_delta)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_user_status(&self, id: i64, status: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE user SET status = ?, updated_time = ? WHERE id = ?")
            .bind(status)
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Active, non-admin users whose expiry has passed.
    pub async fn list_expired_users(&self, now: i64) -> Result<Vec<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            "SELECT * FROM user
             WHERE role_id != 0 AND status = 1 AND exp_time > 0 AND exp_time < ?
             ORDER BY id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn reset_user_flows(&self, reset: ResetDay) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE user SET in_flow = 0, out_flow = 0
             WHERE flow_reset_time != 0
               AND (flow_reset_time = ? OR (? = 1 AND flow_reset_time > ?))",
        )
        .bind(reset.day as i64)
        .bind(reset.last_day_of_month.is_some() as i64)
        .bind(reset.last_day_of_month.unwrap_or(31) as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // User tunnel grants

    pub async fn get_user_tunnel(&self, id: i64) -> Result<UserTunnel, sqlx::Error> {
        sqlx::query_as::<_, UserTunnel>("SELECT * FROM user_tunnel WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn find_user_tunnel(&self, id: i64) -> Result<Option<UserTunnel>, sqlx::Error> {
        sqlx::query_as::<_, UserTunnel>("SELECT * FROM user_tunnel WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn find_user_tunnel_by_pair(
        &self,
        user_id: i64,
        tunnel_id: i64,
    ) -> Result<Option<UserTunnel>, sqlx::Error> {
        sqlx::query_as::<_, UserTunnel>(
            "SELECT * FROM user_tunnel WHERE user_id = ? AND tunnel_id = ?",
        )
        .bind(user_id)
        .bind(tunnel_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_user_tunnels(&self, user_id: i64) -> Result<Vec<UserTunnel>, sqlx::Error> {
        sqlx::query_as::<_, UserTunnel>("SELECT * FROM user_tunnel WHERE user_id = ? ORDER BY id")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
    }

    /// Creates the grant or rewrites the existing (user, tunnel) row in place.
    /// Counters survive a re-grant.
    pub async fn upsert_user_tunnel(
        &self,
        grant: &UserTunnelGrant,
    ) -> Result<UserTunnel, sqlx::Error> {
        sqlx::query(
            "INSERT INTO user_tunnel (user_id, tunnel_id, speed_id, num, flow, flow_reset_time,
                                      exp_time, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, 1)
             ON CONFLICT(user_id, tunnel_id) DO UPDATE SET
                speed_id = excluded.speed_id,
                num = excluded.num,
                flow = excluded.flow,
                flow_reset_time = excluded.flow_reset_time,
                exp_time = excluded.exp_time,
                status = 1",
        )
        .bind(grant.user_id)
        .bind(grant.tunnel_id)
        .bind(grant.speed_id)
        .bind(grant.num)
        .bind(grant.flow)
        .bind(grant.flow_reset_time)
        .bind(grant.exp_time)
        .execute(&self.pool)
        .await?;

        sqlx::query_as::<_, UserTunnel>(
            "SELECT * FROM user_tunnel WHERE user_id = ? AND tunnel_id = ?",
        )
        .bind(grant.user_id)
        .bind(grant.tunnel_id)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn add_user_tunnel_flow(
        &self,
        id: i64,
        in_delta: i64,
        out_delta: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE user_tunnel SET in_flow = in_flow + ?, out_flow = out_flow + ? WHERE id = ?",
        )
        .bind(in_delta)
        .bind(out_delta)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_user_tunnel_status(&self, id: i64, status: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE user_tunnel SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_expired_user_tunnels(&self, now: i64) -> Result<Vec<UserTunnel>, sqlx::Error> {
        sqlx::query_as::<_, UserTunnel>(
            "SELECT * FROM user_tunnel
             WHERE status = 1 AND exp_time > 0 AND exp_time < ?
             ORDER BY id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn reset_user_tunnel_flows(&self, reset: ResetDay) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE user_tunnel SET in_flow = 0, out_flow = 0
             WHERE flow_reset_time != 0
               AND (flow_reset_time = ? OR (? = 1 AND flow_reset_time > ?))",
        )
        .bind(reset.day as i64)
        .bind(reset.last_day_of_month.is_some() as i64)
        .bind(reset.last_day_of_month.unwrap_or(31) as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_user_tunnel(&self, id: i64) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM group_permission_grant WHERE user_tunnel_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM user_tunnel WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // Hourly statistics

    pub async fn latest_statistics_total(&self, user_id: i64) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT total_flow FROM statistics_flow
             WHERE user_id = ?
             ORDER BY created_time DESC, id DESC
             LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn insert_statistics(
        &self,
        user_id: i64,
        flow: i64,
        total_flow: i64,
        time: &str,
        created_time: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO statistics_flow (user_id, flow, total_flow, time, created_time)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(flow)
        .bind(total_flow)
        .bind(time)
        .bind(created_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_statistics(&self, user_id: i64) -> Result<Vec<StatisticsFlow>, sqlx::Error> {
        sqlx::query_as::<_, StatisticsFlow>(
            "SELECT * FROM statistics_flow WHERE user_id = ? ORDER BY created_time, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn prune_statistics(&self, before: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM statistics_flow WHERE created_time < ?")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn speed_limit_exists(&self, id: i64) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM speed_limit WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }
}
