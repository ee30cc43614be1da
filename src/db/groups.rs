// src/db/groups.rs
use super::Database;
use crate::models::{GroupPermission, GroupPermissionGrant};
use crate::utils::now_millis;

impl Database {
    pub async fn create_user_group(&self, name: &str) -> Result<i64, sqlx::Error> {
        let result = sqlx::query("INSERT INTO user_group (name, status, created_time) VALUES (?, 1, ?)")
            .bind(name)
            .bind(now_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn create_tunnel_group(&self, name: &str) -> Result<i64, sqlx::Error> {
        let result =
            sqlx::query("INSERT INTO tunnel_group (name, status, created_time) VALUES (?, 1, ?)")
                .bind(name)
                .bind(now_millis())
                .execute(&self.pool)
                .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn user_group_exists(&self, id: i64) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_group WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn tunnel_group_exists(&self, id: i64) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tunnel_group WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn list_group_user_ids(&self, user_group_id: i64) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT user_id FROM user_group_user WHERE user_group_id = ? ORDER BY user_id",
        )
        .bind(user_group_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn add_group_user(&self, user_group_id: i64, user_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO user_group_user (user_group_id, user_id) VALUES (?, ?)
             ON CONFLICT(user_group_id, user_id) DO NOTHING",
        )
        .bind(user_group_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_group_user(
        &self,
        user_group_id: i64,
        user_id: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM user_group_user WHERE user_group_id = ? AND user_id = ?")
            .bind(user_group_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_group_tunnel_ids(
        &self,
        tunnel_group_id: i64,
    ) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT tunnel_id FROM tunnel_group_tunnel WHERE tunnel_group_id = ? ORDER BY tunnel_id",
        )
        .bind(tunnel_group_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn add_group_tunnel(
        &self,
        tunnel_group_id: i64,
        tunnel_id: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO tunnel_group_tunnel (tunnel_group_id, tunnel_id) VALUES (?, ?)
             ON CONFLICT(tunnel_group_id, tunnel_id) DO NOTHING",
        )
        .bind(tunnel_group_id)
        .bind(tunnel_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_group_tunnel(
        &self,
        tunnel_group_id: i64,
        tunnel_id: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM tunnel_group_tunnel WHERE tunnel_group_id = ? AND tunnel_id = ?")
            .bind(tunnel_group_id)
            .bind(tunnel_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Permissions

    pub async fn upsert_group_permission(
        &self,
        user_group_id: i64,
        tunnel_group_id: i64,
    ) -> Result<GroupPermission, sqlx::Error> {
        sqlx::query(
            "INSERT INTO group_permission (user_group_id, tunnel_group_id, created_time)
             VALUES (?, ?, ?)
             ON CONFLICT(user_group_id, tunnel_group_id) DO NOTHING",
        )
        .bind(user_group_id)
        .bind(tunnel_group_id)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        sqlx::query_as::<_, GroupPermission>(
            "SELECT * FROM group_permission WHERE user_group_id = ? AND tunnel_group_id = ?",
        )
        .bind(user_group_id)
        .bind(tunnel_group_id)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn find_group_permission(
        &self,
        id: i64,
    ) -> Result<Option<GroupPermission>, sqlx::Error> {
        sqlx::query_as::<_, GroupPermission>("SELECT * FROM group_permission WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_permissions_for_user_group(
        &self,
        user_group_id: i64,
    ) -> Result<Vec<GroupPermission>, sqlx::Error> {
        sqlx::query_as::<_, GroupPermission>(
            "SELECT * FROM group_permission WHERE user_group_id = ? ORDER BY id",
        )
        .bind(user_group_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_permissions_for_tunnel_group(
        &self,
        tunnel_group_id: i64,
    ) -> Result<Vec<GroupPermission>, sqlx::Error> {
        sqlx::query_as::<_, GroupPermission>(
            "SELECT * FROM group_permission WHERE tunnel_group_id = ? ORDER BY id",
        )
        .bind(tunnel_group_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn delete_group_permission(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM group_permission WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Grants

    pub async fn insert_grant(
        &self,
        group_permission_id: i64,
        user_id: i64,
        user_tunnel_id: i64,
        created_user_tunnel: bool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO group_permission_grant
                (group_permission_id, user_id, user_tunnel_id, created_user_tunnel)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(group_permission_id, user_tunnel_id) DO NOTHING",
        )
        .bind(group_permission_id)
        .bind(user_id)
        .bind(user_tunnel_id)
        .bind(created_user_tunnel as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_grants_for_permission(
        &self,
        group_permission_id: i64,
    ) -> Result<Vec<GroupPermissionGrant>, sqlx::Error> {
        sqlx::query_as::<_, GroupPermissionGrant>(
            "SELECT * FROM group_permission_grant WHERE group_permission_id = ? ORDER BY id",
        )
        .bind(group_permission_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn delete_grant(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM group_permission_grant WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_grants_for_user_tunnel(
        &self,
        user_tunnel_id: i64,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM group_permission_grant WHERE user_tunnel_id = ?")
            .bind(user_tunnel_id)
            .fetch_one(&self.pool)
            .await
    }
}
