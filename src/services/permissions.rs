// src/services/permissions.rs
//! Direct user-tunnel grants and their group-derived counterpart.
//!
//! A group permission links a user group to a tunnel group and materialises one
//! grant per (user, tunnel) pair. A grant either reuses an existing user-tunnel
//! row or creates it; only rows a grant created are removed when the last grant
//! on them is revoked.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

use crate::db::{Database, UserTunnelGrant};
use crate::error::{AppError, Result};
use crate::models::*;
use crate::services::orchestrator::Orchestrator;
use crate::utils::validation::validate_name;

pub struct PermissionService {
    db: Database,
    orchestrator: Arc<Orchestrator>,
}

impl PermissionService {
    pub fn new(db: Database, orchestrator: Arc<Orchestrator>) -> Self {
        Self { db, orchestrator }
    }

    /// Creates or rewrites the (user, tunnel) grant. The row id never changes.
    pub async fn assign_user_tunnel(&self, req: AssignUserTunnelRequest) -> Result<UserTunnel> {
        self.require_user(req.user_id).await?;
        self.require_tunnel(req.tunnel_id).await?;
        if let Some(speed_id) = req.speed_id {
            if !self.db.speed_limit_exists(speed_id).await? {
                return Err(AppError::validation("speed limit does not exist"));
            }
        }

        let grant = self
            .db
            .upsert_user_tunnel(&UserTunnelGrant {
                user_id: req.user_id,
                tunnel_id: req.tunnel_id,
                speed_id: req.speed_id,
                num: req.num,
                flow: req.flow,
                flow_reset_time: req.flow_reset_time,
                exp_time: req.exp_time,
            })
            .await?;
        info!(user_id = req.user_id, tunnel_id = req.tunnel_id, user_tunnel_id = grant.id, "Tunnel granted");
        Ok(grant)
    }

    /// Deletes the user's forwards on the tunnel, then the grant itself.
    pub async fn remove_user_tunnel(&self, req: RemoveUserTunnelRequest) -> Result<()> {
        let grant = self
            .db
            .find_user_tunnel_by_pair(req.user_id, req.tunnel_id)
            .await?
            .ok_or_else(|| AppError::not_found("user tunnel does not exist"))?;
        self.drop_user_tunnel(&grant).await
    }

    pub async fn create_user_group(&self, req: CreateGroupRequest) -> Result<i64> {
        validate_name(&req.name).map_err(AppError::Validation)?;
        Ok(self.db.create_user_group(req.name.trim()).await?)
    }

    pub async fn create_tunnel_group(&self, req: CreateGroupRequest) -> Result<i64> {
        validate_name(&req.name).map_err(AppError::Validation)?;
        Ok(self.db.create_tunnel_group(req.name.trim()).await?)
    }

    /// Replaces the membership of a user group. Joining users receive the
    /// group's grants; leaving users lose the grants they got through it.
    pub async fn assign_group_users(&self, req: AssignGroupUsersRequest) -> Result<()> {
        if !self.db.user_group_exists(req.group_id).await? {
            return Err(AppError::not_found("user group does not exist"));
        }
        let desired: BTreeSet<i64> = req.user_ids.into_iter().collect();
        for &user_id in &desired {
            self.require_user(user_id).await?;
        }
        let current: BTreeSet<i64> = self
            .db
            .list_group_user_ids(req.group_id)
            .await?
            .into_iter()
            .collect();
        let permissions = self.db.list_permissions_for_user_group(req.group_id).await?;

        for &user_id in desired.difference(&current) {
            self.db.add_group_user(req.group_id, user_id).await?;
            for permission in &permissions {
                for tunnel_id in self.db.list_group_tunnel_ids(permission.tunnel_group_id).await? {
                    self.grant(permission, user_id, tunnel_id).await?;
                }
            }
        }

        for &user_id in current.difference(&desired) {
            self.db.remove_group_user(req.group_id, user_id).await?;
            for permission in &permissions {
                self.revoke_where(permission, |grant, _| grant.user_id == user_id)
                    .await?;
            }
        }

        info!(user_group_id = req.group_id, members = desired.len(), "User group membership updated");
        Ok(())
    }

    /// Replaces the tunnels of a tunnel group, granting or revoking them for
    /// every user group permitted on it.
    pub async fn assign_group_tunnels(&self, req: AssignGroupTunnelsRequest) -> Result<()> {
        if !self.db.tunnel_group_exists(req.group_id).await? {
            return Err(AppError::not_found("tunnel group does not exist"));
        }
        let desired: BTreeSet<i64> = req.tunnel_ids.into_iter().collect();
        for &tunnel_id in &desired {
            self.require_tunnel(tunnel_id).await?;
        }
        let current: BTreeSet<i64> = self
            .db
            .list_group_tunnel_ids(req.group_id)
            .await?
            .into_iter()
            .collect();
        let permissions = self.db.list_permissions_for_tunnel_group(req.group_id).await?;

        for &tunnel_id in desired.difference(&current) {
            self.db.add_group_tunnel(req.group_id, tunnel_id).await?;
            for permission in &permissions {
                for user_id in self.db.list_group_user_ids(permission.user_group_id).await? {
                    self.grant(permission, user_id, tunnel_id).await?;
                }
            }
        }

        for &tunnel_id in current.difference(&desired) {
            self.db.remove_group_tunnel(req.group_id, tunnel_id).await?;
            for permission in &permissions {
                self.revoke_where(permission, |_, user_tunnel| {
                    user_tunnel.map(|ut| ut.tunnel_id) == Some(tunnel_id)
                })
                .await?;
            }
        }

        info!(tunnel_group_id = req.group_id, tunnels = desired.len(), "Tunnel group updated");
        Ok(())
    }

    pub async fn assign_group_permission(
        &self,
        req: AssignGroupPermissionRequest,
    ) -> Result<GroupPermission> {
        if !self.db.user_group_exists(req.user_group_id).await? {
            return Err(AppError::not_found("user group does not exist"));
        }
        if !self.db.tunnel_group_exists(req.tunnel_group_id).await? {
            return Err(AppError::not_found("tunnel group does not exist"));
        }

        let permission = self
            .db
            .upsert_group_permission(req.user_group_id, req.tunnel_group_id)
            .await?;
        let tunnels = self.db.list_group_tunnel_ids(req.tunnel_group_id).await?;
        for user_id in self.db.list_group_user_ids(req.user_group_id).await? {
            for &tunnel_id in &tunnels {
                self.grant(&permission, user_id, tunnel_id).await?;
            }
        }

        info!(
            permission_id = permission.id,
            user_group_id = req.user_group_id,
            tunnel_group_id = req.tunnel_group_id,
            "Group permission assigned"
        );
        Ok(permission)
    }

    pub async fn remove_group_permission(&self, id: i64) -> Result<()> {
        let permission = self
            .db
            .find_group_permission(id)
            .await?
            .ok_or_else(|| AppError::not_found("group permission does not exist"))?;
        self.revoke_where(&permission, |_, _| true).await?;
        self.db.delete_group_permission(permission.id).await?;
        info!(permission_id = id, "Group permission removed");
        Ok(())
    }

    async fn grant(&self, permission: &GroupPermission, user_id: i64, tunnel_id: i64) -> Result<()> {
        match self.db.find_user_tunnel_by_pair(user_id, tunnel_id).await? {
            Some(existing) => {
                self.db
                    .insert_grant(permission.id, user_id, existing.id, false)
                    .await?;
            }
            None => {
                // Group-created grants inherit the user's own quota terms.
                let user = self.db.get_user(user_id).await?;
                let created = self
                    .db
                    .upsert_user_tunnel(&UserTunnelGrant {
                        user_id,
                        tunnel_id,
                        speed_id: None,
                        num: user.num,
                        flow: user.flow,
                        flow_reset_time: user.flow_reset_time,
                        exp_time: user.exp_time,
                    })
                    .await?;
                self.db
                    .insert_grant(permission.id, user_id, created.id, true)
                    .await?;
            }
        }
        Ok(())
    }

    async fn revoke_where<F>(&self, permission: &GroupPermission, matches: F) -> Result<()>
    where
        F: Fn(&GroupPermissionGrant, Option<&UserTunnel>) -> bool,
    {
        for grant in self.db.list_grants_for_permission(permission.id).await? {
            let user_tunnel = self.db.find_user_tunnel(grant.user_tunnel_id).await?;
            if !matches(&grant, user_tunnel.as_ref()) {
                continue;
            }
            self.db.delete_grant(grant.id).await?;

            if let Some(user_tunnel) = user_tunnel {
                let remaining = self.db.count_grants_for_user_tunnel(user_tunnel.id).await?;
                if grant.created_user_tunnel == 1 && remaining == 0 {
                    self.drop_user_tunnel(&user_tunnel).await?;
                }
            }
        }
        Ok(())
    }

    async fn drop_user_tunnel(&self, user_tunnel: &UserTunnel) -> Result<()> {
        for forward in self
            .db
            .list_user_forwards_on_tunnel(user_tunnel.user_id, user_tunnel.tunnel_id)
            .await?
        {
            self.orchestrator.delete_forward_unchecked(&forward).await?;
        }
        self.db.delete_user_tunnel(user_tunnel.id).await?;
        info!(
            user_id = user_tunnel.user_id,
            tunnel_id = user_tunnel.tunnel_id,
            "Tunnel grant removed"
        );
        Ok(())
    }

    async fn require_user(&self, id: i64) -> Result<User> {
        self.db
            .find_user(id)
            .await?
            .ok_or_else(|| AppError::validation(format!("user {} does not exist", id)))
    }

    async fn require_tunnel(&self, id: i64) -> Result<Tunnel> {
        self.db
            .find_tunnel(id)
            .await?
            .ok_or_else(|| AppError::validation(format!("tunnel {} does not exist", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewTunnel;
    use crate::services::dispatcher::{Dispatcher, RecordingTransport};

    async fn setup() -> (Database, PermissionService) {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = Arc::new(Dispatcher::new(db.clone(), transport));
        let orchestrator = Arc::new(Orchestrator::new(db.clone(), dispatcher));
        (db.clone(), PermissionService::new(db, orchestrator))
    }

    async fn tunnel(db: &Database, name: &str) -> i64 {
        db.insert_tunnel_with_hops(
            &NewTunnel {
                name: name.to_string(),
                tunnel_type: 1,
                traffic_ratio: 1.0,
                flow_factor: 1.0,
                flow_quota: 0,
                protocol: "tls".to_string(),
            },
            &[],
        )
        .await
        .unwrap()
        .0
        .id
    }

    fn assign(user_id: i64, tunnel_id: i64, flow: i64) -> AssignUserTunnelRequest {
        AssignUserTunnelRequest {
            user_id,
            tunnel_id,
            flow,
            num: 5,
            exp_time: 0,
            flow_reset_time: 0,
            speed_id: None,
        }
    }

    #[tokio::test]
    async fn test_reassigning_keeps_a_single_stable_row() {
        let (db, permissions) = setup().await;
        let user = db.create_user("dave", 1, 10, 0, 0).await.unwrap();
        let tunnel_id = tunnel(&db, "t").await;

        let first = permissions.assign_user_tunnel(assign(user.id, tunnel_id, 10)).await.unwrap();
        let second = permissions.assign_user_tunnel(assign(user.id, tunnel_id, 20)).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.flow, 20);
        assert_eq!(db.list_user_tunnels(user.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_group_binding_and_unbinding() {
        let (db, permissions) = setup().await;
        let alice = db.create_user("alice", 1, 10, 0, 0).await.unwrap();
        let bob = db.create_user("bob", 1, 10, 0, 0).await.unwrap();
        let tunnel_id = tunnel(&db, "shared").await;

        let user_group = permissions
            .create_user_group(CreateGroupRequest { name: "staff".to_string() })
            .await
            .unwrap();
        let tunnel_group = permissions
            .create_tunnel_group(CreateGroupRequest { name: "edge".to_string() })
            .await
            .unwrap();
        permissions
            .assign_group_tunnels(AssignGroupTunnelsRequest {
                group_id: tunnel_group,
                tunnel_ids: vec![tunnel_id],
            })
            .await
            .unwrap();
        let permission = permissions
            .assign_group_permission(AssignGroupPermissionRequest {
                user_group_id: user_group,
                tunnel_group_id: tunnel_group,
            })
            .await
            .unwrap();

        // Bob already holds a direct grant, which must survive revocation.
        let direct = permissions.assign_user_tunnel(assign(bob.id, tunnel_id, 3)).await.unwrap();

        permissions
            .assign_group_users(AssignGroupUsersRequest {
                group_id: user_group,
                user_ids: vec![alice.id, bob.id],
            })
            .await
            .unwrap();
        assert!(db.find_user_tunnel_by_pair(alice.id, tunnel_id).await.unwrap().is_some());
        assert_eq!(db.list_grants_for_permission(permission.id).await.unwrap().len(), 2);

        permissions
            .assign_group_users(AssignGroupUsersRequest {
                group_id: user_group,
                user_ids: vec![bob.id],
            })
            .await
            .unwrap();
        assert!(db.find_user_tunnel_by_pair(alice.id, tunnel_id).await.unwrap().is_none());
        assert_eq!(db.list_grants_for_permission(permission.id).await.unwrap().len(), 1);

        permissions
            .assign_group_users(AssignGroupUsersRequest {
                group_id: user_group,
                user_ids: vec![],
            })
            .await
            .unwrap();
        assert!(db.list_grants_for_permission(permission.id).await.unwrap().is_empty());
        let kept = db.find_user_tunnel_by_pair(bob.id, tunnel_id).await.unwrap().unwrap();
        assert_eq!(kept.id, direct.id);
    }

    #[tokio::test]
    async fn test_removing_permission_revokes_created_grants() {
        let (db, permissions) = setup().await;
        let carol = db.create_user("carol", 1, 10, 0, 0).await.unwrap();
        let tunnel_id = tunnel(&db, "t").await;
        let user_group = permissions
            .create_user_group(CreateGroupRequest { name: "ug".to_string() })
            .await
            .unwrap();
        let tunnel_group = permissions
            .create_tunnel_group(CreateGroupRequest { name: "tg".to_string() })
            .await
            .unwrap();
        permissions
            .assign_group_users(AssignGroupUsersRequest {
                group_id: user_group,
                user_ids: vec![carol.id],
            })
            .await
            .unwrap();
        permissions
            .assign_group_tunnels(AssignGroupTunnelsRequest {
                group_id: tunnel_group,
                tunnel_ids: vec![tunnel_id],
            })
            .await
            .unwrap();
        let permission = permissions
            .assign_group_permission(AssignGroupPermissionRequest {
                user_group_id: user_group,
                tunnel_group_id: tunnel_group,
            })
            .await
            .unwrap();
        assert!(db.find_user_tunnel_by_pair(carol.id, tunnel_id).await.unwrap().is_some());

        permissions.remove_group_permission(permission.id).await.unwrap();
        assert!(db.find_user_tunnel_by_pair(carol.id, tunnel_id).await.unwrap().is_none());
        assert!(db.find_group_permission(permission.id).await.unwrap().is_none());
    }
}
