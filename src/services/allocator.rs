// src/services/allocator.rs
//! Chain/port allocation. Lowest free port in the node's range wins, so a plan
//! computed twice over the same store state is identical.

use std::collections::{HashMap, HashSet};

use crate::db::{Database, NewHop};
use crate::error::{AppError, Result};
use crate::models::{ChainRole, ChainTunnel, Node};
use crate::utils::validation::{parse_port_ranges, PortRange};

/// One requested hop of a tunnel definition.
#[derive(Debug, Clone, PartialEq)]
pub struct HopRequest {
    pub role: ChainRole,
    pub inx: i64,
    pub node_id: i64,
    pub protocol: String,
    pub strategy: String,
    pub port: Option<i64>,
}

impl HopRequest {
    /// Entry hops carry no listener of their own; forwards bind on them.
    fn needs_port(&self) -> bool {
        self.role != ChainRole::Entry
    }
}

pub fn lowest_free_port(
    ranges: &[PortRange],
    taken: &HashSet<i64>,
    preferred: Option<i64>,
) -> Option<i64> {
    if let Some(port) = preferred {
        let in_range = u16::try_from(port)
            .map(|p| ranges.iter().any(|r| r.contains(p)))
            .unwrap_or(false);
        if in_range && !taken.contains(&port) {
            return Some(port);
        }
    }

    ranges
        .iter()
        .flat_map(|r| r.ports())
        .map(i64::from)
        .find(|p| !taken.contains(p))
}

fn node_ranges(node: &Node) -> Result<Vec<PortRange>> {
    parse_port_ranges(&node.port_range).map_err(|e| {
        AppError::Allocation(format!("node {} has an invalid port range: {}", node.id, e))
    })
}

/// Assigns a port to every hop of a tunnel.
///
/// Hops matching an existing binding on (role, ordinal, node) keep its port.
/// New hops take the lowest port not held on their node by another tunnel, a
/// forward, a share runtime, or a hop planned earlier in this call.
pub async fn plan_hops(
    db: &Database,
    tunnel_id: Option<i64>,
    existing: &[ChainTunnel],
    requests: &[HopRequest],
) -> Result<Vec<NewHop>> {
    let mut taken_by_node: HashMap<i64, HashSet<i64>> = HashMap::new();
    let mut claimed_existing: HashSet<i64> = HashSet::new();
    let mut planned = Vec::with_capacity(requests.len());

    for request in requests {
        let node = db
            .find_node(request.node_id)
            .await?
            .ok_or_else(|| AppError::validation(format!("node {} does not exist", request.node_id)))?;

        if !request.needs_port() {
            planned.push(new_hop(request, 0));
            continue;
        }

        if !taken_by_node.contains_key(&node.id) {
            let taken = db.taken_ports_on_node(node.id, tunnel_id, None).await?;
            taken_by_node.insert(node.id, taken.into_iter().collect());
        }

        let reusable = existing.iter().find(|hop| {
            hop.chain_type == request.role.as_i64()
                && hop.inx == request.inx
                && hop.node_id == request.node_id
                && hop.port > 0
                && !claimed_existing.contains(&hop.id)
                && request.port.map_or(true, |p| p == hop.port)
        });

        let taken = taken_by_node.entry(node.id).or_default();
        let port = match reusable {
            Some(hop) if !taken.contains(&hop.port) => {
                claimed_existing.insert(hop.id);
                hop.port
            }
            _ => {
                let ranges = node_ranges(&node)?;
                match request.port {
                    Some(port) => {
                        if lowest_free_port(&ranges, taken, Some(port)) != Some(port) {
                            return Err(AppError::Allocation(format!(
                                "port {} is unavailable on node {}",
                                port, node.id
                            )));
                        }
                        port
                    }
                    None => lowest_free_port(&ranges, taken, None).ok_or_else(|| {
                        AppError::Allocation(format!("no free port left on node {}", node.id))
                    })?,
                }
            }
        };

        taken.insert(port);
        planned.push(new_hop(request, port));
    }

    Ok(planned)
}

/// Picks the listen port for a forward on one entry node.
pub async fn allocate_forward_port(
    db: &Database,
    node: &Node,
    exclude_forward: Option<i64>,
    preferred: Option<i64>,
) -> Result<i64> {
    let ranges = node_ranges(node)?;
    let taken: HashSet<i64> = db
        .taken_ports_on_node(node.id, None, exclude_forward)
        .await?
        .into_iter()
        .collect();

    match preferred {
        Some(port) if lowest_free_port(&ranges, &taken, Some(port)) != Some(port) => Err(
            AppError::Allocation(format!("port {} is unavailable on node {}", port, node.id)),
        ),
        _ => lowest_free_port(&ranges, &taken, preferred).ok_or_else(|| {
            AppError::Allocation(format!("no free port left on node {}", node.id))
        }),
    }
}

fn new_hop(request: &HopRequest, port: i64) -> NewHop {
    NewHop {
        chain_type: request.role.as_i64(),
        inx: request.inx,
        node_id: request.node_id,
        port,
        protocol: request.protocol.clone(),
        strategy: request.strategy.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewNode, NewTunnel};

    async fn setup() -> Database {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    async fn node(db: &Database, name: &str, range: &str) -> i64 {
        db.create_node(&NewNode {
            name: name.to_string(),
            secret: format!("{}-secret", name),
            server_ip: "10.0.0.1".to_string(),
            api_port: 8088,
            port_range: range.to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
        .id
    }

    fn request(role: ChainRole, node_id: i64) -> HopRequest {
        HopRequest {
            role,
            inx: 0,
            node_id,
            protocol: "tls".to_string(),
            strategy: "round".to_string(),
            port: None,
        }
    }

    fn tunnel(name: &str) -> NewTunnel {
        NewTunnel {
            name: name.to_string(),
            tunnel_type: 2,
            traffic_ratio: 1.0,
            flow_factor: 1.0,
            flow_quota: 100,
            protocol: "tls".to_string(),
        }
    }

    #[test]
    fn test_lowest_free_port() {
        let ranges = parse_port_ranges("100-103").unwrap();
        let taken: HashSet<i64> = [100, 101].into_iter().collect();
        assert_eq!(lowest_free_port(&ranges, &taken, None), Some(102));
        assert_eq!(lowest_free_port(&ranges, &taken, Some(103)), Some(103));
        assert_eq!(lowest_free_port(&ranges, &taken, Some(100)), Some(102));
        assert_eq!(lowest_free_port(&ranges, &taken, Some(9999)), Some(102));

        let full: HashSet<i64> = (100..=103).collect();
        assert_eq!(lowest_free_port(&ranges, &full, None), None);
    }

    #[tokio::test]
    async fn test_plan_avoids_ports_of_other_tunnels() {
        let db = setup().await;
        let entry = node(&db, "entry", "30000-30010").await;
        let exit = node(&db, "exit", "32000-32010").await;

        let first = plan_hops(
            &db,
            None,
            &[],
            &[request(ChainRole::Entry, entry), request(ChainRole::Exit, exit)],
        )
        .await
        .unwrap();
        assert_eq!(first[0].port, 0);
        assert_eq!(first[1].port, 32000);
        db.insert_tunnel_with_hops(&tunnel("a"), &first).await.unwrap();

        let second = plan_hops(&db, None, &[], &[request(ChainRole::Exit, exit)])
            .await
            .unwrap();
        assert_eq!(second[0].port, 32001);
    }

    #[tokio::test]
    async fn test_replan_reuses_unchanged_hops() {
        let db = setup().await;
        let entry = node(&db, "entry", "30000-30010").await;
        let middle = node(&db, "middle", "31000-31010").await;
        let exit = node(&db, "exit", "32000-32010").await;
        let other_exit = node(&db, "exit-2", "33000-33010").await;

        let mut exit_request = request(ChainRole::Exit, exit);
        exit_request.port = Some(32005);
        let hops = plan_hops(
            &db,
            None,
            &[],
            &[
                request(ChainRole::Entry, entry),
                request(ChainRole::Middle, middle),
                exit_request,
            ],
        )
        .await
        .unwrap();
        let (created, existing) = db.insert_tunnel_with_hops(&tunnel("t"), &hops).await.unwrap();

        let replanned = plan_hops(
            &db,
            Some(created.id),
            &existing,
            &[
                request(ChainRole::Entry, entry),
                request(ChainRole::Middle, middle),
                request(ChainRole::Exit, exit),
                request(ChainRole::Exit, other_exit),
            ],
        )
        .await
        .unwrap();

        assert_eq!(replanned[1].port, 31000);
        assert_eq!(replanned[2].port, 32005);
        assert_eq!(replanned[3].port, 33000);
    }

    #[tokio::test]
    async fn test_exhausted_range_fails() {
        let db = setup().await;
        let exit = node(&db, "tiny", "40000-40000").await;
        let hops = plan_hops(&db, None, &[], &[request(ChainRole::Exit, exit)])
            .await
            .unwrap();
        db.insert_tunnel_with_hops(&tunnel("full"), &hops).await.unwrap();

        let err = plan_hops(&db, None, &[], &[request(ChainRole::Exit, exit)])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Allocation(_)));
    }

    #[tokio::test]
    async fn test_unknown_node_is_a_validation_error() {
        let db = setup().await;
        let err = plan_hops(&db, None, &[], &[request(ChainRole::Exit, 404)])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
