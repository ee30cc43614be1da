// src/services/agent_config.rs
//! Translates topology rows into agent service and chain definitions.

use crate::models::{ChainRole, ChainTunnel, Forward, Node, TunnelType};
use crate::services::dispatcher::{
    ChainNodeSpec, ChainSpec, ForwarderSpec, HopSpec, SelectorSpec, ServiceName, ServiceSpec,
    TargetSpec, TypeSpec,
};

pub fn chain_name(tunnel_id: i64) -> String {
    format!("chains_{}", tunnel_id)
}

pub fn tunnel_service_name(tunnel_id: i64) -> String {
    format!("{}_tls", tunnel_id)
}

/// What a reported service name claims to belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServiceOwner {
    /// `{tunnel}_tls` relay listener.
    Tunnel(i64),
    /// `{forward}_{user}_{grant}[_tcp|_udp]` listener; `base` drops the suffix.
    Forward { forward_id: i64, base: String },
    Unknown,
}

pub(crate) fn classify_service(name: &str) -> ServiceOwner {
    if let Some(id) = name.strip_suffix("_tls").and_then(|id| id.parse::<i64>().ok()) {
        return ServiceOwner::Tunnel(id);
    }

    let parts: Vec<&str> = name.split('_').collect();
    if let Some(base) = name.strip_suffix("_tcp").or_else(|| name.strip_suffix("_udp")) {
        if parts.len() >= 4 {
            if let Ok(parsed) = base.parse::<ServiceName>() {
                return ServiceOwner::Forward {
                    forward_id: parsed.forward_id,
                    base: base.to_string(),
                };
            }
        }
    }
    if parts.len() >= 3 {
        if let Ok(parsed) = name.parse::<ServiceName>() {
            return ServiceOwner::Forward {
                forward_id: parsed.forward_id,
                base: parsed.to_string(),
            };
        }
    }
    ServiceOwner::Unknown
}

/// Trailing `_{tunnel}` of a chain name.
pub(crate) fn chain_tunnel_id(name: &str) -> Option<i64> {
    name.rsplit_once('_').and_then(|(_, id)| id.parse().ok())
}

fn host_port(host: &str, port: i64) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// The `_tcp` and `_udp` listeners of a forward on one entry node.
pub fn forward_services(
    name: &ServiceName,
    forward: &Forward,
    targets: &[String],
    node: &Node,
    port: i64,
    tunnel_type: TunnelType,
) -> Vec<ServiceSpec> {
    let chain = match tunnel_type {
        TunnelType::Chained => Some(chain_name(forward.tunnel_id)),
        TunnelType::Direct => None,
    };
    let forwarder = ForwarderSpec {
        nodes: targets
            .iter()
            .enumerate()
            .map(|(i, addr)| TargetSpec {
                name: format!("node_{}", i + 1),
                addr: addr.clone(),
            })
            .collect(),
        selector: SelectorSpec::new(&forward.strategy),
    };

    [("tcp", &node.tcp_listen_addr), ("udp", &node.udp_listen_addr)]
        .into_iter()
        .map(|(proto, listen)| ServiceSpec {
            name: format!("{}_{}", name, proto),
            addr: host_port(listen, port),
            handler: TypeSpec {
                kind: proto.to_string(),
                chain: chain.clone(),
            },
            listener: TypeSpec {
                kind: proto.to_string(),
                chain: None,
            },
            forwarder: Some(forwarder.clone()),
            limiter: None,
        })
        .collect()
}

/// Relay listener a middle or exit hop exposes to the previous group.
pub fn tunnel_service(tunnel_id: i64, hop: &ChainTunnel, node: &Node) -> ServiceSpec {
    let chain = (ChainRole::from_i64(hop.chain_type) == Some(ChainRole::Middle))
        .then(|| chain_name(tunnel_id));
    ServiceSpec {
        name: tunnel_service_name(tunnel_id),
        addr: host_port(&node.tcp_listen_addr, hop.port),
        handler: TypeSpec {
            kind: "relay".to_string(),
            chain,
        },
        listener: TypeSpec {
            kind: hop.protocol.clone(),
            chain: None,
        },
        forwarder: None,
        limiter: None,
    }
}

/// Chain from one hop group to the next one; `next` carries each hop with its node.
pub fn tunnel_chain(tunnel_id: i64, next: &[(&ChainTunnel, &Node)]) -> ChainSpec {
    let strategy = next
        .first()
        .map(|(hop, _)| hop.strategy.as_str())
        .unwrap_or("round");
    ChainSpec {
        name: chain_name(tunnel_id),
        hops: vec![HopSpec {
            name: format!("hop_{}", tunnel_id),
            selector: SelectorSpec::new(strategy),
            nodes: next
                .iter()
                .map(|(hop, node)| ChainNodeSpec {
                    name: format!("node_{}", node.id),
                    addr: host_port(&node.server_ip, hop.port),
                    connector: TypeSpec {
                        kind: "relay".to_string(),
                        chain: None,
                    },
                    dialer: TypeSpec {
                        kind: hop.protocol.clone(),
                        chain: None,
                    },
                })
                .collect(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64, ip: &str) -> Node {
        Node {
            id,
            name: format!("n{}", id),
            secret: String::new(),
            server_ip: ip.to_string(),
            api_port: 8088,
            port_range: "1000-2000".to_string(),
            tcp_listen_addr: "[::]".to_string(),
            udp_listen_addr: "[::]".to_string(),
            interface_name: String::new(),
            http: 0,
            tls: 1,
            socks: 0,
            status: 1,
            is_remote: 0,
            remote_url: String::new(),
            remote_token: String::new(),
            remote_config: String::new(),
            last_seen: 0,
            created_time: 0,
            updated_time: 0,
        }
    }

    fn hop(chain_type: i64, node_id: i64, port: i64) -> ChainTunnel {
        ChainTunnel {
            id: 0,
            tunnel_id: 5,
            chain_type,
            inx: 0,
            node_id,
            port,
            protocol: "tls".to_string(),
            strategy: "round".to_string(),
        }
    }

    #[test]
    fn test_forward_services_use_chain_only_when_chained() {
        let forward = Forward {
            id: 1,
            user_id: 2,
            user_name: "u".to_string(),
            name: "f".to_string(),
            tunnel_id: 5,
            remote_addr: "1.1.1.1:80".to_string(),
            strategy: "fifo".to_string(),
            in_flow: 0,
            out_flow: 0,
            status: 1,
            created_time: 0,
            updated_time: 0,
        };
        let name = ServiceName::new(1, 2, 3);
        let targets = vec!["1.1.1.1:80".to_string()];

        let chained = forward_services(&name, &forward, &targets, &node(1, "10.0.0.1"), 1500, TunnelType::Chained);
        assert_eq!(chained.len(), 2);
        assert_eq!(chained[0].name, "1_2_3_tcp");
        assert_eq!(chained[0].addr, "[::]:1500");
        assert_eq!(chained[0].handler.chain.as_deref(), Some("chains_5"));
        assert_eq!(chained[1].listener.kind, "udp");

        let direct = forward_services(&name, &forward, &targets, &node(1, "10.0.0.1"), 1500, TunnelType::Direct);
        assert!(direct[0].handler.chain.is_none());
    }

    #[test]
    fn test_chain_points_at_next_group() {
        let exit = hop(3, 9, 1200);
        let exit_node = node(9, "10.0.0.9");
        let chain = tunnel_chain(5, &[(&exit, &exit_node)]);
        assert_eq!(chain.name, "chains_5");
        assert_eq!(chain.hops[0].name, "hop_5");
        assert_eq!(chain.hops[0].nodes[0].addr, "10.0.0.9:1200");
        assert_eq!(chain.hops[0].nodes[0].dialer.kind, "tls");
    }

    #[test]
    fn test_middle_service_continues_the_chain() {
        let middle = tunnel_service(5, &hop(2, 4, 1100), &node(4, "10.0.0.4"));
        assert_eq!(middle.name, "5_tls");
        assert_eq!(middle.handler.chain.as_deref(), Some("chains_5"));

        let exit = tunnel_service(5, &hop(3, 9, 1200), &node(9, "10.0.0.9"));
        assert!(exit.handler.chain.is_none());
    }
}
