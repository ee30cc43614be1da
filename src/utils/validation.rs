// src/utils/validation.rs
use ipnet::IpNet;
use regex::Regex;
use std::net::IpAddr;
use std::str::FromStr;

const MAX_NAME_LENGTH: usize = 100;
const MAX_REMOTE_TARGETS: usize = 32;

lazy_static::lazy_static! {
    static ref NAME_REGEX: Regex = Regex::new(r"^[^\x00-\x1f/\\]+$").unwrap();
    static ref TARGET_REGEX: Regex =
        Regex::new(r"^(\[[0-9A-Fa-f:.]+\]|[A-Za-z0-9.\-]+):([0-9]{1,5})$").unwrap();
}

/// Validates display names for tunnels, forwards, shares and groups
pub fn validate_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("Name must not be empty".to_string());
    }
    if trimmed.chars().count() > MAX_NAME_LENGTH {
        return Err(format!("Name too long (maximum {} characters)", MAX_NAME_LENGTH));
    }
    if !NAME_REGEX.is_match(trimmed) {
        return Err("Name contains forbidden characters".to_string());
    }
    Ok(())
}

/// Validates a forward target list: `host:port` entries separated by commas or newlines
pub fn validate_remote_addr(remote_addr: &str) -> Result<Vec<String>, String> {
    let targets: Vec<String> = remote_addr
        .split([',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if targets.is_empty() {
        return Err("Target address must not be empty".to_string());
    }
    if targets.len() > MAX_REMOTE_TARGETS {
        return Err(format!("At most {} target addresses are allowed", MAX_REMOTE_TARGETS));
    }

    for target in &targets {
        let caps = TARGET_REGEX
            .captures(target)
            .ok_or_else(|| format!("Invalid target address: {}", target))?;
        let port: u32 = caps[2].parse().unwrap_or(0);
        if port == 0 || port > u16::MAX as u32 {
            return Err(format!("Invalid target port: {}", target));
        }
    }

    Ok(targets)
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, String> {
        if start == 0 || start > end {
            return Err(format!("Invalid port range {}-{}", start, end));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((start, end)) = s.split_once('-') {
            let start = start
                .trim()
                .parse::<u16>()
                .map_err(|e| format!("Invalid start port: {}", e))?;
            let end = end
                .trim()
                .parse::<u16>()
                .map_err(|e| format!("Invalid end port: {}", e))?;
            PortRange::new(start, end)
        } else {
            let port = s
                .trim()
                .parse::<u16>()
                .map_err(|e| format!("Invalid port: {}", e))?;
            PortRange::new(port, port)
        }
    }
}

/// Parses a node's advertised range list, e.g. `"20000-20010,21000"`
pub fn parse_port_ranges(raw: &str) -> Result<Vec<PortRange>, String> {
    let ranges = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PortRange::from_str)
        .collect::<Result<Vec<_>, _>>()?;
    if ranges.is_empty() {
        return Err("Port range must not be empty".to_string());
    }
    Ok(ranges)
}

/// Folds an IPv4-mapped IPv6 address into its IPv4 form
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// A share's IP allow-list. Exact addresses are stored as host networks.
/// An empty list admits every address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllowList {
    networks: Vec<IpNet>,
}

impl AllowList {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut networks = Vec::new();
        for entry in raw
            .split([',', '\n', ';', ' '])
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let net = if entry.contains('/') {
                entry
                    .parse::<IpNet>()
                    .map_err(|_| format!("Invalid allowed IP or CIDR: {}", entry))?
            } else {
                let ip = entry
                    .parse::<IpAddr>()
                    .map_err(|_| format!("Invalid allowed IP or CIDR: {}", entry))?;
                IpNet::from(normalize_ip(ip))
            };
            networks.push(net);
        }
        Ok(Self { networks })
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        if self.networks.is_empty() {
            return true;
        }
        let ip = normalize_ip(ip);
        self.networks.iter().any(|net| net.contains(&ip))
    }

    /// Canonical comma-joined form persisted on the share row
    pub fn to_storage(&self) -> String {
        self.networks
            .iter()
            .map(|n| {
                if n.prefix_len() == n.max_prefix_len() {
                    n.addr().to_string()
                } else {
                    n.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(validate_name("edge-hk-01").is_ok());
        assert!(validate_name("   ").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(&"x".repeat(101)).is_err());
    }

    #[test]
    fn test_remote_addr_validation() {
        assert_eq!(
            validate_remote_addr("1.1.1.1:443, example.com:80").unwrap(),
            vec!["1.1.1.1:443".to_string(), "example.com:80".to_string()]
        );
        assert!(validate_remote_addr("[2001:db8::1]:53").is_ok());
        assert!(validate_remote_addr("1.1.1.1").is_err());
        assert!(validate_remote_addr("1.1.1.1:70000").is_err());
        assert!(validate_remote_addr("").is_err());
    }

    #[test]
    fn test_port_ranges() {
        let ranges = parse_port_ranges("20000-20010, 21000").unwrap();
        assert_eq!(ranges.len(), 2);
        assert!(ranges[0].contains(20005));
        assert!(ranges[1].contains(21000));
        assert!(parse_port_ranges("30-20").is_err());
        assert!(parse_port_ranges("").is_err());
    }

    #[test]
    fn test_allow_list_cidr_and_exact() {
        let list = AllowList::parse("203.0.113.0/24").unwrap();
        assert!(list.allows("203.0.113.11".parse().unwrap()));
        assert!(!list.allows("198.51.100.1".parse().unwrap()));

        let exact = AllowList::parse("203.0.113.10").unwrap();
        assert!(exact.allows("203.0.113.10".parse().unwrap()));
        assert!(!exact.allows("203.0.113.99".parse().unwrap()));
    }

    #[test]
    fn test_allow_list_normalizes_mapped_addresses() {
        let list = AllowList::parse("198.51.100.20").unwrap();
        assert!(list.allows("::ffff:198.51.100.20".parse().unwrap()));
    }

    #[test]
    fn test_allow_list_rejects_garbage() {
        let err = AllowList::parse("bad-ip-entry").unwrap_err();
        assert!(err.contains("Invalid allowed IP or CIDR"));
        assert!(AllowList::parse("10.0.0.0/40").is_err());
    }

    #[test]
    fn test_empty_allow_list_admits_all() {
        let list = AllowList::parse("").unwrap();
        assert!(list.is_empty());
        assert!(list.allows("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn test_allow_list_storage_form() {
        let list = AllowList::parse("203.0.113.10, 10.0.0.0/8").unwrap();
        assert_eq!(list.to_storage(), "203.0.113.10,10.0.0.0/8");
    }
}
