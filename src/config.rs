// src/config.rs
use ipnet::IpNet;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{AppError, Result};

const DEFAULT_TRUSTED_PROXIES: &str =
    "127.0.0.0/8,::1/128,10.0.0.0/8,172.16.0.0/12,192.168.0.0/16,fc00::/7";

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    pub node_command_timeout: Duration,
    pub federation_timeout: Duration,
    pub trusted_proxies: Vec<IpNet>,
    pub enable_background_jobs: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let jwt_secret = std::env::var("JWT_SECRET")
            .map_err(|_| AppError::Config("JWT_SECRET environment variable must be set".into()))?;
        if jwt_secret.len() < 32 {
            return Err(AppError::Config(
                "JWT_SECRET must be at least 32 characters long".into(),
            ));
        }

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://meshgate.db?mode=rwc".to_string()),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_env("PORT", "6365")?,
            jwt_secret,
            node_command_timeout: Duration::from_secs(parse_env(
                "NODE_COMMAND_TIMEOUT_SECS",
                "5",
            )?),
            federation_timeout: Duration::from_secs(parse_env("FEDERATION_TIMEOUT_SECS", "5")?),
            trusted_proxies: parse_trusted_proxies(
                &std::env::var("TRUSTED_PROXIES")
                    .unwrap_or_else(|_| DEFAULT_TRUSTED_PROXIES.to_string()),
            )?,
            enable_background_jobs: std::env::var("ENABLE_BACKGROUND_JOBS")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        })
    }

    /// Settings suitable for tests and embedded use.
    pub fn for_tests(jwt_secret: &str) -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            jwt_secret: jwt_secret.to_string(),
            node_command_timeout: Duration::from_secs(2),
            federation_timeout: Duration::from_secs(2),
            trusted_proxies: parse_trusted_proxies(DEFAULT_TRUSTED_PROXIES).unwrap_or_default(),
            enable_background_jobs: false,
        }
    }

    pub fn server_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid server address: {}", e)))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|e| AppError::Config(format!("{}: {}", key, e)))
}

pub fn parse_trusted_proxies(raw: &str) -> Result<Vec<IpNet>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpNet>()
                .map_err(|e| AppError::Config(format!("TRUSTED_PROXIES entry {}: {}", s, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_trusted_proxies_cover_private_ranges() {
        let nets = parse_trusted_proxies(DEFAULT_TRUSTED_PROXIES).unwrap();
        let ip: std::net::IpAddr = "172.20.0.3".parse().unwrap();
        assert!(nets.iter().any(|n| n.contains(&ip)));
    }

    #[test]
    fn test_rejects_bad_proxy_entry() {
        assert!(parse_trusted_proxies("10.0.0.0/8,not-a-net").is_err());
    }
}
