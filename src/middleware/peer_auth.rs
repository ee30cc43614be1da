// src/middleware/peer_auth.rs
//! Authentication of federation partners.
//!
//! The bearer token selects the share; the share's allow-list then has to
//! admit the caller's address. The resolved share is handed to the handler as
//! a request extension.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::error::AppError;
use crate::utils::validation::{normalize_ip, AllowList};
use crate::AppState;

/// The direct peer, unless it is a trusted proxy; then the left-most
/// `X-Forwarded-For` entry.
pub fn resolve_client_ip(
    peer: Option<IpAddr>,
    headers: &HeaderMap,
    trusted_proxies: &[IpNet],
) -> Option<IpAddr> {
    let peer = normalize_ip(peer?);
    if !trusted_proxies.iter().any(|net| net.contains(&peer)) {
        return Some(peer);
    }

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse::<IpAddr>().ok())
        .map(normalize_ip);
    Some(forwarded.unwrap_or(peer))
}

pub async fn require_peer_share(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Unauthorized("missing share token".to_string()))?;

    let share = state
        .db
        .find_share_by_token(token)
        .await?
        .ok_or_else(|| AppError::Unauthorized("invalid share token".to_string()))?;

    let allow_list = AllowList::parse(&share.allowed_ips).map_err(|e| {
        AppError::Internal(format!("share {} has a corrupt allow-list: {}", share.id, e))
    })?;
    if !allow_list.is_empty() {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let client = resolve_client_ip(peer, request.headers(), &state.config.trusted_proxies);
        let allowed = client.map(|ip| allow_list.allows(ip)).unwrap_or(false);
        if !allowed {
            tracing::warn!(
                share_id = share.id,
                client = ?client,
                "Federation request from address outside the allow-list"
            );
            return Err(AppError::Forbidden("IP not allowed".to_string()));
        }
    }

    request.extensions_mut().insert(share);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn proxies() -> Vec<IpNet> {
        vec!["10.0.0.0/8".parse().unwrap()]
    }

    #[test]
    fn test_untrusted_peer_ignores_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.11"));
        let ip = resolve_client_ip(Some("198.51.100.7".parse().unwrap()), &headers, &proxies());
        assert_eq!(ip, Some("198.51.100.7".parse().unwrap()));
    }

    #[test]
    fn test_trusted_proxy_uses_left_most_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.11, 10.0.0.9"),
        );
        let ip = resolve_client_ip(Some("10.0.0.2".parse().unwrap()), &headers, &proxies());
        assert_eq!(ip, Some("203.0.113.11".parse().unwrap()));
    }

    #[test]
    fn test_mapped_peer_is_normalized() {
        let ip = resolve_client_ip(
            Some("::ffff:203.0.113.11".parse().unwrap()),
            &HeaderMap::new(),
            &proxies(),
        );
        assert_eq!(ip, Some("203.0.113.11".parse().unwrap()));
    }

    #[test]
    fn test_allow_list_cidr_boundary() {
        let list = AllowList::parse("203.0.113.0/24").unwrap();
        assert!(list.allows("203.0.113.11".parse().unwrap()));

        let list = AllowList::parse("203.0.113.10").unwrap();
        assert!(!list.allows("203.0.113.99".parse().unwrap()));
    }
}
