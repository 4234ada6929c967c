//! IP helpers used before anything derived from a client address leaves the process.

use axum::http::HeaderMap;

pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const LOOPBACK_FALLBACK: &str = "127.0.0.1";

/// Stand-in public address for loopback clients, so local runs exercise the geolocation path.
pub const LOCAL_STAND_IN_IP: &str = "141.20.2.3";

/// Drop the host part of an address: the last IPv4 octet, or everything after the
/// fourth IPv6 group.
pub fn truncate_ip(ip: &str) -> String {
    if ip.is_empty() {
        return String::new();
    }

    if ip.contains(':') {
        let groups: Vec<&str> = match ip.split_once("::") {
            Some((head, _)) => head.split(':').filter(|g| !g.is_empty()).collect(),
            None => ip.split(':').collect(),
        };
        let kept = &groups[..groups.len().min(4)];
        return format!("{}::", kept.join(":"));
    }

    let octets: Vec<&str> = ip.split('.').collect();
    let kept = &octets[..octets.len().min(3)];
    format!("{}.0", kept.join("."))
}

/// Client address precedence: X-Forwarded-For, then the socket peer, then loopback.
/// Only the client-most entry of a forwarded chain is kept.
pub fn extract_client_ip(headers: &HeaderMap, remote_addr: Option<&str>) -> String {
    let forwarded = headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or(remote_addr.filter(|v| !v.is_empty()))
        .unwrap_or(LOOPBACK_FALLBACK)
        .to_string()
}

pub fn sanitize_ip(ip: &str) -> String {
    if ip.contains("127.0.0.1") || ip == "::1" {
        return LOCAL_STAND_IN_IP.to_string();
    }
    ip.to_string()
}
