//! # WebSocket Connection Handler
//!
//! Upgrades `GET /api/ws` requests into session actors. Before the upgrade,
//! the request's `Origin` hostname is checked against the configured
//! allowlist; browsers always send the header, and a mismatch is answered
//! with a plain 403 instead of an upgrade. Credentials never ride on the
//! upgrade request — authentication happens in-band via the first message.

use crate::state::GatewayServices;
use crate::ws::session::SessionActor;

use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use tracing::{info, warn};

/// Hostnames always accepted regardless of configuration (local tooling).
const LOCAL_HOSTS: [&str; 2] = ["localhost", "127.0.0.1"];

/// Extract the hostname from an Origin value like `https://app.example.com:443`.
fn origin_host(origin: &str) -> Option<&str> {
    let rest = origin.split_once("://").map(|(_, rest)| rest).unwrap_or(origin);
    let host = rest.split('/').next()?.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Check an Origin header value against the allowlist.
///
/// Allowlist entries may be bare hostnames or full origins; both compare by
/// hostname. `localhost` and `127.0.0.1` are always accepted. A missing
/// header passes — non-browser clients (tests, native apps) send none, and
/// the ticket handshake still gates actual access.
pub fn origin_allowed(origin: Option<&str>, allowlist: &[String]) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    let Some(host) = origin_host(origin) else {
        return false;
    };

    if LOCAL_HOSTS.contains(&host) {
        return true;
    }
    allowlist
        .iter()
        .any(|entry| origin_host(entry).map(|allowed| allowed == host).unwrap_or(false))
}

/// `GET /api/ws` — upgrade and hand the socket to a fresh session actor.
pub async fn ws_upgrade(
    req: HttpRequest,
    stream: web::Payload,
    services: web::Data<GatewayServices>,
) -> ActixResult<HttpResponse> {
    let origin = req
        .headers()
        .get("Origin")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    if !origin_allowed(origin.as_deref(), &services.allowed_origins) {
        warn!(origin = origin.as_deref().unwrap_or(""), "rejected WebSocket upgrade from disallowed origin");
        return Ok(HttpResponse::Forbidden().finish());
    }

    info!(
        peer = req.connection_info().realip_remote_addr().unwrap_or("unknown"),
        "WebSocket upgrade accepted"
    );

    ws::start(SessionActor::new(services.session_deps()), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_origin_host_parsing() {
        assert_eq!(origin_host("https://app.example.com"), Some("app.example.com"));
        assert_eq!(origin_host("https://app.example.com:8443"), Some("app.example.com"));
        assert_eq!(origin_host("http://localhost:3000"), Some("localhost"));
        assert_eq!(origin_host("app.example.com"), Some("app.example.com"));
        assert_eq!(origin_host(""), None);
        assert_eq!(origin_host("https://"), None);
    }

    #[test]
    fn test_localhost_always_allowed() {
        assert!(origin_allowed(Some("http://localhost:5173"), &[]));
        assert!(origin_allowed(Some("http://127.0.0.1:8080"), &[]));
    }

    #[test]
    fn test_configured_origin_allowed() {
        let allow = allowlist(&["https://app.example.com"]);
        assert!(origin_allowed(Some("https://app.example.com"), &allow));
        // Port differences don't matter, hostname does
        assert!(origin_allowed(Some("https://app.example.com:444"), &allow));
        assert!(!origin_allowed(Some("https://evil.example.com"), &allow));
    }

    #[test]
    fn test_bare_hostname_entries_match() {
        let allow = allowlist(&["app.example.com"]);
        assert!(origin_allowed(Some("https://app.example.com"), &allow));
    }

    #[test]
    fn test_missing_origin_passes() {
        assert!(origin_allowed(None, &allowlist(&["https://app.example.com"])));
    }

    #[test]
    fn test_unparseable_origin_rejected() {
        assert!(!origin_allowed(Some("https://"), &allowlist(&["app.example.com"])));
    }
}
