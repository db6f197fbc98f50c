//! Captive-portal redirect middleware.
//!
//! While the hotspot is up, OS connectivity probes (and anything aimed
//! at the gateway itself) get a 302 to the provisioning page, which is
//! what makes phones pop their sign-in sheet. Real application routes
//! stay reachable through the allowlist.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use once_cell::sync::Lazy;

use super::AppState;
use crate::wifi::portal::GATEWAY_IP;

/// Connectivity-check hostnames of the major client OSes.
static PROBE_HOSTS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "captive.apple.com",
        "www.apple.com",
        "connectivitycheck.gstatic.com",
        "clients3.google.com",
        "www.msftconnecttest.com",
        "msftconnecttest.com",
        "detectportal.firefox.com",
    ]
    .into_iter()
    .collect()
});

/// Paths exempt from the redirect: the portal itself, the admin area,
/// static assets, the API and swagger.
const ALLOWED_PREFIXES: &[&str] = &[
    "/provision",
    "/Admin",
    "/api",
    "/lib",
    "/css",
    "/js",
    "/static",
    "/favicon",
    "/swagger",
];

pub async fn redirect_captive_clients(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if state.wifi.status().hotspot_active && should_redirect(&req) {
        // literal 302: some captive-portal minibrowsers mishandle 307
        return Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, HeaderValue::from_static("/provision"))
            .body(axum::body::Body::empty())
            .unwrap();
    }
    next.run(req).await
}

fn should_redirect(req: &Request) -> bool {
    let host = match req.headers().get(header::HOST).and_then(|h| h.to_str().ok()) {
        Some(h) => h.split(':').next().unwrap_or(""),
        None => return false,
    };
    if !PROBE_HOSTS.contains(host) && host != GATEWAY_IP {
        return false;
    }
    let path = req.uri().path();
    !ALLOWED_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(host: &str, path: &str) -> Request {
        Request::builder()
            .uri(path)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn os_probes_are_redirect_candidates() {
        assert!(should_redirect(&request(
            "connectivitycheck.gstatic.com",
            "/generate_204"
        )));
        assert!(should_redirect(&request("captive.apple.com", "/hotspot-detect.html")));
        assert!(should_redirect(&request("10.42.0.1", "/")));
        assert!(should_redirect(&request("10.42.0.1:5000", "/anything")));
    }

    #[test]
    fn allowlisted_paths_pass_through() {
        assert!(!should_redirect(&request("10.42.0.1", "/lib/bootstrap.css")));
        assert!(!should_redirect(&request("10.42.0.1", "/provision")));
        assert!(!should_redirect(&request(
            "10.42.0.1",
            "/api/Admin/Provision/networks"
        )));
        assert!(!should_redirect(&request("captive.apple.com", "/swagger/index.html")));
    }

    #[test]
    fn ordinary_hosts_are_never_touched() {
        assert!(!should_redirect(&request("example.com", "/")));
        assert!(!should_redirect(&request("ncb.example.net", "/GetNCBNetInfo")));
    }
}
