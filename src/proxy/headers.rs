//! Header hygiene for proxied requests and responses.

use axum::http::header::{CONNECTION, HOST, HeaderName, HeaderValue};
use axum::http::HeaderMap;

/// Headers meaningful only for a single transport connection.
///
/// `HeaderName` is always lowercase, so comparisons are case-insensitive.
pub const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_GATEWAY: &str = "x-gateway";

/// Value of the gateway identification header.
pub const GATEWAY_ID: &str = "hcaas-gateway";

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Header names listed in a `Connection` header; these are hop-by-hop too.
fn connection_listed(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Copy every end-to-end header from `src`, keeping repeated values.
///
/// When `skip_host` is set the `Host` header is dropped as well.
pub fn copy_end_to_end(src: &HeaderMap, skip_host: bool) -> HeaderMap {
    let listed = connection_listed(src);
    let mut dst = HeaderMap::with_capacity(src.len());

    for (name, value) in src {
        if is_hop_by_hop(name)
            || (skip_host && name == HOST)
            || listed.iter().any(|l| l == name.as_str())
        {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }

    dst
}

/// Client context carried to the upstream in forwarding headers.
#[derive(Debug, Clone)]
pub struct Forwarding<'a> {
    pub client_ip: &'a str,
    pub proto: &'a str,
    pub host: Option<&'a HeaderValue>,
}

impl<'a> Forwarding<'a> {
    /// Derive forwarding info from the inbound headers and resolved client ip.
    pub fn from_inbound(inbound: &'a HeaderMap, client_ip: &'a str) -> Self {
        let proto = inbound
            .get(X_FORWARDED_PROTO)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .unwrap_or("http");

        Self {
            client_ip,
            proto,
            host: inbound.get(HOST),
        }
    }

    /// Set the forwarding headers, replacing any inbound values.
    pub fn apply(&self, headers: &mut HeaderMap) {
        if let Ok(ip) = HeaderValue::from_str(self.client_ip) {
            headers.insert(X_FORWARDED_FOR, ip);
        }
        if let Ok(proto) = HeaderValue::from_str(self.proto) {
            headers.insert(X_FORWARDED_PROTO, proto);
        }
        match self.host {
            Some(host) => {
                headers.insert(X_FORWARDED_HOST, host.clone());
            }
            None => {
                headers.remove(X_FORWARDED_HOST);
            }
        }
        headers.insert(X_GATEWAY, HeaderValue::from_static(GATEWAY_ID));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_hop_by_hop_headers_are_dropped() {
        let src = headers(&[
            ("Connection", "keep-alive"),
            ("Keep-Alive", "timeout=5"),
            ("Proxy-Authorization", "Basic abc"),
            ("TE", "trailers"),
            ("Transfer-Encoding", "chunked"),
            ("Upgrade", "websocket"),
            ("Trailers", "x-checksum"),
            ("Proxy-Authenticate", "Basic"),
            ("Authorization", "Bearer t"),
            ("Content-Type", "application/json"),
        ]);

        let copied = copy_end_to_end(&src, false);
        assert_eq!(copied.len(), 2);
        assert!(copied.contains_key("authorization"));
        assert!(copied.contains_key("content-type"));
    }

    #[test]
    fn test_connection_listed_headers_are_dropped() {
        let src = headers(&[("Connection", "close, X-Debug-Token"), ("X-Debug-Token", "1"), ("Accept", "*/*")]);
        let copied = copy_end_to_end(&src, false);
        assert!(!copied.contains_key("x-debug-token"));
        assert!(copied.contains_key("accept"));
    }

    #[test]
    fn test_repeated_values_are_kept() {
        let src = headers(&[("Set-Cookie", "a=1"), ("Set-Cookie", "b=2")]);
        let copied = copy_end_to_end(&src, false);
        assert_eq!(copied.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn test_host_is_skipped_on_request() {
        let src = headers(&[("Host", "gw.example.com"), ("Accept", "*/*")]);
        assert!(!copy_end_to_end(&src, true).contains_key("host"));
        assert!(copy_end_to_end(&src, false).contains_key("host"));
    }

    #[test]
    fn test_forwarding_headers() {
        let inbound = headers(&[
            ("Host", "gw.example.com"),
            ("X-Forwarded-Proto", "https"),
            ("X-Forwarded-For", "203.0.113.9, 10.0.0.1"),
        ]);
        let mut outbound = copy_end_to_end(&inbound, true);

        Forwarding::from_inbound(&inbound, "203.0.113.9").apply(&mut outbound);

        assert_eq!(outbound[X_FORWARDED_FOR], "203.0.113.9");
        assert_eq!(outbound[X_FORWARDED_PROTO], "https");
        assert_eq!(outbound[X_FORWARDED_HOST], "gw.example.com");
        assert_eq!(outbound[X_GATEWAY], "hcaas-gateway");
    }

    #[test]
    fn test_forwarding_proto_defaults_to_http() {
        let inbound = HeaderMap::new();
        let mut outbound = HeaderMap::new();
        Forwarding::from_inbound(&inbound, "unknown").apply(&mut outbound);

        assert_eq!(outbound[X_FORWARDED_PROTO], "http");
        assert!(!outbound.contains_key(X_FORWARDED_HOST));
    }
}
