//! Client identity resolution.
//!
//! The client identity is resolved once per request, near the top of the
//! pipeline, and stored as a [`ClientIp`] extension. Rate limiting, access
//! logging and the proxy's `X-Forwarded-For` all read that single value.
//!
//! # Resolution Order
//!
//! 1. First entry of `X-Forwarded-For`
//! 2. `X-Real-IP`
//! 3. Socket peer address (`ConnectInfo`)
//! 4. [`UNKNOWN_IP`]
//!
//! # IP Spoofing
//!
//! Forwarded headers are client-controlled. When `TRUSTED_PROXIES` is set,
//! they are honoured only if the socket peer lies inside one of the
//! configured CIDR ranges; otherwise the peer address is used directly.
//! With no trusted proxies configured every peer is trusted, which is only
//! appropriate when the gateway is not reachable from the internet.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{debug, warn};

/// Fallback identity when no client address can be determined.
///
/// All such requests share one rate limit bucket.
pub const UNKNOWN_IP: &str = "unknown";

/// Resolved client identity, stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl ClientIp {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Read the resolved client identity from a request.
pub trait ClientIpExt {
    /// The resolved identity, or [`UNKNOWN_IP`] if the stage did not run.
    fn client_ip(&self) -> &str;
}

impl<B> ClientIpExt for Request<B> {
    fn client_ip(&self) -> &str {
        self.extensions()
            .get::<ClientIp>()
            .map(ClientIp::as_str)
            .unwrap_or(UNKNOWN_IP)
    }
}

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse `"10.0.0.0/8"`, `"::1/128"` or a bare address (implicit host prefix).
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().ok().filter(|p| *p <= max_prefix)?,
            None => max_prefix,
        };

        Some(Self {
            network,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix_len)).unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix_len)).unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// Set of proxies whose forwarded headers are honoured.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    ranges: Vec<CidrRange>,
}

impl TrustedProxies {
    /// Parse CIDR strings. Invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        Self { ranges }
    }

    /// Whether forwarded headers from `peer` may be used.
    ///
    /// Always true when no ranges are configured. An unknown peer is never
    /// trusted once ranges are configured.
    pub fn trusts(&self, peer: Option<IpAddr>) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        peer.is_some_and(|ip| self.ranges.iter().any(|range| range.contains(&ip)))
    }
}

// =============================================================================
// Resolution
// =============================================================================

fn forwarded_ip<B>(req: &Request<B>) -> Option<&str> {
    if let Some(value) = req.headers().get("x-forwarded-for")
        && let Ok(value) = value.to_str()
        && let Some(first) = value.split(',').next().map(str::trim)
        && !first.is_empty()
    {
        return Some(first);
    }

    if let Some(value) = req.headers().get("x-real-ip")
        && let Ok(value) = value.to_str()
        && !value.trim().is_empty()
    {
        return Some(value.trim());
    }

    None
}

fn peer_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Resolve the client identity of `req`.
pub fn resolve_client_ip<B>(req: &Request<B>, trusted: &TrustedProxies) -> String {
    let peer = peer_ip(req);

    if let Some(forwarded) = forwarded_ip(req) {
        if trusted.trusts(peer) {
            return forwarded.to_string();
        }
        debug!(
            forwarded = %forwarded,
            peer = ?peer,
            "Ignoring forwarded client address from untrusted peer"
        );
    }

    match peer {
        Some(ip) => ip.to_string(),
        None => UNKNOWN_IP.to_string(),
    }
}

// =============================================================================
// Layer
// =============================================================================

/// Resolves the client identity and stores it as a [`ClientIp`] extension.
#[derive(Clone, Default)]
pub struct ClientIpLayer {
    trusted: Arc<TrustedProxies>,
}

impl ClientIpLayer {
    pub fn new(trusted_proxies: &[String]) -> Self {
        Self {
            trusted: Arc::new(TrustedProxies::new(trusted_proxies)),
        }
    }
}

impl<S> Layer<S> for ClientIpLayer {
    type Service = ClientIpService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ClientIpService {
            inner,
            trusted: self.trusted.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ClientIpService<S> {
    inner: S,
    trusted: Arc<TrustedProxies>,
}

impl<S> Service<Request<Body>> for ClientIpService<S>
where
    S: Service<Request<Body>, Response = Response<Body>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let ip = resolve_client_ip(&req, &self.trusted);
        req.extensions_mut().insert(ClientIp(ip));
        self.inner.call(req)
    }
}
