//! Fuzz testing for request parsing on the hot path.
//!
//! Feeds arbitrary input to the parts of the gateway that read untrusted
//! request data before any upstream call:
//!
//! - `extract_bearer_token`: `Authorization` header parsing
//! - `RouteTable::resolve` / `RouteTable::target`: prefix routing and upstream
//!   URL construction
//! - `CidrRange::parse`: trusted proxy ranges
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_request_parsing -- -max_total_time=60
//! ```

#![no_main]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use arbitrary::Arbitrary;
use axum::http::Uri;
use libfuzzer_sys::fuzz_target;

use hcaas_gateway::auth::extract_bearer_token;
use hcaas_gateway::config::ServicesConfig;
use hcaas_gateway::middleware::ip::CidrRange;
use hcaas_gateway::proxy::RouteTable;

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    authorization: &'a str,
    path: &'a str,
    cidr: &'a str,
}

fuzz_target!(|input: Input<'_>| {
    if let Some(token) = extract_bearer_token(input.authorization) {
        assert!(!token.is_empty());
        assert!(input.authorization.ends_with(token));
    }

    let routes = RouteTable::default();
    let resolved = routes.resolve(input.path);
    if let Ok(uri) = input.path.parse::<Uri>() {
        if let Ok(target) = routes.target(&ServicesConfig::default(), &uri) {
            assert_eq!(Some(target.service), routes.resolve(uri.path()));
        }
    }
    if resolved.is_some() {
        assert!(routes.rules().iter().any(|r| input.path.starts_with(r.prefix.as_str())));
    }

    if let Some(range) = CidrRange::parse(input.cidr) {
        let _ = range.contains(&IpAddr::from(Ipv4Addr::LOCALHOST));
        let _ = range.contains(&IpAddr::from(Ipv6Addr::LOCALHOST));
    }
});
