//! Path prefix routing to upstream services.
//!
//! Rules are checked in declaration order and the first matching prefix
//! wins; the table is never sorted. The upstream URL is the service base URL
//! followed by the unchanged inbound path and query.

use axum::http::Uri;

use crate::config::{ServiceName, ServicesConfig};
use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub prefix: String,
    pub service: ServiceName,
}

impl RouteRule {
    pub fn new(prefix: impl Into<String>, service: ServiceName) -> Self {
        Self {
            prefix: prefix.into(),
            service,
        }
    }
}

/// Resolved destination of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub service: ServiceName,
    pub url: Uri,
}

/// Ordered prefix rules. Immutable after startup.
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// Service owning `path`, by first matching prefix.
    pub fn resolve(&self, path: &str) -> Option<ServiceName> {
        self.rules
            .iter()
            .find(|rule| path.starts_with(rule.prefix.as_str()))
            .map(|rule| rule.service)
    }

    /// Resolve `uri` to a service and its full upstream URL.
    ///
    /// # Errors
    ///
    /// `RouteNotFound` when no prefix matches; `InternalProxyError` when the
    /// joined URL is not a valid URI.
    pub fn target(&self, services: &ServicesConfig, uri: &Uri) -> GatewayResult<RouteTarget> {
        let path = uri.path();
        let service = self
            .resolve(path)
            .ok_or_else(|| GatewayError::RouteNotFound(path.to_string()))?;

        let path_and_query = uri.path_and_query().map_or(path, |pq| pq.as_str());
        let base = &services.endpoint(service).base_url;

        let url = format!("{base}{path_and_query}")
            .parse::<Uri>()
            .map_err(|e| GatewayError::InternalProxyError(format!("invalid upstream URL: {e}")))?;

        Ok(RouteTarget { service, url })
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(vec![
            RouteRule::new("/auth/", ServiceName::Auth),
            RouteRule::new("/me", ServiceName::Auth),
            RouteRule::new("/urls", ServiceName::Url),
            RouteRule::new("/notifications", ServiceName::Notification),
        ])
    }
}
