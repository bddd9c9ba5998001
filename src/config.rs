//! Gateway configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Upstream Services
//!
//! Each backend service is configured with three variables, e.g. for `auth`:
//!
//! - `AUTH_SERVICE_URL`: Base URL (default: `http://hcaas_auth:8081`)
//! - `AUTH_SERVICE_TIMEOUT_SECS`: Per-attempt timeout (default: 10)
//! - `AUTH_SERVICE_RETRIES`: Retries after the first attempt (default: 3)
//!
//! # Security Configuration
//!
//! - `JWT_SECRET`: HS256 shared secret, at least 32 characters
//! - `AUTH_PUBLIC_PATHS`: Comma-separated path prefixes that skip authentication
//! - `CORS_ALLOWED_ORIGINS`: Comma-separated list of allowed origins (default: `*`)
//! - `TRUSTED_PROXIES`: CIDR ranges whose forwarded headers are honoured
//!
//! # Rate Limiting
//!
//! - `RATE_LIMIT_RPS`: Token refill rate per client (default: 100)
//! - `RATE_LIMIT_BURST`: Bucket capacity per client (default: 200)

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use axum::http::Uri;

use crate::error::{GatewayError, GatewayResult};

/// Minimum accepted length of the JWT shared secret.
pub const MIN_JWT_SECRET_LEN: usize = 32;

/// Upper bound for per-service retry counts.
pub const MAX_SERVICE_RETRIES: u32 = 5;

/// Backend services the gateway routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceName {
    Auth,
    Url,
    Notification,
}

impl ServiceName {
    pub const ALL: [ServiceName; 3] = [ServiceName::Auth, ServiceName::Url, ServiceName::Notification];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceName::Auth => "auth",
            ServiceName::Url => "url",
            ServiceName::Notification => "notification",
        }
    }

    /// Prefix of this service's environment variables.
    fn env_prefix(self) -> &'static str {
        match self {
            ServiceName::Auth => "AUTH",
            ServiceName::Url => "URL",
            ServiceName::Notification => "NOTIFICATION",
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection settings for one upstream service.
///
/// Read-only after startup and shared by every request routed to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Base URL, e.g. `http://hcaas_auth:8081`. No trailing slash.
    pub base_url: String,

    /// Timeout applied to each individual attempt.
    pub timeout: Duration,

    /// Retries after the first attempt (total attempts = retries + 1).
    pub retries: u32,

    /// Path probed by the readiness check.
    pub health_path: String,
}

impl ServiceEndpoint {
    pub fn new(base_url: impl Into<String>, timeout: Duration, retries: u32) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            retries,
            health_path: "/healthz".to_string(),
        }
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    fn default_for(service: ServiceName) -> Self {
        let timeout = Duration::from_secs(10);
        match service {
            ServiceName::Auth => Self::new("http://hcaas_auth:8081", timeout, 3),
            ServiceName::Url => Self::new("http://hcaas_web:8080", timeout, 3).with_health_path("/health"),
            ServiceName::Notification => Self::new("http://hcaas_notification:8082", timeout, 3),
        }
    }
}

/// Endpoints for every routed service.
#[derive(Debug, Clone)]
pub struct ServicesConfig {
    pub auth: ServiceEndpoint,
    pub url: ServiceEndpoint,
    pub notification: ServiceEndpoint,
}

impl ServicesConfig {
    pub fn endpoint(&self, service: ServiceName) -> &ServiceEndpoint {
        match service {
            ServiceName::Auth => &self.auth,
            ServiceName::Url => &self.url,
            ServiceName::Notification => &self.notification,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ServiceName, &ServiceEndpoint)> {
        ServiceName::ALL.into_iter().map(move |s| (s, self.endpoint(s)))
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            auth: ServiceEndpoint::default_for(ServiceName::Auth),
            url: ServiceEndpoint::default_for(ServiceName::Url),
            notification: ServiceEndpoint::default_for(ServiceName::Notification),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'text' or 'json', got '{other}'")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => f.write_str("text"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Gateway configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Gateway will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Listen address (default: "0.0.0.0")
    pub host: String,

    /// Listen port (default: 8080)
    pub port: u16,

    /// Deadline for a whole inbound request, retries included (default: 60s)
    pub request_timeout: Duration,

    /// Maximum inbound body size buffered for proxying (default: 10MB)
    pub max_request_body_size: usize,

    /// Grace period for in-flight requests on shutdown (default: 15s)
    pub shutdown_timeout: Duration,

    // =========================================================================
    // Upstream Services
    // =========================================================================
    pub services: ServicesConfig,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// HS256 secret shared with the auth service
    pub jwt_secret: String,

    /// Path prefixes that bypass authentication
    pub public_paths: Vec<String>,

    /// Allowed CORS origins; the first entry is sent as `Access-Control-Allow-Origin`
    pub cors_allowed_origins: Vec<String>,

    /// Trusted proxy CIDR ranges for client IP resolution.
    ///
    /// Empty means forwarded headers are trusted from any peer.
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    pub rate_limit_enabled: bool,

    /// Tokens refilled per second per client (default: 100)
    pub rate_limit_rps: u32,

    /// Bucket capacity per client (default: 200)
    pub rate_limit_burst: u32,

    /// Interval between idle-bucket sweeps (default: 5 minutes)
    pub rate_limit_sweep_interval: Duration,

    /// Buckets idle longer than this are evicted (default: 10 minutes)
    pub rate_limit_idle_timeout: Duration,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log filter directive (e.g., "info", "hcaas_gateway=debug")
    pub log_level: String,

    pub log_format: LogFormat,

    /// Serve Prometheus metrics on `/metrics` (default: true)
    pub metrics_enabled: bool,

    /// Name reported by health endpoints and logs
    pub service_name: String,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if a value cannot be parsed or fails validation.
    pub fn from_env() -> GatewayResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("GATEWAY_PORT", 8080)?,
            request_timeout: Duration::from_secs(Self::parse_env("REQUEST_TIMEOUT_SECS", 60)?),
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 10 * 1024 * 1024)?, // 10MB
            shutdown_timeout: Duration::from_secs(Self::parse_env("SHUTDOWN_TIMEOUT_SECS", 15)?),

            // Services
            services: ServicesConfig {
                auth: Self::parse_service(ServiceName::Auth)?,
                url: Self::parse_service(ServiceName::Url)?,
                notification: Self::parse_service(ServiceName::Notification)?,
            },

            // Security
            jwt_secret: env::var("JWT_SECRET").unwrap_or_default(),
            public_paths: Self::parse_public_paths(),
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS", "*"),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES", ""),

            // Rate limiting
            rate_limit_enabled: Self::parse_env("RATE_LIMIT_ENABLED", true)?,
            rate_limit_rps: Self::parse_env("RATE_LIMIT_RPS", 100)?,
            rate_limit_burst: Self::parse_env("RATE_LIMIT_BURST", 200)?,
            rate_limit_sweep_interval: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_SWEEP_INTERVAL_SECS",
                300,
            )?),
            rate_limit_idle_timeout: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_IDLE_TIMEOUT_SECS",
                600,
            )?),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Text)?,
            metrics_enabled: Self::parse_env("METRICS_ENABLED", true)?,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "hcaas-gateway".to_string()),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` naming the offending variable.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(GatewayError::Config(format!(
                "JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} characters"
            )));
        }

        if self.request_timeout.is_zero() {
            return Err(GatewayError::Config(
                "REQUEST_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(GatewayError::Config(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        for (service, endpoint) in self.services.iter() {
            let prefix = service.env_prefix();
            validate_base_url(&endpoint.base_url)
                .map_err(|e| GatewayError::Config(format!("{prefix}_SERVICE_URL {e}")))?;

            if endpoint.timeout.is_zero() {
                return Err(GatewayError::Config(format!(
                    "{prefix}_SERVICE_TIMEOUT_SECS must be greater than 0"
                )));
            }

            if endpoint.retries > MAX_SERVICE_RETRIES {
                return Err(GatewayError::Config(format!(
                    "{prefix}_SERVICE_RETRIES must be between 0 and {MAX_SERVICE_RETRIES}"
                )));
            }
        }

        if self.rate_limit_enabled {
            if self.rate_limit_rps == 0 || self.rate_limit_burst == 0 {
                return Err(GatewayError::Config(
                    "RATE_LIMIT_RPS and RATE_LIMIT_BURST must be greater than 0".to_string(),
                ));
            }
            if self.rate_limit_sweep_interval.is_zero() || self.rate_limit_idle_timeout.is_zero() {
                return Err(GatewayError::Config(
                    "RATE_LIMIT_SWEEP_INTERVAL_SECS and RATE_LIMIT_IDLE_TIMEOUT_SECS must be greater than 0"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }


    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> GatewayResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| GatewayError::Config(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    fn parse_service(service: ServiceName) -> GatewayResult<ServiceEndpoint> {
        let default = ServiceEndpoint::default_for(service);
        let prefix = service.env_prefix();

        let base_url =
            env::var(format!("{prefix}_SERVICE_URL")).unwrap_or_else(|_| default.base_url.clone());
        let timeout = Self::parse_env(
            &format!("{prefix}_SERVICE_TIMEOUT_SECS"),
            default.timeout.as_secs(),
        )?;
        let retries = Self::parse_env(&format!("{prefix}_SERVICE_RETRIES"), default.retries)?;

        Ok(ServiceEndpoint::new(base_url, Duration::from_secs(timeout), retries)
            .with_health_path(default.health_path))
    }

    /// Parse a comma-separated list, dropping empty entries.
    fn parse_list(name: &str, default: &str) -> Vec<String> {
        split_list(&env::var(name).unwrap_or_else(|_| default.to_string()))
    }

    /// Parse public path prefixes. Entries that are not absolute paths are ignored.
    fn parse_public_paths() -> Vec<String> {
        match env::var("AUTH_PUBLIC_PATHS") {
            Ok(raw) => split_list(&raw)
                .into_iter()
                .filter(|p| p.starts_with('/'))
                .collect(),
            Err(_) => default_public_paths(),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn default_public_paths() -> Vec<String> {
    [
        "/auth/register",
        "/auth/login",
        "/auth/validate",
        "/healthz",
        "/health",
        "/readyz",
        "/metrics",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Check that a base URL is an absolute `http://` URI with a host.
fn validate_base_url(raw: &str) -> Result<(), String> {
    let uri: Uri = raw.parse().map_err(|e| format!("is not a valid URI: {e}"))?;
    if uri.scheme_str() != Some("http") {
        return Err(format!("must use the http scheme, got '{raw}'"));
    }
    if uri.host().is_none_or(str::is_empty) {
        return Err(format!("must include a host, got '{raw}'"));
    }
    Ok(())
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(60),
            max_request_body_size: 10 * 1024 * 1024, // 10MB
            shutdown_timeout: Duration::from_secs(15),
            // Services
            services: ServicesConfig::default(),
            // Security
            jwt_secret: "development-secret-change-me-in-production".to_string(),
            public_paths: default_public_paths(),
            cors_allowed_origins: vec!["*".to_string()],
            trusted_proxies: vec![], // Empty = trust all (dev mode)
            // Rate limiting
            rate_limit_enabled: true,
            rate_limit_rps: 100,
            rate_limit_burst: 200,
            rate_limit_sweep_interval: Duration::from_secs(300),
            rate_limit_idle_timeout: Duration::from_secs(600),
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_enabled: true,
            service_name: "hcaas-gateway".to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.port, 8080);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.rate_limit_rps, 100);
        assert_eq!(config.rate_limit_burst, 200);
        assert_eq!(config.rate_limit_sweep_interval, Duration::from_secs(300));
        assert_eq!(config.rate_limit_idle_timeout, Duration::from_secs(600));
        assert_eq!(config.services.auth.base_url, "http://hcaas_auth:8081");
        assert_eq!(config.services.url.health_path, "/health");
        assert_eq!(config.services.notification.retries, 3);
        assert!(config.public_paths.contains(&"/auth/login".to_string()));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 9000,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_validate_short_secret() {
        let config = Config {
            jwt_secret: "short".to_string(),
            ..Config::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));
    }

    #[test]
    fn test_validate_service_url_scheme() {
        let mut config = Config::default();
        config.services.url.base_url = "ftp://files:21".to_string();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("URL_SERVICE_URL"));
    }

    #[test]
    fn test_validate_service_url_without_host() {
        let mut config = Config::default();
        config.services.auth.base_url = "/relative/only".to_string();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_retry_bound() {
        let mut config = Config::default();
        config.services.notification.retries = MAX_SERVICE_RETRIES + 1;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("NOTIFICATION_SERVICE_RETRIES"));
    }

    #[test]
    fn test_validate_rate_limit_zero_only_when_enabled() {
        let config = Config {
            rate_limit_burst: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            rate_limit_enabled: false,
            rate_limit_burst: 0,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_service_endpoint_trims_trailing_slash() {
        let endpoint = ServiceEndpoint::new("http://svc:80/", Duration::from_secs(1), 0);
        assert_eq!(endpoint.base_url, "http://svc:80");
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_split_list_drops_empty_entries() {
        assert_eq!(split_list(" a, ,b ,"), vec!["a".to_string(), "b".to_string()]);
        assert!(split_list("").is_empty());
    }
}
