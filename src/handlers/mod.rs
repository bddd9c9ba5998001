mod health;
mod proxy;

pub use health::{READINESS_PROBE_TIMEOUT, health_check, metrics_handler, readiness_check};
pub use proxy::proxy_handler;
