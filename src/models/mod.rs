mod health;

pub use health::{CheckResult, HealthResponse, ReadinessResponse};
