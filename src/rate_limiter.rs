//! Per-client token bucket registry.
//!
//! One bucket is kept per client identifier, created lazily on the first
//! request from that client. Buckets refill continuously at `rps` tokens per
//! second up to `burst` tokens; each admitted request consumes one token.
//!
//! # Memory Bound
//!
//! Buckets that have not been touched for `idle_timeout` are removed by a
//! periodic sweep (see [`RateLimiterRegistry::spawn_sweeper`]). The sweep is
//! tied to a `CancellationToken`; once cancelled, no further sweep runs.
//!
//! # Locking
//!
//! All bucket state lives behind a single `RwLock`. Request-path checks take
//! the write lock briefly (bucket creation, refill, access-time update); the
//! sweep holds it for the duration of one scan.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::metrics;

/// Token bucket with continuous refill.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, capacity: f64, rate: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }

    fn try_acquire(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct ClientBucket {
    bucket: TokenBucket,
    last_access: Instant,
}

/// Outcome of one rate limit check, with the values used for response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Configured requests per second (`X-RateLimit-Limit`)
    pub limit: u32,
    /// Whole tokens left after this check (`X-RateLimit-Remaining`)
    pub remaining: u64,
    /// Seconds until one token is available, at least 1 when rejected
    pub retry_after: u64,
    /// Seconds until the bucket is full again (`X-RateLimit-Reset`)
    pub reset: u64,
}

/// Settings for a [`RateLimiterRegistry`].
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    pub rps: u32,
    pub burst: u32,
    pub idle_timeout: Duration,
}

/// Registry of per-client token buckets.
#[derive(Debug)]
pub struct RateLimiterRegistry {
    buckets: RwLock<HashMap<String, ClientBucket>>,
    limit: u32,
    rate: f64,
    capacity: f64,
    idle_timeout: Duration,
}

impl RateLimiterRegistry {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            limit: settings.rps,
            rate: f64::from(settings.rps.max(1)),
            capacity: f64::from(settings.burst.max(1)),
            idle_timeout: settings.idle_timeout,
        }
    }

    /// Consume one token for `client` if available.
    pub async fn allow(&self, client: &str) -> bool {
        self.check(client).await.allowed
    }

    /// Check `client` against its bucket at the current time.
    pub async fn check(&self, client: &str) -> RateLimitDecision {
        self.check_at(client, Instant::now()).await
    }

    /// Check `client` against its bucket as of `now`.
    pub async fn check_at(&self, client: &str, now: Instant) -> RateLimitDecision {
        let mut buckets = self.buckets.write().await;

        let entry = buckets
            .entry(client.to_string())
            .or_insert_with(|| ClientBucket {
                bucket: TokenBucket::full(self.capacity, now),
                last_access: now,
            });

        entry.last_access = now;
        entry.bucket.refill(self.capacity, self.rate, now);
        let allowed = entry.bucket.try_acquire();
        let tokens = entry.bucket.tokens;

        self.decision(allowed, tokens)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn decision(&self, allowed: bool, tokens: f64) -> RateLimitDecision {
        let tokens = tokens.max(0.0);
        let retry_after = if allowed {
            0
        } else {
            (((1.0 - tokens) / self.rate).ceil() as u64).max(1)
        };

        RateLimitDecision {
            allowed,
            limit: self.limit,
            remaining: tokens.floor() as u64,
            retry_after,
            reset: ((self.capacity - tokens) / self.rate).ceil() as u64,
        }
    }

    /// Remove buckets idle for longer than the idle timeout.
    ///
    /// Returns the number of removed buckets and publishes the remaining
    /// count to the active-clients gauge.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    pub async fn sweep_at(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();

        buckets.retain(|_, entry| now.saturating_duration_since(entry.last_access) <= self.idle_timeout);

        let removed = before - buckets.len();
        metrics::set_rate_limit_active(buckets.len());

        if removed > 0 {
            debug!(removed, active = buckets.len(), "Evicted idle rate limit buckets");
        } else {
            trace!(active = buckets.len(), "Rate limit sweep found no idle buckets");
        }

        removed
    }

    /// Number of clients currently holding a bucket.
    pub async fn active_clients(&self) -> usize {
        self.buckets.read().await.len()
    }

    /// Spawn the periodic idle-bucket sweep on `tracker`.
    ///
    /// The task exits as soon as `cancel` fires and never sweeps afterwards.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) {
        let registry = Arc::clone(self);

        tracker.spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased; // Check cancellation first

                    _ = cancel.cancelled() => {
                        debug!("Rate limit sweep received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        registry.sweep().await;
                    }
                }
            }

            debug!("Rate limit sweep task shutting down");
        });
    }
}
