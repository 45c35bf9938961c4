//! Fixed-window request counters keyed by client identifier.
//!
//! Counters live in process memory. Running several instances behind a load
//! balancer gives each its own budget; a shared backend would have to provide
//! the same `check` contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, warn};

use crate::clock::Clock;

const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);

/// How many requests one identifier may make per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Namespace for the counters, so separate policies never share a bucket.
    pub name: &'static str,
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    /// Secret creation: 10 requests per 15 minutes.
    pub const fn create() -> Self {
        Self {
            name: "create",
            max_requests: 10,
            window: FIFTEEN_MINUTES,
        }
    }

    /// Status checks and reveals: 50 requests per 15 minutes.
    pub const fn access() -> Self {
        Self {
            name: "access",
            max_requests: 50,
            window: FIFTEEN_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Counter {
    count: u32,
    reset_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RateLimiter {
    counters: Arc<Mutex<HashMap<String, Counter>>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Count one request from `identifier` against `policy`.
    ///
    /// The first request of a window sets `reset_at = now + window`; a request
    /// that sees `reset_at < now` opens a new window.
    pub async fn check(&self, identifier: &str, policy: &RateLimitPolicy) -> RateLimitDecision {
        let now = self.clock.now();
        let window = chrono::Duration::milliseconds(policy.window.as_millis() as i64);
        let bucket = format!("{}:{}", policy.name, identifier);

        let mut counters = self.counters.lock().await;
        let counter = counters.entry(bucket).or_insert_with(|| Counter {
            count: 0,
            reset_at: now + window,
        });
        if counter.reset_at < now {
            counter.count = 0;
            counter.reset_at = now + window;
        }
        counter.count = counter.count.saturating_add(1);

        let decision = RateLimitDecision {
            allowed: counter.count <= policy.max_requests,
            remaining: policy.max_requests.saturating_sub(counter.count),
            reset_at: counter.reset_at,
        };

        if decision.allowed {
            debug!(
                identifier = %identifier,
                policy = policy.name,
                remaining = decision.remaining,
                "rate limit check passed"
            );
        } else {
            warn!(
                identifier = %identifier,
                policy = policy.name,
                reset_at = %decision.reset_at,
                "rate limit exceeded"
            );
        }
        decision
    }

    /// Drop counters whose window has ended. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut counters = self.counters.lock().await;
        let before = counters.len();
        counters.retain(|_, c| c.reset_at >= now);
        before - counters.len()
    }

    /// Spawn a background Tokio task that calls `sweep()` every `interval`.
    pub fn spawn_sweep(self, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                let removed = self.sweep().await;
                if removed > 0 {
                    debug!(removed, "swept stale rate-limit counters");
                }
            }
        });
    }
}
