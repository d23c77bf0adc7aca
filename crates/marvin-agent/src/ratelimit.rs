//! Admission control on user / channel / provider token buckets.
//!
//! Buckets are lazily constructed per `(scope, key)` and rebuilt on the next
//! call after their configured shape changes. Refill is whole-bucket: after
//! one full period the bucket returns to capacity. Rate-limit rejections
//! short-circuit the turn — nothing here ever blocks.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use marvin_core::config::{BucketConfig, RateLimitConfig};

/// Result of an admission check.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    /// Time until the next refill when denied.
    pub retry_after: Option<Duration>,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }

    fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after),
        }
    }
}

struct Bucket {
    /// Shape the bucket was built with; a config change rebuilds the entry.
    shape: BucketConfig,
    tokens_remaining: u32,
    last_refill: Instant,
}

impl Bucket {
    fn new(shape: BucketConfig, now: Instant) -> Self {
        Self {
            shape,
            tokens_remaining: shape.capacity,
            last_refill: now,
        }
    }

    fn try_consume(&mut self, now: Instant) -> Decision {
        let period = Duration::from_secs(self.shape.period_secs);
        let elapsed = now.duration_since(self.last_refill);
        if elapsed >= period {
            self.tokens_remaining = self.shape.capacity;
            self.last_refill = now;
        }
        if self.tokens_remaining > 0 {
            self.tokens_remaining -= 1;
            Decision::allow()
        } else {
            Decision::deny(period.saturating_sub(now.duration_since(self.last_refill)))
        }
    }
}

/// Token-bucket gate shared across turns.
///
/// Per-key updates go through the dashmap entry lock, so concurrent turns
/// see a consistent bucket state.
pub struct RateLimitGate {
    config: std::sync::RwLock<RateLimitConfig>,
    buckets: DashMap<String, Bucket>,
}

impl RateLimitGate {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: std::sync::RwLock::new(config),
            buckets: DashMap::new(),
        }
    }

    /// Swap in a new config. Existing buckets rebuild lazily on next use.
    pub fn set_config(&self, config: RateLimitConfig) {
        *self.config.write().unwrap() = config;
    }

    /// Global per-user admission.
    pub fn try_consume(&self) -> Decision {
        let shape = self.config.read().unwrap().user;
        self.consume_at("user:global".to_string(), shape, Instant::now())
    }

    /// Per-channel admission.
    pub fn try_consume_channel(&self, channel: &str) -> Decision {
        let shape = self.config.read().unwrap().channel;
        self.consume_at(format!("channel:{channel}"), shape, Instant::now())
    }

    /// Per-LLM-provider admission.
    pub fn try_consume_llm(&self, provider_id: &str) -> Decision {
        let shape = self.config.read().unwrap().llm;
        self.consume_at(format!("llm:{provider_id}"), shape, Instant::now())
    }

    fn consume_at(&self, key: String, shape: BucketConfig, now: Instant) -> Decision {
        let mut entry = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket::new(shape, now));
        if entry.shape != shape {
            debug!(key = %key, "rate limit: bucket shape changed, rebuilding");
            *entry = Bucket::new(shape, now);
        }
        entry.try_consume(now)
    }
}
