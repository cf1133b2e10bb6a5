use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Guards against `elapsed * rate` landing a hair under a whole token.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateClassConfig {
    /// Burst size: the most tokens a bucket can hold
    pub capacity: u32,

    /// Continuous refill rate in tokens per second
    pub refill_per_second: f64,
}

impl RateClassConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            anyhow::bail!("capacity must be at least 1");
        }
        if !self.refill_per_second.is_finite() || self.refill_per_second <= 0.0 {
            anyhow::bail!("refill_per_second must be a positive number");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }

    /// Whole seconds for a `Retry-After` header, never less than one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RateDecision::Allowed => None,
            RateDecision::Denied { retry_after } => {
                Some((retry_after.as_secs_f64().ceil() as u64).max(1))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(config: &RateClassConfig, now: Instant) -> Self {
        let capacity = f64::from(config.capacity);
        Self {
            tokens: capacity,
            capacity,
            refill_per_second: config.refill_per_second,
            last_refill: now,
        }
    }

    /// Refill for the time elapsed since the last call, then take one token
    /// if available.
    pub fn try_acquire(&mut self, now: Instant) -> RateDecision {
        self.refill(now);

        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            return RateDecision::Allowed;
        }

        let missing = 1.0 - self.tokens;
        let micros = (missing / self.refill_per_second * 1_000_000.0).ceil();
        RateDecision::Denied {
            retry_after: Duration::from_micros(micros as u64),
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        // Callers sample `now` before taking the lock, so it can arrive out of order.
        self.last_refill = self.last_refill.max(now);
    }
}
