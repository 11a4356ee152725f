//! Token-bucket rate limiting.
//!
//! Buckets refill lazily: every check first credits the tokens earned since
//! the previous check, so no background timer is needed. All functions take
//! the current instant explicitly which keeps them deterministic under test.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::tier::Tier;

/// Rate-limit status reported to callers on every response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitStatus {
    /// Burst capacity of the bucket.
    pub limit: u32,
    /// Whole tokens left after this request.
    pub remaining: u32,
    /// Time until the bucket is full again.
    #[serde(rename = "reset_after_secs", serialize_with = "serialize_secs")]
    pub reset_after: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs_f64().ceil() as u64)
}

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed { status: RateLimitStatus },
    Denied {
        retry_after: Duration,
        status: RateLimitStatus,
    },
}

impl RateDecision {
    pub fn status(&self) -> RateLimitStatus {
        match self {
            Self::Allowed { status } | Self::Denied { status, .. } => *status,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// A single caller's bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A bucket that starts full.
    pub fn full(capacity: f64, refill_per_second: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_second,
            last_refill: now,
        }
    }

    pub fn for_tier(tier: Tier, now: Instant) -> Self {
        Self::full(tier.burst_capacity(), tier.refill_per_second(), now)
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Re-key the bucket after a tier change, keeping the current fill level.
    pub fn retune(&mut self, tier: Tier, now: Instant) {
        self.refill(now);
        self.capacity = tier.burst_capacity();
        self.refill_per_second = tier.refill_per_second();
        self.tokens = self.tokens.min(self.capacity);
    }

    /// Consume one token if available.
    pub fn try_take(&mut self, now: Instant) -> RateDecision {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return RateDecision::Allowed {
                status: self.status(),
            };
        }

        let missing = 1.0 - self.tokens;
        RateDecision::Denied {
            retry_after: Duration::from_secs_f64(missing / self.refill_per_second),
            status: self.status(),
        }
    }

    /// Current status without consuming anything.
    pub fn peek(&mut self, now: Instant) -> RateLimitStatus {
        self.refill(now);
        self.status()
    }

    fn refill(&mut self, now: Instant) {
        // Instants from other threads may arrive slightly out of order.
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    fn status(&self) -> RateLimitStatus {
        let deficit = (self.capacity - self.tokens).max(0.0);
        RateLimitStatus {
            limit: self.capacity as u32,
            remaining: self.tokens.floor().max(0.0) as u32,
            reset_after: Duration::from_secs_f64(deficit / self.refill_per_second),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
