//! Per-caller admission: token-bucket rate limiting and quota reservation.
//!
//! Both checks run before a worker is acquired, so a denied request never
//! touches a pool. Buckets live in a concurrent map keyed by caller id and
//! are updated under the map's per-shard lock; quota is delegated to the
//! [`UsageLedger`], which owns the atomic check-and-reserve.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use folio_core::caller::CallerContext;
use folio_core::error::CoreError;
use folio_core::quota::{QuotaDecision, QuotaRecord, QuotaReservation, UsageLedger};
use folio_core::rate_limit::{RateDecision, RateLimitStatus, TokenBucket};
use folio_core::types::{CallerId, Timestamp};

/// Outcome of [`AdmissionController::check_quota`].
pub enum QuotaOutcome {
    /// Units are held until the reservation is settled or dropped.
    Reserved(QuotaReservation),
    Denied { remaining: i64, reset_at: Timestamp },
}

impl std::fmt::Debug for QuotaOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reserved(r) => f.debug_tuple("Reserved").field(&r.count()).finish(),
            Self::Denied {
                remaining,
                reset_at,
            } => f
                .debug_struct("Denied")
                .field("remaining", remaining)
                .field("reset_at", reset_at)
                .finish(),
        }
    }
}

pub struct AdmissionController {
    buckets: DashMap<CallerId, TokenBucket>,
    ledger: Arc<dyn UsageLedger>,
}

impl AdmissionController {
    pub fn new(ledger: Arc<dyn UsageLedger>) -> Self {
        Self {
            buckets: DashMap::new(),
            ledger,
        }
    }

    /// Consume one token from the caller's bucket.
    pub fn check_rate(&self, caller: &CallerContext) -> RateDecision {
        self.check_rate_at(caller, Instant::now())
    }

    pub fn check_rate_at(&self, caller: &CallerContext, now: Instant) -> RateDecision {
        let mut bucket = self.bucket(caller, now);
        bucket.try_take(now)
    }

    /// Report the caller's status without consuming a token.
    pub fn peek_rate(&self, caller: &CallerContext) -> RateLimitStatus {
        let now = Instant::now();
        let mut bucket = self.bucket(caller, now);
        bucket.peek(now)
    }

    /// Reserve `count` units of the caller's quota.
    pub async fn check_quota(
        &self,
        caller: &CallerContext,
        count: u32,
    ) -> Result<QuotaOutcome, CoreError> {
        match self.ledger.check_and_reserve(caller, count).await? {
            QuotaDecision::Allowed { period_start, .. } => {
                Ok(QuotaOutcome::Reserved(QuotaReservation::new(
                    Arc::clone(&self.ledger),
                    caller.caller_id,
                    period_start,
                    count,
                )))
            }
            QuotaDecision::Denied {
                remaining,
                reset_at,
            } => {
                tracing::info!(
                    caller_id = caller.caller_id,
                    count,
                    remaining,
                    %reset_at,
                    "Quota exceeded",
                );
                Ok(QuotaOutcome::Denied {
                    remaining,
                    reset_at,
                })
            }
        }
    }

    /// Usage in the current billing period.
    pub async fn quota_record(
        &self,
        caller: &CallerContext,
    ) -> Result<Option<QuotaRecord>, CoreError> {
        self.ledger.current(caller).await
    }

    /// Drop buckets that have refilled completely. A full bucket behaves
    /// exactly like a freshly created one, so nothing is lost.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    pub fn prune_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.peek(now);
            bucket.tokens() < bucket.capacity()
        });
        before.saturating_sub(self.buckets.len())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(
        &self,
        caller: &CallerContext,
        now: Instant,
    ) -> dashmap::mapref::one::RefMut<'_, CallerId, TokenBucket> {
        let mut bucket = self
            .buckets
            .entry(caller.caller_id)
            .or_insert_with(|| TokenBucket::for_tier(caller.tier, now));
        if bucket.capacity() != caller.tier.burst_capacity() {
            bucket.retune(caller.tier, now);
        }
        bucket
    }
}
