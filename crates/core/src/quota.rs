//! Usage quotas per billing period.
//!
//! The [`UsageLedger`] is the persistence seam: an atomic check-and-reserve
//! followed by either a commit (render delivered) or a rollback (render
//! failed). Reservations count against the limit while they are outstanding,
//! so concurrent admissions can never push `used` past `limit`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{Datelike, TimeZone, Utc};
use serde::Serialize;

use crate::caller::CallerContext;
use crate::error::CoreError;
use crate::types::{CallerId, Timestamp};

// ---------------------------------------------------------------------------
// Billing periods
// ---------------------------------------------------------------------------

/// Calendar month (UTC) containing `now`, as `[start, end)`.
pub fn billing_period(now: Timestamp) -> (Timestamp, Timestamp) {
    let start = month_start(now.year(), now.month());
    let end = if now.month() == 12 {
        month_start(now.year() + 1, 1)
    } else {
        month_start(now.year(), now.month() + 1)
    };
    (start, end)
}

fn month_start(year: i32, month: u32) -> Timestamp {
    // The first of any month at midnight UTC always exists.
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A caller's usage for one billing period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaRecord {
    pub caller_id: CallerId,
    pub limit: i64,
    pub used: i64,
    pub reserved: i64,
    pub period_start: Timestamp,
    pub period_end: Timestamp,
}

impl QuotaRecord {
    pub fn remaining(&self) -> i64 {
        (self.limit - self.used - self.reserved).max(0)
    }
}

/// Outcome of [`UsageLedger::check_and_reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// `count` units are now reserved in the period starting at
    /// `period_start`.
    Allowed {
        remaining: i64,
        period_start: Timestamp,
        reset_at: Timestamp,
    },
    /// Nothing was reserved. `remaining` is what the caller could still
    /// spend, which is zero for a single-job request.
    Denied { remaining: i64, reset_at: Timestamp },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

// ---------------------------------------------------------------------------
// Ledger trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Atomically reserve `count` units if `used + reserved + count <= limit`.
    async fn check_and_reserve(
        &self,
        caller: &CallerContext,
        count: u32,
    ) -> Result<QuotaDecision, CoreError>;

    /// Convert `count` reserved units into used units.
    async fn commit(
        &self,
        caller_id: CallerId,
        period_start: Timestamp,
        count: u32,
    ) -> Result<(), CoreError>;

    /// Release `count` reserved units without charging them.
    async fn rollback(
        &self,
        caller_id: CallerId,
        period_start: Timestamp,
        count: u32,
    ) -> Result<(), CoreError>;

    /// Current record for the period containing now, if any usage exists.
    async fn current(&self, caller: &CallerContext) -> Result<Option<QuotaRecord>, CoreError>;
}

// ---------------------------------------------------------------------------
// Reservation guard
// ---------------------------------------------------------------------------

/// Outstanding units reserved against a caller's quota.
///
/// Call [`settle`](Self::settle) once the outcome is known. A reservation
/// dropped without settling (cancelled request, closed session) is rolled
/// back in full on a background task.
pub struct QuotaReservation {
    ledger: Arc<dyn UsageLedger>,
    caller_id: CallerId,
    period_start: Timestamp,
    count: u32,
    settled: bool,
}

impl QuotaReservation {
    pub fn new(
        ledger: Arc<dyn UsageLedger>,
        caller_id: CallerId,
        period_start: Timestamp,
        count: u32,
    ) -> Self {
        Self {
            ledger,
            caller_id,
            period_start,
            count,
            settled: false,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Commit `succeeded` units and roll back the rest.
    ///
    /// Both ledger calls are attempted; the first error is returned. Units
    /// whose commit failed are rolled back with the rest, so a failed settle
    /// never leaves quota stuck in `reserved`.
    pub async fn settle(mut self, succeeded: u32) -> Result<(), CoreError> {
        self.settled = true;
        let succeeded = succeeded.min(self.count);
        let mut release = self.count - succeeded;
        let mut first_err = None;

        if succeeded > 0 {
            if let Err(e) = self
                .ledger
                .commit(self.caller_id, self.period_start, succeeded)
                .await
            {
                release = self.count;
                first_err = Some(e);
            }
        }
        if release > 0 {
            if let Err(e) = self
                .ledger
                .rollback(self.caller_id, self.period_start, release)
                .await
            {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if self.settled || self.count == 0 {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let ledger = Arc::clone(&self.ledger);
        let (caller_id, period_start, count) = (self.caller_id, self.period_start, self.count);
        runtime.spawn(async move {
            if let Err(e) = ledger.rollback(caller_id, period_start, count).await {
                tracing::warn!(caller_id, count, error = %e, "Failed to roll back abandoned reservation");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// In-memory ledger
// ---------------------------------------------------------------------------

/// Process-local ledger used when no database is configured, and in tests.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: Mutex<HashMap<(CallerId, Timestamp), QuotaRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load usage for the current period.
    pub fn seed_usage(&self, caller: &CallerContext, used: i64) {
        let (period_start, period_end) = billing_period(Utc::now());
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .entry((caller.caller_id, period_start))
            .or_insert_with(|| QuotaRecord {
                caller_id: caller.caller_id,
                limit: caller.monthly_quota,
                used: 0,
                reserved: 0,
                period_start,
                period_end,
            });
        record.used = used;
    }

    fn with_record<T>(
        &self,
        caller_id: CallerId,
        period_start: Timestamp,
        f: impl FnOnce(&mut QuotaRecord) -> T,
    ) -> Result<T, CoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records.get_mut(&(caller_id, period_start)).ok_or_else(|| {
            CoreError::Internal(format!("No quota record for caller {caller_id}"))
        })?;
        Ok(f(record))
    }
}

#[async_trait]
impl UsageLedger for InMemoryLedger {
    async fn check_and_reserve(
        &self,
        caller: &CallerContext,
        count: u32,
    ) -> Result<QuotaDecision, CoreError> {
        let (period_start, period_end) = billing_period(Utc::now());
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .entry((caller.caller_id, period_start))
            .or_insert_with(|| QuotaRecord {
                caller_id: caller.caller_id,
                limit: caller.monthly_quota,
                used: 0,
                reserved: 0,
                period_start,
                period_end,
            });
        record.limit = caller.monthly_quota;

        let count = i64::from(count);
        if record.used + record.reserved + count > record.limit {
            return Ok(QuotaDecision::Denied {
                remaining: record.remaining(),
                reset_at: period_end,
            });
        }
        record.reserved += count;
        Ok(QuotaDecision::Allowed {
            remaining: record.remaining(),
            period_start,
            reset_at: period_end,
        })
    }

    async fn commit(
        &self,
        caller_id: CallerId,
        period_start: Timestamp,
        count: u32,
    ) -> Result<(), CoreError> {
        self.with_record(caller_id, period_start, |record| {
            let count = i64::from(count).min(record.reserved);
            record.reserved -= count;
            record.used += count;
        })
    }

    async fn rollback(
        &self,
        caller_id: CallerId,
        period_start: Timestamp,
        count: u32,
    ) -> Result<(), CoreError> {
        self.with_record(caller_id, period_start, |record| {
            record.reserved = (record.reserved - i64::from(count)).max(0);
        })
    }

    async fn current(&self, caller: &CallerContext) -> Result<Option<QuotaRecord>, CoreError> {
        let (period_start, _) = billing_period(Utc::now());
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(&(caller.caller_id, period_start)).cloned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::tier::Tier;

    fn caller(quota: i64) -> CallerContext {
        CallerContext::new(7, "acme", Tier::Starter).with_quota(quota)
    }

    // -- Billing period ----------------------------------------------------

    #[test]
    fn billing_period_covers_calendar_month() {
        let now = Utc.with_ymd_and_hms(2026, 3, 17, 12, 30, 0).unwrap();
        let (start, end) = billing_period(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn billing_period_wraps_december() {
        let now = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap();
        let (start, end) = billing_period(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }

    // -- Reservations ------------------------------------------------------

    #[tokio::test]
    async fn reserve_commit_rollback_accounting() {
        let ledger = InMemoryLedger::new();
        let acme = caller(10);

        let decision = ledger.check_and_reserve(&acme, 4).await.unwrap();
        let period_start = assert_matches!(
            decision,
            QuotaDecision::Allowed { remaining: 6, period_start, .. } => period_start
        );

        ledger.commit(acme.caller_id, period_start, 3).await.unwrap();
        ledger.rollback(acme.caller_id, period_start, 1).await.unwrap();

        let record = ledger.current(&acme).await.unwrap().unwrap();
        assert_eq!(record.used, 3);
        assert_eq!(record.reserved, 0);
        assert_eq!(record.remaining(), 7);
    }

    #[tokio::test]
    async fn batch_larger_than_remaining_is_denied_without_reserving() {
        let ledger = InMemoryLedger::new();
        let acme = caller(10);
        ledger.seed_usage(&acme, 7);

        let decision = ledger.check_and_reserve(&acme, 5).await.unwrap();
        assert_matches!(decision, QuotaDecision::Denied { remaining: 3, .. });

        let record = ledger.current(&acme).await.unwrap().unwrap();
        assert_eq!(record.reserved, 0);
    }

    #[tokio::test]
    async fn last_unit_goes_to_exactly_one_of_two_racers() {
        let ledger = Arc::new(InMemoryLedger::new());
        let acme = caller(100);
        ledger.seed_usage(&acme, 99);

        let (a, b) = tokio::join!(
            ledger.check_and_reserve(&acme, 1),
            ledger.check_and_reserve(&acme, 1)
        );
        let decisions = [a.unwrap(), b.unwrap()];
        assert_eq!(decisions.iter().filter(|d| d.is_allowed()).count(), 1);
        assert!(decisions
            .iter()
            .any(|d| matches!(d, QuotaDecision::Denied { remaining: 0, .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_exceed_limit() {
        let ledger: Arc<dyn UsageLedger> = Arc::new(InMemoryLedger::new());
        let acme = caller(50);

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let acme = acme.clone();
                tokio::spawn(async move {
                    match ledger.check_and_reserve(&acme, 1).await.unwrap() {
                        QuotaDecision::Allowed { period_start, .. } => {
                            ledger.commit(acme.caller_id, period_start, 1).await.unwrap();
                            true
                        }
                        QuotaDecision::Denied { .. } => false,
                    }
                })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 50);
        let record = ledger.current(&acme).await.unwrap().unwrap();
        assert_eq!(record.used, 50);
    }

    #[tokio::test]
    async fn unsettled_reservation_rolls_back_on_drop() {
        let ledger = Arc::new(InMemoryLedger::new());
        let acme = caller(10);

        let decision = ledger.check_and_reserve(&acme, 3).await.unwrap();
        let QuotaDecision::Allowed { period_start, .. } = decision else {
            panic!("expected allowed");
        };
        let reservation =
            QuotaReservation::new(ledger.clone(), acme.caller_id, period_start, 3);
        drop(reservation);

        // The rollback runs on a spawned task.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let record = ledger.current(&acme).await.unwrap().unwrap();
        assert_eq!(record.reserved, 0);
        assert_eq!(record.used, 0);
    }

    #[tokio::test]
    async fn settle_splits_commit_and_rollback() {
        let ledger = Arc::new(InMemoryLedger::new());
        let acme = caller(10);

        let QuotaDecision::Allowed { period_start, .. } =
            ledger.check_and_reserve(&acme, 5).await.unwrap()
        else {
            panic!("expected allowed");
        };
        QuotaReservation::new(ledger.clone(), acme.caller_id, period_start, 5)
            .settle(4)
            .await
            .unwrap();

        let record = ledger.current(&acme).await.unwrap().unwrap();
        assert_eq!(record.used, 4);
        assert_eq!(record.reserved, 0);
    }

    /// Delegates to an [`InMemoryLedger`] but fails every commit.
    struct FailingCommitLedger(InMemoryLedger);

    #[async_trait]
    impl UsageLedger for FailingCommitLedger {
        async fn check_and_reserve(
            &self,
            caller: &CallerContext,
            count: u32,
        ) -> Result<QuotaDecision, CoreError> {
            self.0.check_and_reserve(caller, count).await
        }

        async fn commit(&self, _: CallerId, _: Timestamp, _: u32) -> Result<(), CoreError> {
            Err(CoreError::Internal("connection reset".into()))
        }

        async fn rollback(
            &self,
            caller_id: CallerId,
            period_start: Timestamp,
            count: u32,
        ) -> Result<(), CoreError> {
            self.0.rollback(caller_id, period_start, count).await
        }

        async fn current(&self, caller: &CallerContext) -> Result<Option<QuotaRecord>, CoreError> {
            self.0.current(caller).await
        }
    }

    #[tokio::test]
    async fn failed_commit_still_releases_reservation() {
        let ledger = Arc::new(FailingCommitLedger(InMemoryLedger::new()));
        let acme = caller(10);

        let QuotaDecision::Allowed { period_start, .. } =
            ledger.check_and_reserve(&acme, 5).await.unwrap()
        else {
            panic!("expected allowed");
        };
        let result = QuotaReservation::new(ledger.clone(), acme.caller_id, period_start, 5)
            .settle(2)
            .await;
        assert_matches!(result, Err(CoreError::Internal(_)));

        let record = ledger.current(&acme).await.unwrap().unwrap();
        assert_eq!(record.reserved, 0);
        assert_eq!(record.used, 0);
        assert_eq!(record.remaining(), 10);
    }
}
