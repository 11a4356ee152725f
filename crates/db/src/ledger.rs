//! [`UsageLedger`] backed by the `quota_usage` table.

use async_trait::async_trait;
use chrono::Utc;
use folio_core::caller::CallerContext;
use folio_core::error::CoreError;
use folio_core::quota::{billing_period, QuotaDecision, QuotaRecord, UsageLedger};
use folio_core::types::{CallerId, Timestamp};

use crate::repositories::QuotaRepo;
use crate::DbPool;

#[derive(Clone)]
pub struct PgUsageLedger {
    pool: DbPool,
}

impl PgUsageLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn db_error(e: sqlx::Error) -> CoreError {
    CoreError::Internal(format!("quota ledger: {e}"))
}

#[async_trait]
impl UsageLedger for PgUsageLedger {
    async fn check_and_reserve(
        &self,
        caller: &CallerContext,
        count: u32,
    ) -> Result<QuotaDecision, CoreError> {
        let (period_start, period_end) = billing_period(Utc::now());
        let reserved = QuotaRepo::try_reserve(
            &self.pool,
            caller.caller_id,
            period_start,
            period_end,
            caller.monthly_quota,
            i64::from(count),
        )
        .await
        .map_err(db_error)?;

        if let Some(row) = reserved {
            let record = QuotaRecord::from(row);
            return Ok(QuotaDecision::Allowed {
                remaining: record.remaining(),
                period_start,
                reset_at: period_end,
            });
        }

        let remaining = QuotaRepo::find(&self.pool, caller.caller_id, period_start)
            .await
            .map_err(db_error)?
            .map(|row| QuotaRecord::from(row).remaining())
            .unwrap_or(caller.monthly_quota);

        tracing::debug!(
            caller_id = caller.caller_id,
            count,
            remaining,
            "Quota reservation denied",
        );
        Ok(QuotaDecision::Denied {
            remaining,
            reset_at: period_end,
        })
    }

    async fn commit(
        &self,
        caller_id: CallerId,
        period_start: Timestamp,
        count: u32,
    ) -> Result<(), CoreError> {
        let updated = QuotaRepo::commit(&self.pool, caller_id, period_start, i64::from(count))
            .await
            .map_err(db_error)?;
        if !updated {
            tracing::warn!(caller_id, count, "Commit for unknown quota period");
        }
        Ok(())
    }

    async fn rollback(
        &self,
        caller_id: CallerId,
        period_start: Timestamp,
        count: u32,
    ) -> Result<(), CoreError> {
        let updated = QuotaRepo::rollback(&self.pool, caller_id, period_start, i64::from(count))
            .await
            .map_err(db_error)?;
        if !updated {
            tracing::warn!(caller_id, count, "Rollback for unknown quota period");
        }
        Ok(())
    }

    async fn current(&self, caller: &CallerContext) -> Result<Option<QuotaRecord>, CoreError> {
        let (period_start, _) = billing_period(Utc::now());
        let row = QuotaRepo::find(&self.pool, caller.caller_id, period_start)
            .await
            .map_err(db_error)?;
        Ok(row.map(QuotaRecord::from))
    }
}
