use folio_core::quota::QuotaRecord;
use folio_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `quota_usage` table: one caller, one billing period.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QuotaUsage {
    pub caller_id: DbId,
    pub period_start: Timestamp,
    pub period_end: Timestamp,
    pub quota_limit: i64,
    pub used: i64,
    pub reserved: i64,
    pub updated_at: Timestamp,
}

impl From<QuotaUsage> for QuotaRecord {
    fn from(row: QuotaUsage) -> Self {
        QuotaRecord {
            caller_id: row.caller_id,
            limit: row.quota_limit,
            used: row.used,
            reserved: row.reserved,
            period_start: row.period_start,
            period_end: row.period_end,
        }
    }
}
