//! Repository for the `quota_usage` table.
//!
//! Reservations are a single conditional UPSERT: the row is created or
//! updated only if `used + reserved + count` stays within the limit.
//! Concurrent reservations for the same caller serialise on the row lock, so
//! the limit holds without an explicit transaction.

use folio_core::types::{DbId, Timestamp};
use sqlx::PgPool;

use crate::models::quota::QuotaUsage;

const COLUMNS: &str = "\
    caller_id, period_start, period_end, quota_limit, used, reserved, updated_at";

pub struct QuotaRepo;

impl QuotaRepo {
    /// Reserve `count` units. Returns the updated row, or `None` if the
    /// reservation would exceed `quota_limit`.
    pub async fn try_reserve(
        pool: &PgPool,
        caller_id: DbId,
        period_start: Timestamp,
        period_end: Timestamp,
        quota_limit: i64,
        count: i64,
    ) -> Result<Option<QuotaUsage>, sqlx::Error> {
        let query = format!(
            "INSERT INTO quota_usage (caller_id, period_start, period_end, quota_limit, used, reserved) \
             SELECT $1, $2, $3, $4, 0, $5 WHERE $5 <= $4 \
             ON CONFLICT (caller_id, period_start) DO UPDATE \
                SET reserved = quota_usage.reserved + EXCLUDED.reserved, \
                    quota_limit = EXCLUDED.quota_limit, \
                    updated_at = NOW() \
                WHERE quota_usage.used + quota_usage.reserved + EXCLUDED.reserved \
                      <= EXCLUDED.quota_limit \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, QuotaUsage>(&query)
            .bind(caller_id)
            .bind(period_start)
            .bind(period_end)
            .bind(quota_limit)
            .bind(count)
            .fetch_optional(pool)
            .await
    }

    pub async fn find(
        pool: &PgPool,
        caller_id: DbId,
        period_start: Timestamp,
    ) -> Result<Option<QuotaUsage>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM quota_usage WHERE caller_id = $1 AND period_start = $2"
        );
        sqlx::query_as::<_, QuotaUsage>(&query)
            .bind(caller_id)
            .bind(period_start)
            .fetch_optional(pool)
            .await
    }

    /// Move up to `count` reserved units into `used`.
    pub async fn commit(
        pool: &PgPool,
        caller_id: DbId,
        period_start: Timestamp,
        count: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE quota_usage \
             SET used = used + LEAST($3, reserved), \
                 reserved = reserved - LEAST($3, reserved), \
                 updated_at = NOW() \
             WHERE caller_id = $1 AND period_start = $2",
        )
        .bind(caller_id)
        .bind(period_start)
        .bind(count)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Release up to `count` reserved units.
    pub async fn rollback(
        pool: &PgPool,
        caller_id: DbId,
        period_start: Timestamp,
        count: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE quota_usage \
             SET reserved = GREATEST(reserved - $3, 0), updated_at = NOW() \
             WHERE caller_id = $1 AND period_start = $2",
        )
        .bind(caller_id)
        .bind(period_start)
        .bind(count)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
