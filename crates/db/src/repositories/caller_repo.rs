//! Repository for the `callers` table.

use folio_core::types::DbId;
use sqlx::PgPool;

use crate::models::caller::{Caller, CreateCaller};

const COLUMNS: &str = "\
    id, name, key_hash, key_prefix, tier, monthly_quota, \
    is_active, last_used_at, created_at, updated_at";

pub struct CallerRepo;

impl CallerRepo {
    pub async fn create(pool: &PgPool, input: &CreateCaller) -> Result<Caller, sqlx::Error> {
        let query = format!(
            "INSERT INTO callers (name, key_hash, key_prefix, tier, monthly_quota) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Caller>(&query)
            .bind(&input.name)
            .bind(&input.key_hash)
            .bind(&input.key_prefix)
            .bind(input.tier.name())
            .bind(input.monthly_quota)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Caller>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM callers WHERE id = $1");
        sqlx::query_as::<_, Caller>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Find an active caller by the SHA-256 hash of their API key.
    pub async fn find_active_by_hash(
        pool: &PgPool,
        key_hash: &str,
    ) -> Result<Option<Caller>, sqlx::Error> {
        let query =
            format!("SELECT {COLUMNS} FROM callers WHERE key_hash = $1 AND is_active = true");
        sqlx::query_as::<_, Caller>(&query)
            .bind(key_hash)
            .fetch_optional(pool)
            .await
    }

    /// Stamp `last_used_at`. Returns whether a row was updated.
    pub async fn touch_last_used(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE callers SET last_used_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deactivate a caller; their key stops resolving immediately.
    pub async fn deactivate(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE callers SET is_active = false, updated_at = NOW() \
             WHERE id = $1 AND is_active = true",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
