//! Caller model.

use folio_core::caller::CallerContext;
use folio_core::error::CoreError;
use folio_core::tier::Tier;
use folio_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `callers` table.
///
/// **Note:** `key_hash` is never serialized; `key_prefix` identifies the key
/// in logs and listings.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Caller {
    pub id: DbId,
    pub name: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub key_prefix: String,
    pub tier: String,
    /// Overrides the tier's default monthly quota when set.
    pub monthly_quota: Option<i64>,
    pub is_active: bool,
    pub last_used_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Caller {
    pub fn to_context(&self) -> Result<CallerContext, CoreError> {
        let tier = Tier::from_name(&self.tier)?;
        let context = CallerContext::new(self.id, self.name.clone(), tier);
        Ok(match self.monthly_quota {
            Some(quota) => context.with_quota(quota),
            None => context,
        })
    }
}

/// DTO for registering a caller.
#[derive(Debug, Clone)]
pub struct CreateCaller {
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub tier: Tier,
    pub monthly_quota: Option<i64>,
}
