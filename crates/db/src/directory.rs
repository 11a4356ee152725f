//! [`CallerDirectory`] backed by the `callers` table.

use async_trait::async_trait;
use folio_core::caller::{CallerContext, CallerDirectory};
use folio_core::error::CoreError;

use crate::repositories::CallerRepo;
use crate::DbPool;

#[derive(Clone)]
pub struct PgCallerDirectory {
    pool: DbPool,
}

impl PgCallerDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CallerDirectory for PgCallerDirectory {
    async fn resolve(&self, key_hash: &str) -> Result<Option<CallerContext>, CoreError> {
        let caller = CallerRepo::find_active_by_hash(&self.pool, key_hash)
            .await
            .map_err(|e| CoreError::Internal(format!("caller lookup: {e}")))?;
        let Some(caller) = caller else {
            return Ok(None);
        };

        // Updated off the request path.
        let pool = self.pool.clone();
        let caller_id = caller.id;
        tokio::spawn(async move {
            if let Err(e) = CallerRepo::touch_last_used(&pool, caller_id).await {
                tracing::warn!(caller_id, error = %e, "Failed to update caller last_used_at");
            }
        });

        caller.to_context().map(Some)
    }
}
