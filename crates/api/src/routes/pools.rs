use axum::extract::State;
use axum::{routing::get, Json, Router};
use folio_core::quota::QuotaRecord;
use folio_core::rate_limit::RateLimitStatus;
use folio_core::types::PartitionKey;
use folio_pool::PoolStats;
use serde::Serialize;

use crate::error::AppResult;
use crate::middleware::auth::AuthCaller;
use crate::response::RateLimitHeaders;
use crate::state::AppState;

/// The caller's own view of its resources.
#[derive(Serialize)]
pub struct PoolOverview {
    pub partition: PartitionKey,
    /// `None` until the first job creates the pool, and after teardown.
    pub pool: Option<PoolStats>,
    pub rate_limit: RateLimitStatus,
    /// `None` until the first job of the billing period.
    pub quota: Option<QuotaRecord>,
}

/// GET /pools -- pool statistics and usage for the authenticated caller.
async fn caller_pool(
    State(state): State<AppState>,
    caller: AuthCaller,
) -> AppResult<(RateLimitHeaders, Json<PoolOverview>)> {
    let partition = caller.partition();
    let pool = state.pools.stats(&partition).await;
    let rate_limit = state.dispatcher.admission().peek_rate(&caller);
    let quota = state.dispatcher.admission().quota_record(&caller).await?;

    Ok((
        RateLimitHeaders(rate_limit),
        Json(PoolOverview {
            partition,
            pool,
            rate_limit,
            quota,
        }),
    ))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/pools", get(caller_pool))
}
