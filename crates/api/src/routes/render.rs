//! Single-shot and batch render endpoints.
//!
//! Every response, success or refusal, carries the caller's
//! `x-ratelimit-*` headers.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use folio_core::batch::BatchRequest;
use folio_core::caller::CallerContext;
use folio_core::job::RenderJob;

use crate::engine::{DispatchError, Dispatched};
use crate::error::AppError;
use crate::middleware::auth::AuthCaller;
use crate::response::RateLimitHeaders;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/render", post(render_one))
        .route("/render/batch", post(render_batch))
}

/// POST /render -- render one job and return its `RenderResult`.
///
/// Admitted jobs that fail are reported with the status of their error
/// code (503 for busy or crashed workers, 422 for rejected documents).
async fn render_one(
    State(state): State<AppState>,
    caller: AuthCaller,
    body: Result<Json<RenderJob>, JsonRejection>,
) -> Response {
    let outcome = match body {
        Ok(Json(job)) => state.dispatcher.generate(&caller, job).await,
        Err(rejection) => Err(DispatchError::Invalid(rejection.body_text())),
    };

    match outcome {
        Ok(Dispatched { output, rate }) if output.success => {
            (RateLimitHeaders(rate), Json(output)).into_response()
        }
        Ok(Dispatched { output, rate }) => {
            (RateLimitHeaders(rate), AppError::JobFailed(Box::new(output))).into_response()
        }
        Err(err) => refused(&state, &caller, err),
    }
}

/// POST /render/batch -- render up to `MAX_BATCH_SIZE` jobs.
///
/// Returns 200 whenever the batch was admitted; per-job failures are entries
/// in the ordered result list.
async fn render_batch(
    State(state): State<AppState>,
    caller: AuthCaller,
    body: Result<Json<BatchRequest>, JsonRejection>,
) -> Response {
    let outcome = match body {
        Ok(Json(batch)) => state.dispatcher.generate_batch(&caller, batch.jobs).await,
        Err(rejection) => Err(DispatchError::Invalid(rejection.body_text())),
    };

    match outcome {
        Ok(Dispatched { output, rate }) => (RateLimitHeaders(rate), Json(output)).into_response(),
        Err(err) => refused(&state, &caller, err),
    }
}

fn refused(state: &AppState, caller: &CallerContext, err: DispatchError) -> Response {
    let status = err
        .rate_status()
        .unwrap_or_else(|| state.dispatcher.admission().peek_rate(caller));
    (RateLimitHeaders(status), AppError::Dispatch(err)).into_response()
}
