use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use folio_core::error::CoreError;
use folio_core::outcome::{ErrorCode, RenderResult};
use serde_json::{json, Map, Value};

use crate::engine::DispatchError;
use crate::response::retry_after_secs;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] and [`DispatchError`] and adds HTTP-specific variants.
/// Implements [`IntoResponse`] to produce consistent JSON error responses of
/// the form `{ "error", "code", "retryable", ... }`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `folio_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A database error from sqlx.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A request refused before any job ran.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// An admitted single job that did not produce output.
    #[error("Render failed: {}", .0.error.as_ref().map(|e| e.message.as_str()).unwrap_or("unknown"))]
    JobFailed(Box<RenderResult>),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

/// HTTP status for a job-level error code.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::RateLimited | ErrorCode::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::RenderFailed | ErrorCode::DependencyFailed => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::StorageFailed => StatusCode::BAD_GATEWAY,
        ErrorCode::Busy
        | ErrorCode::RenderTimeout
        | ErrorCode::WorkerCrashed
        | ErrorCode::SessionClosed => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut extra = Map::new();
        let mut retry_after: Option<u64> = None;

        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, ErrorCode::InvalidRequest, msg.clone())
                }
                CoreError::Unauthorized(msg) => {
                    (StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized, msg.clone())
                }
                CoreError::Internal(msg) => {
                    tracing::error!(error = %msg, "Internal core error");
                    internal()
                }
            },

            // --- Database errors ---
            AppError::Database(err) => {
                tracing::error!(error = %err, "Database error");
                internal()
            }

            // --- Admission and protocol refusals ---
            AppError::Dispatch(err) => match err {
                DispatchError::Invalid(msg) => {
                    (StatusCode::BAD_REQUEST, ErrorCode::InvalidRequest, msg.clone())
                }
                DispatchError::RateLimited { retry_after: wait, .. } => {
                    let secs = retry_after_secs(*wait);
                    retry_after = Some(secs);
                    extra.insert("retry_after_secs".into(), json!(secs));
                    (
                        StatusCode::TOO_MANY_REQUESTS,
                        ErrorCode::RateLimited,
                        format!("Rate limit exceeded, retry after {secs} seconds"),
                    )
                }
                DispatchError::QuotaExceeded {
                    remaining,
                    reset_at,
                    ..
                } => {
                    extra.insert("reset_at".into(), json!(reset_at));
                    extra.insert("remaining".into(), json!(remaining));
                    (
                        StatusCode::TOO_MANY_REQUESTS,
                        ErrorCode::QuotaExceeded,
                        format!("Monthly quota exhausted, resets at {}", reset_at.to_rfc3339()),
                    )
                }
                DispatchError::Ledger { message, .. } => {
                    tracing::error!(error = %message, "Usage ledger error");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        ErrorCode::Internal,
                        "Usage accounting is temporarily unavailable".to_string(),
                    )
                }
            },

            // --- Job failures ---
            AppError::JobFailed(result) => {
                extra.insert("job_id".into(), json!(result.job_id));
                extra.insert("duration_ms".into(), json!(result.duration_ms));
                let (code, message) = match &result.error {
                    Some(e) => (e.code, e.message.clone()),
                    None => (ErrorCode::Internal, "Render failed".to_string()),
                };
                if code == ErrorCode::Busy {
                    retry_after = Some(1);
                }
                (status_for(code), code, message)
            }

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, ErrorCode::InvalidRequest, msg.clone())
            }
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
        };

        let retryable = match &self {
            AppError::JobFailed(result) => result.error.as_ref().is_some_and(|e| e.retryable),
            AppError::Database(_) | AppError::Dispatch(DispatchError::Ledger { .. }) => true,
            _ => code.is_retryable(),
        };

        let mut body = Map::new();
        body.insert("error".into(), json!(message));
        body.insert("code".into(), json!(code.as_str()));
        body.insert("retryable".into(), json!(retryable));
        body.extend(extra);

        let mut response = (status, axum::Json(Value::Object(body))).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

fn internal() -> (StatusCode, ErrorCode, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::Internal,
        "An internal error occurred".to_string(),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use folio_core::outcome::JobError;
    use folio_core::rate_limit::RateLimitStatus;
    use http_body_util::BodyExt;
    use uuid::Uuid;

    use super::*;

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn status() -> RateLimitStatus {
        RateLimitStatus {
            limit: 20,
            remaining: 0,
            reset_after: Duration::from_secs(120),
        }
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after() {
        let err = AppError::Dispatch(DispatchError::RateLimited {
            retry_after: Duration::from_millis(5_500),
            status: status(),
        });
        let response = err.into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "6");
        let json = body_json(response).await;
        assert_eq!(json["code"], "RATE_LIMITED");
        assert_eq!(json["retryable"], true);
        assert_eq!(json["retry_after_secs"], 6);
    }

    #[tokio::test]
    async fn quota_exceeded_reports_reset() {
        let reset_at = chrono::Utc::now();
        let err = AppError::Dispatch(DispatchError::QuotaExceeded {
            remaining: 0,
            reset_at,
            status: status(),
        });
        let response = err.into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let json = body_json(response).await;
        assert_eq!(json["code"], "QUOTA_EXCEEDED");
        assert_eq!(json["retryable"], false);
        assert_eq!(json["remaining"], 0);
        assert!(json["reset_at"].is_string());
    }

    #[tokio::test]
    async fn busy_job_is_retryable_503() {
        let result = RenderResult::failed(
            Uuid::new_v4(),
            JobError::new(ErrorCode::Busy, "no worker"),
            10_000,
            None,
        );
        let response = AppError::JobFailed(Box::new(result)).into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
        let json = body_json(response).await;
        assert_eq!(json["code"], "BUSY");
        assert_eq!(json["retryable"], true);
    }

    #[tokio::test]
    async fn rejected_document_is_fatal_422() {
        let result = RenderResult::failed(
            Uuid::new_v4(),
            JobError::fatal(ErrorCode::RenderFailed, "bad markup"),
            3,
            None,
        );
        let response = AppError::JobFailed(Box::new(result)).into_response();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(response).await;
        assert_eq!(json["retryable"], false);
        assert_eq!(json["error"], "bad markup");
    }

    #[tokio::test]
    async fn internal_errors_are_sanitized() {
        let response = AppError::InternalError("disk on fire".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"], "An internal error occurred");
        assert_eq!(json["code"], "INTERNAL");
    }
}
