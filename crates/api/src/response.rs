//! Response parts shared by the render routes.

use std::convert::Infallible;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue};
use axum::response::{IntoResponseParts, ResponseParts};
use folio_core::rate_limit::RateLimitStatus;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// `x-ratelimit-*` headers describing the caller's bucket.
///
/// `x-ratelimit-reset` is the Unix time, in seconds, at which the bucket
/// will be full again.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitHeaders(pub RateLimitStatus);

impl IntoResponseParts for RateLimitHeaders {
    type Error = Infallible;

    fn into_response_parts(self, mut res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        let status = self.0;
        let headers = res.headers_mut();
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(status.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(status.remaining));
        headers.insert(
            X_RATELIMIT_RESET,
            HeaderValue::from(reset_epoch_secs(status.reset_after)),
        );
        Ok(res)
    }
}

/// Unix time at which a bucket needing `reset_after` to refill is full.
pub fn reset_epoch_secs(reset_after: Duration) -> i64 {
    let reset_after = reset_after.as_secs_f64().ceil() as i64;
    chrono::Utc::now().timestamp() + reset_after
}

/// Whole seconds a client should wait, never zero.
pub fn retry_after_secs(wait: Duration) -> u64 {
    (wait.as_secs_f64().ceil() as u64).max(1)
}
