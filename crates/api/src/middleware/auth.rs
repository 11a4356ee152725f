//! API-key authentication extractor for Axum handlers.

use std::ops::Deref;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use folio_core::api_keys::{bearer_token, extract_prefix, hash_api_key, plausible_key};
use folio_core::caller::CallerContext;
use folio_core::error::CoreError;

use crate::error::AppError;
use crate::state::AppState;

/// Alternate header carrying the raw key.
pub const X_API_KEY: &str = "x-api-key";

/// Authenticated caller, resolved from `Authorization: Bearer <key>` or
/// `X-API-Key: <key>`.
///
/// ```ignore
/// async fn my_handler(caller: AuthCaller) -> AppResult<Json<()>> {
///     tracing::info!(caller_id = caller.caller_id, tier = caller.tier.name(), "handling request");
///     Ok(Json(()))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AuthCaller(pub CallerContext);

impl Deref for AuthCaller {
    type Target = CallerContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromRequestParts<AppState> for AuthCaller {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let key = key_from_headers(&parts.headers).ok_or_else(|| {
            AppError::Core(CoreError::Unauthorized(
                "Missing API key. Expected: Authorization: Bearer <key> or X-API-Key".into(),
            ))
        })?;

        authenticate(state, key).await.map(AuthCaller)
    }
}

/// Raw key from the `Authorization` or `X-API-Key` header, if present.
pub fn key_from_headers(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        return bearer_token(value);
    }
    headers
        .get(X_API_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

/// Resolve a plaintext key to its caller.
pub async fn authenticate(state: &AppState, key: &str) -> Result<CallerContext, AppError> {
    let unauthorized = || AppError::Core(CoreError::Unauthorized("Invalid API key".into()));

    let key = plausible_key(key).ok_or_else(unauthorized)?;
    let Some(caller) = state.directory.resolve(&hash_api_key(key)).await? else {
        tracing::debug!(key_prefix = extract_prefix(key), "Unknown API key");
        return Err(unauthorized());
    };

    tracing::debug!(caller_id = caller.caller_id, tier = caller.tier.name(), "Caller authenticated");
    Ok(caller)
}
