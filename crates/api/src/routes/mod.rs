pub mod health;
pub mod pools;
pub mod render;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /session                                         WebSocket session (GET upgrade)
///
/// /render                                          single job (POST)
/// /render/batch                                    ordered batch (POST)
///
/// /pools                                           caller's pool and usage (GET)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/session", get(ws::session_handler))
        .merge(render::router())
        .merge(pools::router())
}
