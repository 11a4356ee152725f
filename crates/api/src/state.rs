use std::sync::Arc;

use folio_core::caller::CallerDirectory;
use folio_pool::PoolRegistry;

use crate::config::ServerConfig;
use crate::engine::Dispatcher;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool, when a database is configured.
    pub db: Option<folio_db::DbPool>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Persistent session connections.
    pub ws_manager: Arc<WsManager>,
    /// Per-partition worker pools.
    pub pools: Arc<PoolRegistry>,
    /// Admission and render dispatch.
    pub dispatcher: Arc<Dispatcher>,
    /// API key to caller resolution.
    pub directory: Arc<dyn CallerDirectory>,
}
