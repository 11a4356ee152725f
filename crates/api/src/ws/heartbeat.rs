use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::ws::manager::WsManager;

/// Spawn a background task that pings every session and closes the ones
/// that went quiet.
///
/// Each tick first closes sessions past the silence timeout or the
/// inactivity window, then pings the rest. Runs until `cancel` fires.
pub fn start_heartbeat(
    ws_manager: Arc<WsManager>,
    config: SessionConfig,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.ping_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Session heartbeat stopping");
                    break;
                }
                _ = interval.tick() => {
                    let closed = ws_manager
                        .close_stale(config.silence_timeout, config.max_inactivity)
                        .await;
                    let count = ws_manager.connection_count().await;
                    tracing::debug!(count, closed = closed.len(), "Session heartbeat ping");
                    ws_manager.ping_all().await;
                }
            }
        }
    })
}
