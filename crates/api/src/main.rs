use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use folio_api::background;
use folio_api::config::{LogFormat, ServerConfig};
use folio_api::engine::{AdmissionController, Dispatcher};
use folio_api::router::build_app_router;
use folio_api::state::AppState;
use folio_api::storage::LocalStorageSink;
use folio_api::ws::{self, WsManager};
use folio_core::caller::{CallerDirectory, StaticCallerDirectory};
use folio_core::quota::{InMemoryLedger, UsageLedger};
use folio_db::{PgCallerDirectory, PgUsageLedger};
use folio_pool::{CommandEngine, PoolRegistry};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = ServerConfig::from_env().context("Invalid configuration")?;
    init_tracing(config.log_format);

    // --- Caller directory and usage ledger ---
    let (db, directory, ledger): (
        Option<folio_db::DbPool>,
        Arc<dyn CallerDirectory>,
        Arc<dyn UsageLedger>,
    ) = match &config.database_url {
        Some(database_url) => {
            let pool = folio_db::create_pool(database_url)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("Database connection pool created");

            folio_db::health_check(&pool)
                .await
                .context("Database health check failed")?;
            tracing::info!("Database health check passed");

            folio_db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Database migrations applied");

            (
                Some(pool.clone()),
                Arc::new(PgCallerDirectory::new(pool.clone())) as Arc<dyn CallerDirectory>,
                Arc::new(PgUsageLedger::new(pool)) as Arc<dyn UsageLedger>,
            )
        }
        None => {
            let directory =
                StaticCallerDirectory::parse(config.static_api_keys.as_deref().unwrap_or(""))
                    .context("Invalid STATIC_API_KEYS")?;
            tracing::warn!(
                keys = directory.len(),
                "DATABASE_URL not set, using static API keys and an in-memory usage ledger",
            );
            (
                None,
                Arc::new(directory) as Arc<dyn CallerDirectory>,
                Arc::new(InMemoryLedger::new()) as Arc<dyn UsageLedger>,
            )
        }
    };

    // --- Worker pools ---
    let engine = Arc::new(CommandEngine::new(config.engine.clone()));
    let pools = PoolRegistry::new(engine, config.pool.clone());
    let maintenance_handle = pools.start_maintenance();
    tracing::info!(
        min_size = config.pool.min_size,
        max_size = config.pool.max_size,
        binary = %config.engine.binary.display(),
        "Worker pool registry started",
    );

    // --- Admission and dispatch ---
    let admission = Arc::new(AdmissionController::new(ledger));
    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.storage_dir.display()))?;
    let storage = Arc::new(LocalStorageSink::new(
        &config.storage_dir,
        &config.public_base_url,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&pools),
        Arc::clone(&admission),
        storage,
        config.dispatch.clone(),
    ));

    // --- Background tasks ---
    let background_cancel = CancellationToken::new();
    let prune_handle = tokio::spawn(background::rate_buckets::run(
        admission,
        background::rate_buckets::PRUNE_INTERVAL,
        background_cancel.clone(),
    ));

    let ws_manager = Arc::new(WsManager::new());
    let heartbeat_handle = ws::start_heartbeat(
        Arc::clone(&ws_manager),
        config.session.clone(),
        background_cancel.clone(),
    );

    // --- Router ---
    let config = Arc::new(config);
    let state = AppState {
        db,
        config: Arc::clone(&config),
        ws_manager: Arc::clone(&ws_manager),
        pools: Arc::clone(&pools),
        dispatcher,
        directory,
    };
    let app = build_app_router(state, &config).context("Failed to build router")?;

    // --- Start server ---
    let host = config
        .host
        .parse::<IpAddr>()
        .with_context(|| format!("Invalid HOST address '{}'", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    let cleanup = async {
        let ws_count = ws_manager.connection_count().await;
        tracing::info!(ws_count, "Closing remaining sessions");
        ws_manager.shutdown_all().await;

        background_cancel.cancel();
        let _ = heartbeat_handle.await;
        let _ = prune_handle.await;
        tracing::info!("Background tasks stopped");

        pools.shutdown().await;
        let _ = maintenance_handle.await;
        tracing::info!("Worker pools shut down");
    };
    if tokio::time::timeout(Duration::from_secs(config.shutdown_timeout_secs), cleanup)
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = config.shutdown_timeout_secs,
            "Cleanup did not finish in time",
        );
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "folio_api=debug,folio_pool=debug,tower_http=debug".into());
    let json = format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager (e.g. systemd, Docker, Kubernetes).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
