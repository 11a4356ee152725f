#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use folio_api::config::ServerConfig;
use folio_api::engine::{AdmissionController, DispatchConfig, Dispatcher};
use folio_api::router::build_app_router;
use folio_api::state::AppState;
use folio_api::ws::WsManager;
use folio_core::caller::{CallerContext, StaticCallerDirectory};
use folio_core::error::CoreError;
use folio_core::job::{RenderJob, RenderSource};
use folio_core::quota::InMemoryLedger;
use folio_core::storage::{StorageSink, UploadMetadata};
use folio_core::tier::Tier;
use folio_pool::{EngineError, PoolConfig, PoolRegistry, RenderEngine, WorkerId, WorkerProcess};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Caller 1, free tier (burst of 20, 100 renders per month).
pub const FREE_KEY: &str = "free-test-key-0123456789";
/// Caller 2, pro tier.
pub const PRO_KEY: &str = "pro-test-key-0123456789";
/// Caller 3, pro tier with a quota of two renders.
pub const TINY_QUOTA_KEY: &str = "tiny-test-key-0123456789";

pub fn caller(id: i64) -> CallerContext {
    match id {
        1 => CallerContext::new(1, "free", Tier::Free),
        2 => CallerContext::new(2, "pro", Tier::Pro),
        _ => CallerContext::new(3, "tiny", Tier::Pro).with_quota(2),
    }
}

// ---------------------------------------------------------------------------
// Fake engine
// ---------------------------------------------------------------------------

/// Marker HTML understood by [`FakeEngine`] workers.
pub const CRASH: &str = "<!-- crash -->";
pub const CRASH_ONCE: &str = "<!-- crash-once -->";
pub const REJECT: &str = "<!-- reject -->";
pub const SLOW: &str = "<!-- slow -->";

/// Shared knobs and counters for every worker a [`FakeEngine`] launches.
pub struct EngineState {
    pub launch_delay: Duration,
    pub render_delay: Duration,
    pub slow_delay: Duration,
    pub launched: AtomicUsize,
    pub renders: AtomicUsize,
    pub closed: AtomicUsize,
    /// Renders marked [`CRASH_ONCE`] crash while this is above zero.
    pub crash_budget: AtomicUsize,
    /// Source text of every render attempt, in order.
    pub sources: Mutex<Vec<String>>,
}

impl EngineState {
    pub fn sources(&self) -> Vec<String> {
        self.sources.lock().unwrap().clone()
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            launch_delay: Duration::from_millis(30),
            render_delay: Duration::from_millis(10),
            slow_delay: Duration::from_secs(10),
            launched: AtomicUsize::new(0),
            renders: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            crash_budget: AtomicUsize::new(0),
            sources: Mutex::new(Vec::new()),
        }
    }
}

pub struct FakeEngine {
    state: Arc<EngineState>,
}

#[async_trait]
impl RenderEngine for FakeEngine {
    async fn launch(&self, _id: WorkerId) -> Result<Box<dyn WorkerProcess>, EngineError> {
        tokio::time::sleep(self.state.launch_delay).await;
        self.state.launched.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeProcess {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeProcess {
    state: Arc<EngineState>,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    async fn render(&self, job: &RenderJob) -> Result<Vec<u8>, EngineError> {
        let text = match &job.source {
            RenderSource::Html(html) => html.as_str(),
            RenderSource::Url(url) => url.as_str(),
        };
        self.state.sources.lock().unwrap().push(text.to_string());

        if text.contains(SLOW) {
            tokio::time::sleep(self.state.slow_delay).await;
        } else {
            tokio::time::sleep(self.state.render_delay).await;
        }
        self.state.renders.fetch_add(1, Ordering::SeqCst);

        if text.contains(CRASH) {
            return Err(EngineError::Crashed("worker exited with signal 11".into()));
        }
        if text.contains(CRASH_ONCE)
            && self
                .state
                .crash_budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(EngineError::Crashed("worker exited with signal 9".into()));
        }
        if text.contains(REJECT) {
            return Err(EngineError::Rejected("document could not be parsed".into()));
        }
        Ok(format!("%PDF-1.7 {}", job.id).into_bytes())
    }

    async fn close(&self) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// In-memory storage
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStorage {
    pub uploads: Mutex<Vec<(uuid::Uuid, usize)>>,
    pub fail: AtomicBool,
}

impl MemoryStorage {
    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

#[async_trait]
impl StorageSink for MemoryStorage {
    async fn upload(&self, bytes: Vec<u8>, metadata: &UploadMetadata) -> Result<String, CoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoreError::Internal("bucket unavailable".into()));
        }
        self.uploads
            .lock()
            .unwrap()
            .push((metadata.job_id, bytes.len()));
        Ok(format!(
            "https://files.test/{}/{}.pdf",
            metadata.partition, metadata.job_id
        ))
    }
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub engine: Arc<EngineState>,
    pub storage: Arc<MemoryStorage>,
    pub ledger: Arc<InMemoryLedger>,
}

/// Build a test `ServerConfig` with small pools and short deadlines.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 60,
        pool: PoolConfig {
            min_size: 2,
            max_size: 4,
            launch_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        },
        dispatch: DispatchConfig {
            acquire_timeout: Duration::from_secs(2),
            render_timeout: Duration::from_secs(3),
            max_batch_size: 100,
        },
        storage_dir: PathBuf::from("target/test-output"),
        ..ServerConfig::default()
    }
}

pub fn build_test_app() -> TestApp {
    build_test_app_with(test_config())
}

/// Build the full application router with fakes behind every seam.
///
/// Uses the same router builder as `main.rs` so integration tests exercise
/// the production middleware stack.
pub fn build_test_app_with(config: ServerConfig) -> TestApp {
    let engine = Arc::new(EngineState::default());
    let storage = Arc::new(MemoryStorage::default());
    let ledger = Arc::new(InMemoryLedger::new());

    let mut directory = StaticCallerDirectory::new();
    directory.insert(FREE_KEY, caller(1));
    directory.insert(PRO_KEY, caller(2));
    directory.insert(TINY_QUOTA_KEY, caller(3));

    let pools = PoolRegistry::new(
        Arc::new(FakeEngine {
            state: Arc::clone(&engine),
        }),
        config.pool.clone(),
    );
    let admission = Arc::new(AdmissionController::new(ledger.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&pools),
        admission,
        storage.clone(),
        config.dispatch.clone(),
    ));

    let config = Arc::new(config);
    let state = AppState {
        db: None,
        config: Arc::clone(&config),
        ws_manager: Arc::new(WsManager::new()),
        pools,
        dispatcher,
        directory: Arc::new(directory),
    };
    let router = build_app_router(state.clone(), &config).unwrap();

    TestApp {
        router,
        state,
        engine,
        storage,
        ledger,
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub async fn get(app: &Router, uri: &str, key: Option<&str>) -> Response<Body> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    app.clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn post_json(app: &Router, uri: &str, key: Option<&str>, body: Value) -> Response<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    app.clone()
        .oneshot(builder.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn header<'a>(response: &'a Response<Body>, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing header {name}"))
        .to_str()
        .unwrap()
}

pub fn html_job(html: &str) -> Value {
    serde_json::json!({ "html": html })
}
