//! Seams between the pool and the rendering backend.

use std::time::Duration;

use async_trait::async_trait;
use folio_core::job::RenderJob;

use crate::handle::WorkerId;

/// Errors raised by a render engine or one of its worker processes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The worker process died or produced no output. The handle must not
    /// be reused.
    #[error("Worker crashed: {0}")]
    Crashed(String),

    /// The document itself was rejected. Retrying on another worker will
    /// not help.
    #[error("Render rejected: {0}")]
    Rejected(String),

    /// A new worker could not be started.
    #[error("Worker launch failed: {0}")]
    Launch(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl EngineError {
    /// Whether the failure poisons the worker that produced it.
    pub fn is_worker_fault(&self) -> bool {
        matches!(self, Self::Crashed(_) | Self::Timeout(_))
    }
}

/// Starts worker processes.
#[async_trait]
pub trait RenderEngine: Send + Sync {
    /// Launch a new worker. This is the expensive cold start the pool exists
    /// to amortise.
    async fn launch(&self, id: WorkerId) -> Result<Box<dyn WorkerProcess>, EngineError>;
}

/// One running worker.
#[async_trait]
pub trait WorkerProcess: Send + Sync {
    /// Render one job to PDF bytes.
    async fn render(&self, job: &RenderJob) -> Result<Vec<u8>, EngineError>;

    /// Release every resource held by the worker. Called exactly once, after
    /// the pool has stopped lending it.
    async fn close(&self);
}
