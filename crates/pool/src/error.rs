use std::time::Duration;

/// Failures a caller can see from [`WorkerPool`](crate::WorkerPool).
///
/// Pool-internal detail (worker ids, partition keys) is logged where it
/// happens; callers only learn whether to retry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    /// No worker became available within the wait deadline.
    #[error("No worker available within {0:?}")]
    Timeout(Duration),

    /// The pool is shutting down or has been torn down.
    #[error("Worker pool is closed")]
    Closed,

    /// The launch this acquire was waiting on failed.
    #[error("Worker launch failed: {0}")]
    LaunchFailed(String),
}
