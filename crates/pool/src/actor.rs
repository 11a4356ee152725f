//! The per-partition pool actor and its client handle.
//!
//! [`WorkerPool::spawn`] starts one task that owns a [`PoolState`] and
//! processes [`PoolCommand`]s in arrival order. Launches and closes run on
//! their own tasks and report back through the same mailbox, so the actor
//! never blocks on a worker process.

use std::sync::Arc;
use std::time::Duration;

use folio_core::job::RenderJob;
use folio_core::types::PartitionKey;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::engine::{EngineError, RenderEngine, WorkerProcess};
use crate::error::PoolError;
use crate::handle::WorkerId;
use crate::state::{Effects, PoolState, PoolStats};

type AcquireReply = oneshot::Sender<Result<Lease, PoolError>>;

/// Messages accepted by the pool actor.
enum PoolCommand {
    Acquire { reply: AcquireReply },
    Release { id: WorkerId },
    Crashed { id: WorkerId },
    Launched {
        id: WorkerId,
        result: Result<Box<dyn WorkerProcess>, EngineError>,
    },
    Sweep,
    Stats { reply: oneshot::Sender<PoolStats> },
    Shutdown { reply: oneshot::Sender<()> },
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Exclusive use of one worker for the duration of a render.
///
/// Dropping a lease returns the worker to the pool. Use
/// [`report_crashed`](Self::report_crashed) instead when the worker failed.
pub struct Lease {
    id: WorkerId,
    partition: PartitionKey,
    process: Arc<dyn WorkerProcess>,
    tx: mpsc::UnboundedSender<PoolCommand>,
    returned: bool,
}

impl Lease {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub async fn render(&self, job: &RenderJob) -> Result<Vec<u8>, EngineError> {
        self.process.render(job).await
    }

    /// Return the worker to the pool.
    pub fn release(mut self) {
        self.returned = true;
        let _ = self.tx.send(PoolCommand::Release { id: self.id });
    }

    /// Tell the pool the worker is unusable. It is closed and replaced.
    pub fn report_crashed(mut self) {
        self.returned = true;
        tracing::warn!(
            partition = %self.partition,
            worker_id = %self.id,
            "Worker reported crashed",
        );
        let _ = self.tx.send(PoolCommand::Crashed { id: self.id });
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.returned {
            let _ = self.tx.send(PoolCommand::Release { id: self.id });
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("partition", &self.partition)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Client handle
// ---------------------------------------------------------------------------

/// Cheaply cloneable handle to one partition's pool actor.
#[derive(Clone)]
pub struct WorkerPool {
    partition: PartitionKey,
    max_size: usize,
    tx: mpsc::UnboundedSender<PoolCommand>,
}

impl WorkerPool {
    /// Start the actor and begin warming `min_size` workers.
    pub fn spawn(
        partition: PartitionKey,
        config: PoolConfig,
        engine: Arc<dyn RenderEngine>,
    ) -> Self {
        let config = config.normalized();
        let max_size = config.max_size;
        let (tx, rx) = mpsc::unbounded_channel();

        let actor = PoolActor {
            partition: partition.clone(),
            launch_timeout: config.launch_timeout,
            state: PoolState::new(config, Instant::now()),
            engine,
            tx: tx.downgrade(),
            rx,
        };
        tokio::spawn(actor.run());

        Self {
            partition,
            max_size,
            tx,
        }
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    /// Upper bound on concurrent leases; batch fan-out uses it as its width.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Wait up to `wait` for a worker.
    pub async fn acquire(&self, wait: Duration) -> Result<Lease, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Acquire { reply })
            .map_err(|_| PoolError::Closed)?;

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::Closed),
            // Dropping `rx` abandons the queue entry. A lease granted in the
            // meantime is dropped with the channel and returns itself.
            Err(_) => Err(PoolError::Timeout(wait)),
        }
    }

    /// Ask the actor to run a maintenance sweep.
    pub fn sweep(&self) {
        let _ = self.tx.send(PoolCommand::Sweep);
    }

    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Stats { reply })
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    /// Reject waiters, close idle workers and stop accepting acquires.
    /// Resolves once idle workers are closed; leased workers are closed as
    /// their leases end.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PoolCommand::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// True once the actor has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both handles talk to the same actor.
    pub fn same_actor(&self, other: &WorkerPool) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("partition", &self.partition)
            .field("max_size", &self.max_size)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct PoolActor {
    partition: PartitionKey,
    launch_timeout: Duration,
    state: PoolState<AcquireReply>,
    engine: Arc<dyn RenderEngine>,
    /// Weak so the actor exits once every client handle and lease is gone.
    tx: mpsc::WeakUnboundedSender<PoolCommand>,
    rx: mpsc::UnboundedReceiver<PoolCommand>,
}

impl PoolActor {
    async fn run(mut self) {
        tracing::info!(
            partition = %self.partition,
            min_size = self.state.config().min_size,
            max_size = self.state.config().max_size,
            "Worker pool started",
        );

        let fx = self.state.prewarm();
        self.apply(fx).await;

        while let Some(command) = self.rx.recv().await {
            let now = Instant::now();
            let fx = match command {
                PoolCommand::Acquire { reply } => self.state.acquire(reply, now),
                PoolCommand::Release { id } => self.state.release(id, now),
                PoolCommand::Crashed { id } => self.state.crashed(id, now),
                PoolCommand::Launched { id, result } => {
                    if let Err(e) = &result {
                        tracing::error!(
                            partition = %self.partition,
                            worker_id = %id,
                            error = %e,
                            "Worker launch failed",
                        );
                    } else {
                        tracing::debug!(partition = %self.partition, worker_id = %id, "Worker launched");
                    }
                    self.state.launched(id, result.map(Arc::from), now)
                }
                PoolCommand::Sweep => self.state.sweep(now),
                PoolCommand::Stats { reply } => {
                    let _ = reply.send(self.state.stats(&self.partition, now));
                    continue;
                }
                PoolCommand::Shutdown { reply } => {
                    tracing::info!(partition = %self.partition, "Worker pool draining");
                    let fx = self.state.shutdown();
                    self.apply(fx).await;
                    let _ = reply.send(());
                    if self.state.is_finished() {
                        break;
                    }
                    continue;
                }
            };
            self.apply(fx).await;

            if self.state.is_finished() {
                break;
            }
        }

        // Anything still parked when the last handle went away.
        let fx = self.state.shutdown();
        self.apply(fx).await;
        tracing::info!(partition = %self.partition, "Worker pool stopped");
    }

    async fn apply(&mut self, fx: Effects<AcquireReply>) {
        for (reply, id) in fx.grants {
            let (Some(process), Some(tx)) = (self.state.process(id), self.tx.upgrade()) else {
                continue;
            };
            let lease = Lease {
                id,
                partition: self.partition.clone(),
                process,
                tx,
                returned: false,
            };
            // If the caller gave up, the returned lease is dropped here and
            // queues its own release.
            let _ = reply.send(Ok(lease));
        }

        for (reply, error) in fx.rejected {
            let _ = reply.send(Err(error));
        }

        for id in fx.launches {
            self.spawn_launch(id);
        }

        if fx.close.is_empty() {
            return;
        }
        let closing: Vec<_> = fx
            .close
            .into_iter()
            .map(|handle| {
                tracing::debug!(
                    partition = %self.partition,
                    worker_id = %handle.id,
                    state = ?handle.state,
                    use_count = handle.use_count,
                    "Closing worker",
                );
                let process = handle.process;
                tokio::spawn(async move { process.close().await })
            })
            .collect();
        if self.state.is_draining() {
            for task in closing {
                let _ = task.await;
            }
        }
    }

    fn spawn_launch(&self, id: WorkerId) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let engine = Arc::clone(&self.engine);
        let launch_timeout = self.launch_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(launch_timeout, engine.launch(id)).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout(launch_timeout)),
            };
            let _ = tx.send(PoolCommand::Launched { id, result });
        });
    }
}
