//! Lazily created pools, one per partition, plus their maintenance task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use folio_core::types::PartitionKey;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::actor::WorkerPool;
use crate::config::PoolConfig;
use crate::engine::RenderEngine;
use crate::state::PoolStats;

/// Owns every partition's [`WorkerPool`].
///
/// Created once at startup; the returned `Arc` is shared through the
/// application state.
pub struct PoolRegistry {
    pools: RwLock<HashMap<PartitionKey, WorkerPool>>,
    engine: Arc<dyn RenderEngine>,
    config: PoolConfig,
    cancel: CancellationToken,
}

impl PoolRegistry {
    pub fn new(engine: Arc<dyn RenderEngine>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            pools: RwLock::new(HashMap::new()),
            engine,
            config: config.normalized(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The partition's pool, started (and prewarmed) on first use.
    pub async fn get_or_create(&self, partition: &PartitionKey) -> WorkerPool {
        if let Some(pool) = self.pools.read().await.get(partition) {
            if !pool.is_closed() {
                return pool.clone();
            }
        }

        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(partition) {
            if !pool.is_closed() {
                return pool.clone();
            }
        }

        tracing::info!(partition = %partition, "Creating worker pool");
        let pool = WorkerPool::spawn(
            partition.clone(),
            self.config.clone(),
            Arc::clone(&self.engine),
        );
        pools.insert(partition.clone(), pool.clone());
        pool
    }

    pub async fn get(&self, partition: &PartitionKey) -> Option<WorkerPool> {
        self.pools.read().await.get(partition).cloned()
    }

    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }

    pub async fn stats(&self, partition: &PartitionKey) -> Option<PoolStats> {
        let pool = self.get(partition).await?;
        pool.stats().await.ok()
    }

    /// One maintenance pass: sweep every pool, then tear down pools that
    /// have had no work for `teardown_after`.
    pub async fn maintain(&self) {
        let pools: Vec<WorkerPool> = self.pools.read().await.values().cloned().collect();
        let mut idle = Vec::new();

        for pool in pools {
            pool.sweep();
            match pool.stats().await {
                Ok(stats)
                    if stats.is_quiescent()
                        && Duration::from_secs(stats.idle_for_secs) >= self.config.teardown_after =>
                {
                    idle.push(pool);
                }
                Ok(_) => {}
                Err(_) => idle.push(pool),
            }
        }

        for pool in idle {
            let removed = {
                let mut pools = self.pools.write().await;
                match pools.get(pool.partition()) {
                    Some(current) if current.same_actor(&pool) => pools.remove(pool.partition()),
                    _ => None,
                }
            };
            if let Some(pool) = removed {
                tracing::info!(partition = %pool.partition(), "Tearing down idle worker pool");
                pool.shutdown().await;
            }
        }
    }

    /// Spawn the periodic maintenance loop. Runs until [`shutdown`] is
    /// called.
    ///
    /// [`shutdown`]: Self::shutdown
    pub fn start_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let period = registry.config.sweep_interval;
            tracing::info!(interval_secs = period.as_secs(), "Pool maintenance started");

            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Pool maintenance stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        registry.maintain().await;
                    }
                }
            }
        })
    }

    /// Stop maintenance and drain every pool.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let pools: Vec<WorkerPool> = {
            let mut pools = self.pools.write().await;
            pools.drain().map(|(_, pool)| pool).collect()
        };
        tracing::info!(count = pools.len(), "Shutting down worker pools");
        for pool in pools {
            pool.shutdown().await;
        }
    }
}
