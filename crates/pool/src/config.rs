use std::time::Duration;

/// Sizing and lifecycle limits shared by every partition's pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Warm workers kept per partition.
    pub min_size: usize,
    /// Hard bound on workers per partition, launches in progress included.
    pub max_size: usize,
    /// Idle workers above `min_size` are closed after this long unused.
    pub idle_timeout: Duration,
    /// Workers are retired once this old.
    pub max_age: Duration,
    /// Workers are retired after this many renders.
    pub max_uses: u32,
    /// Upper bound on a single cold start.
    pub launch_timeout: Duration,
    /// How often the maintenance task sweeps every pool.
    pub sweep_interval: Duration,
    /// Pools with no work for this long are torn down entirely.
    pub teardown_after: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 8,
            max_size: 16,
            idle_timeout: Duration::from_secs(5 * 60),
            max_age: Duration::from_secs(30 * 60),
            max_uses: 500,
            launch_timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(30),
            teardown_after: Duration::from_secs(30 * 60),
        }
    }
}

impl PoolConfig {
    /// Clamp inconsistent values: at least one worker, and `min <= max`.
    pub fn normalized(mut self) -> Self {
        self.max_size = self.max_size.max(1);
        self.min_size = self.min_size.min(self.max_size);
        self.max_uses = self.max_uses.max(1);
        self
    }
}
