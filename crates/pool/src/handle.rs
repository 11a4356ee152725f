use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::engine::WorkerProcess;

/// Pool-unique worker identifier, displayed as `w-<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Active,
    Crashed,
}

/// A worker process plus the bookkeeping the pool needs to decide when to
/// lend, evict or retire it.
pub struct WorkerHandle {
    pub id: WorkerId,
    pub state: WorkerState,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub use_count: u32,
    pub process: Arc<dyn WorkerProcess>,
}

impl WorkerHandle {
    pub fn new(id: WorkerId, process: Arc<dyn WorkerProcess>, now: Instant) -> Self {
        Self {
            id,
            state: WorkerState::Idle,
            created_at: now,
            last_used_at: now,
            use_count: 0,
            process,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    /// Past its maximum age or use count and due for replacement.
    pub fn is_expired(&self, now: Instant, max_age: Duration, max_uses: u32) -> bool {
        self.age(now) >= max_age || self.use_count >= max_uses
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("use_count", &self.use_count)
            .finish_non_exhaustive()
    }
}
