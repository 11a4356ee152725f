//! Deterministic pool bookkeeping.
//!
//! [`PoolState`] owns the worker arena for one partition and decides, for
//! every event, which waiters receive which workers, which workers must be
//! launched and which must be closed. It performs no I/O and reads no clock:
//! the actor supplies `now` and carries out the returned [`Effects`].
//!
//! Ordering rules:
//! - acquires take the most recently used idle worker (back of `idle`),
//! - eviction starts from the least recently used (front of `idle`),
//! - waiters are served strictly first come, first served,
//! - launches in progress count toward `max_size`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use folio_core::types::PartitionKey;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

use crate::config::PoolConfig;
use crate::engine::{EngineError, WorkerProcess};
use crate::error::PoolError;
use crate::handle::{WorkerHandle, WorkerId, WorkerState};

/// Something queued for a worker.
pub trait Waiter {
    /// True once nobody is listening for the grant any more.
    fn is_abandoned(&self) -> bool;
}

impl<T> Waiter for oneshot::Sender<T> {
    fn is_abandoned(&self) -> bool {
        self.is_closed()
    }
}

/// Work the actor must carry out after a state transition.
#[derive(Debug)]
pub struct Effects<W> {
    /// Workers handed to waiters; the workers are already marked active.
    pub grants: Vec<(W, WorkerId)>,
    /// Ids reserved for new workers that must now be launched.
    pub launches: Vec<WorkerId>,
    /// Workers removed from the pool whose processes must be closed.
    pub close: Vec<WorkerHandle>,
    /// Waiters that will never be served.
    pub rejected: Vec<(W, PoolError)>,
}

impl<W> Effects<W> {
    fn new() -> Self {
        Self {
            grants: Vec::new(),
            launches: Vec::new(),
            close: Vec::new(),
            rejected: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
            && self.launches.is_empty()
            && self.close.is_empty()
            && self.rejected.is_empty()
    }
}

/// Lifetime counters for one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounters {
    pub launched: u64,
    pub launch_failures: u64,
    pub crashed: u64,
    pub retired: u64,
    pub evicted: u64,
    pub served: u64,
}

/// Point-in-time view of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub partition: PartitionKey,
    pub min_size: usize,
    pub max_size: usize,
    pub idle: usize,
    pub active: usize,
    pub launching: usize,
    pub waiting: usize,
    pub draining: bool,
    /// Seconds since the last acquire or release.
    pub idle_for_secs: u64,
    pub counters: PoolCounters,
}

impl PoolStats {
    /// No active workers, no waiters, no launches in flight.
    pub fn is_quiescent(&self) -> bool {
        self.active == 0 && self.waiting == 0 && self.launching == 0
    }
}

pub struct PoolState<W> {
    config: PoolConfig,
    handles: HashMap<WorkerId, WorkerHandle>,
    idle: VecDeque<WorkerId>,
    launching: HashSet<WorkerId>,
    waiters: VecDeque<W>,
    next_id: u64,
    draining: bool,
    last_activity: Instant,
    counters: PoolCounters,
}

impl<W: Waiter> PoolState<W> {
    pub fn new(config: PoolConfig, now: Instant) -> Self {
        Self {
            config: config.normalized(),
            handles: HashMap::new(),
            idle: VecDeque::new(),
            launching: HashSet::new(),
            waiters: VecDeque::new(),
            next_id: 1,
            draining: false,
            last_activity: now,
            counters: PoolCounters::default(),
        }
    }

    // ---- accessors ----

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn active_count(&self) -> usize {
        self.handles.len() - self.idle.len()
    }

    pub fn launching_count(&self) -> usize {
        self.launching.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiters.len()
    }

    /// Workers that exist or are being launched.
    pub fn total(&self) -> usize {
        self.handles.len() + self.launching.len()
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Draining and nothing left to wait for.
    pub fn is_finished(&self) -> bool {
        self.draining && self.handles.is_empty() && self.launching.is_empty()
    }

    pub fn counters(&self) -> PoolCounters {
        self.counters
    }

    pub fn handle(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.handles.get(&id)
    }

    pub fn process(&self, id: WorkerId) -> Option<Arc<dyn WorkerProcess>> {
        self.handles.get(&id).map(|h| Arc::clone(&h.process))
    }

    pub fn stats(&self, partition: &PartitionKey, now: Instant) -> PoolStats {
        PoolStats {
            partition: partition.clone(),
            min_size: self.config.min_size,
            max_size: self.config.max_size,
            idle: self.idle_count(),
            active: self.active_count(),
            launching: self.launching_count(),
            waiting: self.waiting_count(),
            draining: self.draining,
            idle_for_secs: now.saturating_duration_since(self.last_activity).as_secs(),
            counters: self.counters,
        }
    }

    // ---- transitions ----

    /// Launch workers up to `min_size`.
    pub fn prewarm(&mut self) -> Effects<W> {
        let mut fx = Effects::new();
        self.fill(&mut fx);
        fx
    }

    /// Queue a waiter and serve it immediately if an idle worker exists.
    /// Otherwise launch a worker if below `max_size`; at the bound the
    /// waiter stays queued until a release hands one over.
    pub fn acquire(&mut self, waiter: W, now: Instant) -> Effects<W> {
        let mut fx = Effects::new();
        if self.draining {
            fx.rejected.push((waiter, PoolError::Closed));
            return fx;
        }
        self.last_activity = now;
        self.waiters.push_back(waiter);
        self.serve_waiters(now, &mut fx);
        self.fill(&mut fx);
        fx
    }

    /// Return an active worker. Hands it straight to the oldest waiter, or
    /// parks it idle, or retires it if it has reached its age or use limit.
    pub fn release(&mut self, id: WorkerId, now: Instant) -> Effects<W> {
        let mut fx = Effects::new();
        let Some(handle) = self.handles.get_mut(&id) else {
            return fx;
        };
        if handle.state != WorkerState::Active {
            return fx;
        }
        handle.state = WorkerState::Idle;
        handle.last_used_at = now;
        handle.use_count = handle.use_count.saturating_add(1);
        let expired = handle.is_expired(now, self.config.max_age, self.config.max_uses);

        self.counters.served += 1;
        self.last_activity = now;

        if self.draining || expired {
            if let Some(handle) = self.handles.remove(&id) {
                if !self.draining {
                    self.counters.retired += 1;
                }
                fx.close.push(handle);
            }
        } else {
            self.idle.push_back(id);
            self.serve_waiters(now, &mut fx);
        }
        self.fill(&mut fx);
        fx
    }

    /// Drop a worker that failed mid-render and launch a replacement if the
    /// pool fell below `min_size` or waiters are queued.
    pub fn crashed(&mut self, id: WorkerId, now: Instant) -> Effects<W> {
        let mut fx = Effects::new();
        let Some(mut handle) = self.handles.remove(&id) else {
            return fx;
        };
        self.idle.retain(|idle_id| *idle_id != id);
        handle.state = WorkerState::Crashed;
        self.counters.crashed += 1;
        self.last_activity = now;
        fx.close.push(handle);
        self.fill(&mut fx);
        fx
    }

    /// Record the outcome of a launch started by an earlier transition.
    ///
    /// A failed launch does not trigger another launch; it fails one waiter
    /// instead if there are more waiters than launches still in flight.
    /// The next sweep restores `min_size`.
    pub fn launched(
        &mut self,
        id: WorkerId,
        result: Result<Arc<dyn WorkerProcess>, EngineError>,
        now: Instant,
    ) -> Effects<W> {
        let mut fx = Effects::new();
        let expected = self.launching.remove(&id);

        match result {
            Ok(process) => {
                let handle = WorkerHandle::new(id, process, now);
                if !expected || self.draining {
                    fx.close.push(handle);
                    return fx;
                }
                self.counters.launched += 1;
                self.handles.insert(id, handle);
                self.idle.push_back(id);
                self.serve_waiters(now, &mut fx);
                self.fill(&mut fx);
            }
            Err(e) => {
                if !expected {
                    return fx;
                }
                self.counters.launch_failures += 1;
                if self.waiters.len() > self.launching.len() {
                    if let Some(waiter) = self.pop_live_waiter() {
                        fx.rejected.push((waiter, PoolError::LaunchFailed(e.to_string())));
                    }
                }
            }
        }
        fx
    }

    /// Periodic maintenance: retire expired idle workers, close workers idle
    /// longer than `idle_timeout` (least recently used first, never below
    /// `min_size`), forget abandoned waiters and top the pool back up.
    pub fn sweep(&mut self, now: Instant) -> Effects<W> {
        let mut fx = Effects::new();
        if self.draining {
            return fx;
        }
        self.waiters.retain(|w| !w.is_abandoned());

        let (max_age, max_uses) = (self.config.max_age, self.config.max_uses);
        let idle = std::mem::take(&mut self.idle);
        for id in idle {
            let expired = self
                .handles
                .get(&id)
                .is_some_and(|h| h.is_expired(now, max_age, max_uses));
            if expired {
                if let Some(handle) = self.handles.remove(&id) {
                    self.counters.retired += 1;
                    fx.close.push(handle);
                }
            } else {
                self.idle.push_back(id);
            }
        }

        while let Some(&id) = self.idle.front() {
            if self.total() <= self.config.min_size {
                break;
            }
            let stale = self
                .handles
                .get(&id)
                .map_or(true, |h| h.idle_for(now) > self.config.idle_timeout);
            if !stale {
                break;
            }
            self.idle.pop_front();
            if let Some(handle) = self.handles.remove(&id) {
                self.counters.evicted += 1;
                fx.close.push(handle);
            }
        }

        self.fill(&mut fx);
        fx
    }

    /// Stop lending. Queued waiters are rejected and idle workers closed;
    /// active workers are closed as they come back.
    pub fn shutdown(&mut self) -> Effects<W> {
        let mut fx = Effects::new();
        self.draining = true;
        for waiter in self.waiters.drain(..) {
            fx.rejected.push((waiter, PoolError::Closed));
        }
        for id in self.idle.drain(..) {
            if let Some(handle) = self.handles.remove(&id) {
                fx.close.push(handle);
            }
        }
        fx
    }

    // ---- private helpers ----

    fn next_worker_id(&mut self) -> WorkerId {
        let id = WorkerId(self.next_id);
        self.next_id += 1;
        id
    }

    fn pop_live_waiter(&mut self) -> Option<W> {
        while let Some(waiter) = self.waiters.pop_front() {
            if !waiter.is_abandoned() {
                return Some(waiter);
            }
        }
        None
    }

    /// Take the most recently used idle worker, retiring expired ones on
    /// the way.
    fn take_idle(&mut self, now: Instant, fx: &mut Effects<W>) -> Option<WorkerId> {
        while let Some(id) = self.idle.pop_back() {
            let Some(handle) = self.handles.get_mut(&id) else {
                continue;
            };
            if handle.is_expired(now, self.config.max_age, self.config.max_uses) {
                if let Some(handle) = self.handles.remove(&id) {
                    self.counters.retired += 1;
                    fx.close.push(handle);
                }
                continue;
            }
            handle.state = WorkerState::Active;
            return Some(id);
        }
        None
    }

    fn serve_waiters(&mut self, now: Instant, fx: &mut Effects<W>) {
        while !self.idle.is_empty() {
            let Some(waiter) = self.pop_live_waiter() else {
                break;
            };
            match self.take_idle(now, fx) {
                Some(id) => fx.grants.push((waiter, id)),
                None => {
                    self.waiters.push_front(waiter);
                    break;
                }
            }
        }
    }

    /// Launch for unmet demand and up to `min_size`, never past `max_size`.
    fn fill(&mut self, fx: &mut Effects<W>) {
        if self.draining {
            return;
        }
        self.waiters.retain(|w| !w.is_abandoned());
        while self.total() < self.config.max_size
            && (self.launching.len() < self.waiters.len() || self.total() < self.config.min_size)
        {
            let id = self.next_worker_id();
            self.launching.insert(id);
            fx.launches.push(id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
