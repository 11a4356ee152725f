//! Warm pools of render worker processes.
//!
//! Each partition owns one [`WorkerPool`]: an actor task that holds the
//! partition's [`PoolState`] and serialises every acquire, release, crash
//! report and sweep through a single mailbox. Callers receive a [`Lease`]
//! for the duration of one render. The [`PoolRegistry`] creates pools
//! lazily, runs the periodic maintenance sweep and tears idle pools down.

pub mod actor;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod registry;
pub mod state;

pub use actor::{Lease, WorkerPool};
pub use command::{CommandEngine, CommandEngineConfig};
pub use config::PoolConfig;
pub use engine::{EngineError, RenderEngine, WorkerProcess};
pub use error::PoolError;
pub use handle::{WorkerHandle, WorkerId, WorkerState};
pub use registry::PoolRegistry;
pub use state::{PoolCounters, PoolState, PoolStats};
