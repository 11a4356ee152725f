//! Domain types and pure logic for the Folio render dispatcher.
//!
//! This crate has no I/O of its own beyond the in-memory collaborators. It
//! holds the job model, admission math (token buckets, quota decisions), the
//! collaborator traits implemented by the database and HTTP layers, and the
//! pipeline planner used by session calls.

pub mod api_keys;
pub mod batch;
pub mod caller;
pub mod error;
pub mod hashing;
pub mod job;
pub mod outcome;
pub mod pipeline;
pub mod quota;
pub mod rate_limit;
pub mod storage;
pub mod tier;
pub mod types;
