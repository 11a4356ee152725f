//! Folio render dispatcher server library.
//!
//! Exposes the building blocks (config, state, error handling, admission and
//! dispatch, routes, session infrastructure) so integration tests and the
//! binary entrypoint can both access them.

pub mod background;
pub mod config;
pub mod engine;
pub mod error;
pub mod middleware;
pub mod response;
pub mod router;
pub mod routes;
pub mod state;
pub mod storage;
pub mod ws;
