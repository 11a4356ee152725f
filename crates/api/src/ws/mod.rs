//! Persistent sessions for batch and pipelined calls.
//!
//! Provides connection management, heartbeat monitoring, the JSON frame
//! protocol and the HTTP upgrade handler used by Axum routes.

mod handler;
mod heartbeat;
pub mod manager;
pub mod protocol;

pub use handler::session_handler;
pub use heartbeat::start_heartbeat;
pub use manager::WsManager;
