//! Unit tests for `WsManager`.
//!
//! These tests exercise the session manager directly, without performing any
//! HTTP upgrades. They verify add/remove semantics, pings, stale-session
//! detection and shutdown.

use std::time::Duration;

use axum::extract::ws::Message;
use folio_api::ws::manager::StaleReason;
use folio_api::ws::WsManager;

const SILENCE: Duration = Duration::from_secs(90);
const INACTIVITY: Duration = Duration::from_secs(1800);

// ---------------------------------------------------------------------------
// Test: new manager starts with zero connections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn new_manager_has_zero_connections() {
    let manager = WsManager::new();

    assert_eq!(manager.connection_count().await, 0);
}

// ---------------------------------------------------------------------------
// Test: add() and remove() track the connection count
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_and_remove_track_count() {
    let manager = WsManager::new();

    let _a = manager.add("conn-1".to_string(), 1).await;
    let _b = manager.add("conn-2".to_string(), 1).await;
    assert_eq!(manager.connection_count().await, 2);

    manager.remove("conn-1").await;
    assert_eq!(manager.connection_count().await, 1);

    manager.remove("nonexistent").await;
    assert_eq!(manager.connection_count().await, 1);
}

// ---------------------------------------------------------------------------
// Test: ping_all() queues a Ping frame on every session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ping_all_sends_ping() {
    let manager = WsManager::new();

    let mut a = manager.add("conn-1".to_string(), 1).await;
    let mut b = manager.add("conn-2".to_string(), 2).await;

    manager.ping_all().await;

    assert!(matches!(a.rx.try_recv(), Ok(Message::Ping(_))));
    assert!(matches!(b.rx.try_recv(), Ok(Message::Ping(_))));
}

// ---------------------------------------------------------------------------
// Test: shutdown_all() cancels every session and clears the map
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_all_cancels_and_clears() {
    let manager = WsManager::new();

    let a = manager.add("conn-1".to_string(), 1).await;
    let b = manager.add("conn-2".to_string(), 2).await;

    manager.shutdown_all().await;

    assert_eq!(manager.connection_count().await, 0);
    assert!(a.cancel.is_cancelled());
    assert!(b.cancel.is_cancelled());
}

// ---------------------------------------------------------------------------
// Test: a session that stops answering pings is closed as silent
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn silent_session_is_closed() {
    let manager = WsManager::new();

    let quiet = manager.add("quiet".to_string(), 1).await;
    let chatty = manager.add("chatty".to_string(), 2).await;

    tokio::time::advance(Duration::from_secs(60)).await;
    manager.record_call("chatty").await;
    tokio::time::advance(Duration::from_secs(31)).await;

    let closed = manager.close_stale(SILENCE, INACTIVITY).await;
    assert_eq!(closed, vec![("quiet".to_string(), StaleReason::Silent)]);
    assert!(quiet.cancel.is_cancelled());
    assert!(!chatty.cancel.is_cancelled());
    assert_eq!(manager.connection_count().await, 1);
}

// ---------------------------------------------------------------------------
// Test: a session that only answers pings is closed as inactive
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn ping_only_session_is_closed_as_inactive() {
    let manager = WsManager::new();

    let idle = manager.add("idle".to_string(), 1).await;

    // Pongs keep arriving, but no call is ever submitted.
    for _ in 0..60 {
        tokio::time::advance(Duration::from_secs(30)).await;
        manager.touch("idle").await;
        assert!(manager.close_stale(SILENCE, INACTIVITY).await.is_empty());
    }
    assert!(!idle.cancel.is_cancelled());

    tokio::time::advance(Duration::from_secs(30)).await;
    manager.touch("idle").await;
    let closed = manager.close_stale(SILENCE, INACTIVITY).await;
    assert_eq!(closed, vec![("idle".to_string(), StaleReason::Inactive)]);

    assert!(idle.cancel.is_cancelled());
    assert_eq!(manager.connection_count().await, 0);
}

// ---------------------------------------------------------------------------
// Test: touching an unknown session is a no-op
// ---------------------------------------------------------------------------

#[tokio::test]
async fn touch_unknown_is_noop() {
    let manager = WsManager::new();

    manager.touch("missing").await;
    manager.record_call("missing").await;

    assert_eq!(manager.connection_count().await, 0);
}
