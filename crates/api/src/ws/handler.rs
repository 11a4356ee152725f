use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use folio_core::caller::CallerContext;
use folio_core::error::CoreError;
use folio_core::outcome::ErrorCode;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::engine::Dispatcher;
use crate::error::AppError;
use crate::middleware::auth::{authenticate, key_from_headers};
use crate::state::AppState;
use crate::ws::manager::WsSender;
use crate::ws::protocol::{ClientMessage, ServerMessage};

/// How long a closing session waits for in-flight calls to report back.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long queued frames get to reach the socket after the session ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct SessionParams {
    pub api_key: Option<String>,
}

/// HTTP handler that authenticates, then upgrades the connection.
///
/// Browsers cannot set headers on a WebSocket handshake, so the key may
/// also be passed as `?api_key=`.
pub async fn session_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let key = key_from_headers(&headers)
        .or(params.api_key.as_deref())
        .ok_or_else(|| AppError::Core(CoreError::Unauthorized("Missing API key".into())))?;
    let caller = authenticate(&state, key).await?;

    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, caller))
        .into_response())
}

/// Manage a single session after upgrade.
///
/// Splits the socket into a sink (outbound) and stream (inbound), then:
///   1. Registers the session with `WsManager`.
///   2. Spawns a sender task that forwards queued frames to the sink.
///   3. Reads frames on the current task, spawning one task per call.
///   4. On disconnect or server-side close, fails in-flight calls with
///      `SESSION_CLOSED`, flushes and cleans up.
async fn handle_socket(socket: WebSocket, state: AppState, caller: CallerContext) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let ws_manager = Arc::clone(&state.ws_manager);
    tracing::info!(conn_id = %conn_id, caller_id = caller.caller_id, "Session connected");

    let channel = ws_manager.add(conn_id.clone(), caller.caller_id).await;
    let (sender, cancel) = (channel.sender, channel.cancel);
    let mut rx = channel.rx;

    let (mut sink, mut stream) = socket.split();

    // Sender task: forward channel messages to the WebSocket sink.
    let sender_conn_id = conn_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "Session sink closed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let calls = TaskTracker::new();
    let mut closed_by_server = false;

    // Receiver loop: process inbound frames until either side ends the session.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                closed_by_server = true;
                break;
            }
            next = stream.next() => match next {
                Some(Ok(Message::Text(text))) => {
                    handle_text(
                        text.as_str(),
                        &conn_id,
                        &state,
                        &caller,
                        &sender,
                        &cancel,
                        &calls,
                    )
                    .await;
                }
                Some(Ok(Message::Pong(_) | Message::Ping(_))) => {
                    ws_manager.touch(&conn_id).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    ws_manager.touch(&conn_id).await;
                    send(
                        &sender,
                        &ServerMessage::error(None, ErrorCode::InvalidRequest, "binary frames are not supported"),
                    );
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "Session receive error");
                    break;
                }
            },
        }
    }

    // Fail whatever is still running and let the replies drain.
    cancel.cancel();
    calls.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, calls.wait()).await.is_err() {
        tracing::warn!(conn_id = %conn_id, in_flight = calls.len(), "Session calls did not drain");
    }

    if closed_by_server {
        let _ = sender.send(Message::Close(Some(CloseFrame {
            code: close_code::AWAY,
            reason: "session closed".into(),
        })));
    }

    // Once every sender is gone the forwarding task ends by itself.
    ws_manager.remove(&conn_id).await;
    drop(sender);
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }
    tracing::info!(conn_id = %conn_id, closed_by_server, "Session disconnected");
}

async fn handle_text(
    text: &str,
    conn_id: &str,
    state: &AppState,
    caller: &CallerContext,
    sender: &WsSender,
    cancel: &CancellationToken,
    calls: &TaskTracker,
) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            state.ws_manager.touch(conn_id).await;
            send(
                sender,
                &ServerMessage::error(
                    raw_call_id(text),
                    ErrorCode::InvalidRequest,
                    format!("malformed message: {e}"),
                ),
            );
            return;
        }
    };

    if matches!(message, ClientMessage::Ping) {
        state.ws_manager.touch(conn_id).await;
        send(sender, &ServerMessage::Pong);
        return;
    }

    state.ws_manager.record_call(conn_id).await;
    calls.spawn(run_call(
        Arc::clone(&state.dispatcher),
        caller.clone(),
        message,
        sender.clone(),
        cancel.clone(),
    ));
}

/// Run one call to completion, or until the session closes.
async fn run_call(
    dispatcher: Arc<Dispatcher>,
    caller: CallerContext,
    message: ClientMessage,
    sender: WsSender,
    cancel: CancellationToken,
) {
    let call_id = message.call_id().unwrap_or_default().to_string();

    let replies = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!(call_id = %call_id, caller_id = caller.caller_id, "Call abandoned by closing session");
            vec![ServerMessage::session_closed(call_id)]
        }
        replies = dispatch(&dispatcher, &caller, message) => replies,
    };

    for reply in &replies {
        send(&sender, reply);
    }
}

async fn dispatch(
    dispatcher: &Dispatcher,
    caller: &CallerContext,
    message: ClientMessage,
) -> Vec<ServerMessage> {
    let outcome = match message {
        ClientMessage::Render { call_id, job } => dispatcher
            .generate(caller, job)
            .await
            .map(|d| (d.rate, ServerMessage::Result { call_id: call_id.clone(), result: d.output }))
            .map_err(|e| (call_id, e)),
        ClientMessage::Batch { call_id, jobs } => dispatcher
            .generate_batch(caller, jobs)
            .await
            .map(|d| (d.rate, ServerMessage::batch_result(call_id.clone(), d.output)))
            .map_err(|e| (call_id, e)),
        ClientMessage::Pipeline { call_id, calls } => dispatcher
            .run_pipeline(caller, calls)
            .await
            .map(|d| {
                (
                    d.rate,
                    ServerMessage::PipelineResult {
                        call_id: call_id.clone(),
                        results: d.output,
                    },
                )
            })
            .map_err(|e| (call_id, e)),
        ClientMessage::Ping => return vec![ServerMessage::Pong],
    };

    match outcome {
        Ok((rate, reply)) => vec![ServerMessage::rate_limit(rate), reply],
        Err((call_id, err)) => {
            let status = err
                .rate_status()
                .unwrap_or_else(|| dispatcher.admission().peek_rate(caller));
            vec![
                ServerMessage::rate_limit(status),
                ServerMessage::refused(call_id, &err),
            ]
        }
    }
}

fn send(sender: &WsSender, message: &ServerMessage) {
    let _ = sender.send(Message::Text(message.to_json().into()));
}

/// Best-effort `call_id` from a frame that failed to parse.
fn raw_call_id(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get("call_id")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_call_id_is_recovered_from_bad_frames() {
        assert_eq!(
            raw_call_id(r#"{"type": "render", "call_id": "c7", "job": 5}"#),
            Some("c7".into())
        );
        assert_eq!(raw_call_id("not json"), None);
        assert_eq!(raw_call_id(r#"{"type": "render"}"#), None);
    }
}
