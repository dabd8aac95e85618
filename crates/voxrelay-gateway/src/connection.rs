//! WebSocket connection lifecycle: session setup, read/write loops, teardown.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::OutboundSender;
use crate::state::GatewayState;

/// "Try again later" close code, sent when the registry refuses a session.
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Handle a new WebSocket connection. One connection is one session.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let session_id = Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (outbound, mut outbound_rx) = OutboundSender::new();
    let handle = match state.registry.create(&session_id, outbound.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            warn!(session_id = %session_id, %e, "Refusing connection");
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_TRY_AGAIN_LATER,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };
    info!(session_id = %session_id, active = state.registry.len(), "New WebSocket connection");
    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect();

    let max_frame_bytes = state.gateway().max_frame_bytes;
    let mut channel = handle.channel(max_frame_bytes, outbound);

    // Writer: serializes outbound frames in order until every sender is gone
    let writer_id = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    error!(session_id = %writer_id, %e, "Failed to serialize outbound frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                debug!(session_id = %writer_id, "Socket closed while writing");
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    // Main read loop
    loop {
        tokio::select! {
            biased;
            _ = handle.finished() => {
                debug!(session_id = %session_id, "Session ended, closing connection");
                break;
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if channel.receive_text(text.as_str()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if channel.receive_binary(&data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(session_id = %session_id, "Client requested close");
                    break;
                }
                Some(Ok(_)) => {
                    // Axum handles ping/pong automatically
                }
                Some(Err(e)) => {
                    warn!(session_id = %session_id, %e, "WebSocket error");
                    break;
                }
            },
        }
    }

    // Cleanup
    let grace = state.close_grace();
    channel.close().await;
    handle.wait_closed(grace).await;
    drop(channel);
    if state.registry.remove(&session_id).is_none() {
        warn!(session_id = %session_id, "Session missing from registry at teardown");
    }

    let abort = send_task.abort_handle();
    if tokio::time::timeout(grace, send_task).await.is_err() {
        abort.abort();
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect();
    info!(session_id = %session_id, "WebSocket connection closed");
}
