//! Per-connection WebSocket handling
//!
//! Each socket is split into a writer task that drains the client's queue
//! and sends heartbeat pings, and a reader task that decodes client frames
//! and hands them to the orchestrator. Every `message` frame is served on
//! its own task so one slow completion never holds up the connection.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, trace, warn};

use super::AppState;
use super::registry::{ClientId, ClientSink};
use crate::relay::events::{ClientFrame, EventSink};

/// Drive one WebSocket connection until either side closes it
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (client_id, mut rx) = state.registry.register();
    info!(client_id = %client_id, "WebSocket client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let heartbeat = Duration::from_secs(state.config.heartbeat_secs.max(1));

    let writer_id = client_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(text) = frame else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                    trace!(client_id = %writer_id, "Sent ping");
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader_state = Arc::clone(&state);
    let reader_id = client_id.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_rx.next().await {
            match message {
                WsMessage::Text(text) => handle_frame(&reader_state, &reader_id, text.as_str()),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    let conversations = state.registry.unregister(&client_id);
    let mut stopped = 0;
    if state.config.stop_on_disconnect {
        for key in &conversations {
            if state.orchestrator.stop(key) {
                stopped += 1;
            }
        }
    }
    info!(client_id = %client_id, stopped, "WebSocket client disconnected");
}

/// Decode and act on one text frame
pub fn handle_frame(state: &Arc<AppState>, client_id: &ClientId, raw: &str) {
    match serde_json::from_str::<ClientFrame>(raw) {
        Ok(ClientFrame::Message(request)) => {
            debug!(
                client_id = %client_id,
                conversation = %request.conversation_key,
                delivery = %request.delivery_id,
                "Received message"
            );
            let key = request.conversation_key.clone();
            state.registry.remember(client_id, &key);

            let sink: Arc<dyn EventSink> = Arc::new(ClientSink::new(
                Arc::clone(&state.registry),
                state.config.delivery,
                client_id.clone(),
            ));
            let orchestrator = Arc::clone(&state.orchestrator);
            let registry = Arc::clone(&state.registry);
            let client_id = client_id.clone();
            tokio::spawn(async move {
                orchestrator.handle(request, sink).await;
                registry.forget(&client_id, &key);
            });
        }
        Ok(ClientFrame::Stop(key)) => {
            debug!(client_id = %client_id, conversation = %key, "Received stop");
            state.orchestrator.stop(&key);
        }
        Err(e) => {
            warn!(
                client_id = %client_id,
                error_message = %e,
                "Ignoring malformed client frame"
            );
        }
    }
}
