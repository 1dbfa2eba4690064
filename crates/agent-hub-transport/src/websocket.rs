//! WebSocket binding for the duplex session stream.

use std::sync::Arc;

use agent_hub_session::SessionManager;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::{
    protocol::{ClientFrame, FrameError, ServerFrame},
    stream::StreamProtocol,
};

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(manager): State<Arc<SessionManager>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, manager))
}

async fn handle_socket(socket: WebSocket, manager: Arc<SessionManager>) {
    let (mut sender, mut receiver) = socket.split();
    info!("Stream opened");

    // Channel for sending frames to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    error!(error = %e, "Failed to serialize frame");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let mut protocol = StreamProtocol::new(manager);

    while let Some(msg) = receiver.next().await {
        let frame = match msg {
            Ok(Message::Text(text)) => ClientFrame::parse(text.as_str()),
            Ok(Message::Binary(data)) => std::str::from_utf8(&data)
                .map_err(|_| FrameError::NotUtf8)
                .and_then(ClientFrame::parse),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                error!(error = %e, "WebSocket error");
                break;
            }
        };

        let reply = protocol.handle_raw(frame).await;
        if tx.send(reply).is_err() || protocol.is_closed() {
            break;
        }
    }

    protocol.finish().await;
    drop(tx);
    if let Err(e) = send_task.await {
        debug!(error = %e, "Send task ended abnormally");
    }
    info!("Stream closed");
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(manager));
/// ```
#[must_use]
pub fn create_ws_router(manager: Arc<SessionManager>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(manager)
}
