//! Transport bindings for agent sessions.
//!
//! Provides:
//! - Wire frames (JSON, tagged by `type`)
//! - `StreamProtocol` - Per-connection state machine
//! - In-process channel binding
//! - WebSocket and unary HTTP bindings (feature: websocket)

pub mod channel;
pub mod protocol;
pub mod stream;

#[cfg(feature = "websocket")]
pub mod http;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use channel::ChannelClient;
pub use protocol::{ClientFrame, FrameError, ServerFrame};
pub use stream::{StreamProtocol, StreamState, serve_stream};

#[cfg(feature = "websocket")]
use std::sync::Arc;

/// Router serving `/ws`, `/health` and the `/sessions` routes.
#[cfg(feature = "websocket")]
#[must_use]
pub fn create_router(manager: Arc<agent_hub_session::SessionManager>) -> axum::Router {
    axum::Router::new()
        .merge(websocket::create_ws_router(Arc::clone(&manager)))
        .merge(http::create_http_router(manager))
}
