//! Per-connection state machine for the duplex session stream.
//!
//! A stream starts `Uninitialized`, becomes `Active` on a successful
//! INITIALIZE and ends `Closed` after CLOSE. Frames are handled one at a
//! time in arrival order. If the stream goes away while `Active`, the
//! session is closed on its behalf.

use std::sync::Arc;

use agent_hub_core::{ErrorKind, SessionLease};
use agent_hub_session::{EndReason, SessionError, SessionManager};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{ClientFrame, FrameError, ServerFrame};

pub const MSG_MUST_INITIALIZE: &str = "must initialize first";
pub const MSG_INITIALIZED: &str = "initialized";
pub const MSG_CLOSED: &str = "closed";
pub const MSG_UNKNOWN: &str = "unknown request type";
pub const MSG_STREAM_CLOSED: &str = "stream closed";

/// Stream lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    Uninitialized,
    Active(SessionLease),
    Closed,
}

/// Protocol handler for one stream.
pub struct StreamProtocol {
    manager: Arc<SessionManager>,
    state: StreamState,
}

impl StreamProtocol {
    #[must_use]
    pub const fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            state: StreamState::Uninitialized,
        }
    }

    #[must_use]
    pub const fn state(&self) -> &StreamState {
        &self.state
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self.state, StreamState::Closed)
    }

    /// Lease of the bound session, if any.
    #[must_use]
    pub const fn lease(&self) -> Option<&SessionLease> {
        match &self.state {
            StreamState::Active(lease) => Some(lease),
            _ => None,
        }
    }

    /// Handle one inbound frame and produce exactly one response.
    pub async fn handle(&mut self, frame: ClientFrame) -> ServerFrame {
        match frame {
            ClientFrame::Initialize { session_key } => self.on_initialize(&session_key).await,
            ClientFrame::UserMessage { content, metadata } => {
                let StreamState::Active(lease) = &self.state else {
                    return ServerFrame::error(ErrorKind::Validation, MSG_MUST_INITIALIZE);
                };
                match self.manager.send_message(lease, &content, metadata).await {
                    Ok(reply) => ServerFrame::session_response(reply, &lease.key),
                    Err(e) => error_frame(&e),
                }
            }
            ClientFrame::Close => self.on_close().await,
            ClientFrame::Unknown => ServerFrame::error(ErrorKind::Validation, MSG_UNKNOWN),
        }
    }

    /// Handle one decoded-or-not inbound frame.
    pub async fn handle_raw(&mut self, frame: Result<ClientFrame, FrameError>) -> ServerFrame {
        match frame {
            Ok(frame) => self.handle(frame).await,
            Err(e) => {
                debug!(error = %e, "Rejected malformed frame");
                ServerFrame::error(e.kind(), e.to_string())
            }
        }
    }

    /// Release the bound session when the transport ends without CLOSE.
    pub async fn finish(mut self) {
        if let StreamState::Active(lease) = std::mem::replace(&mut self.state, StreamState::Closed) {
            info!(session_key = %lease.key, epoch = lease.epoch, "Stream ended without close");
            if let Err(e) = self.manager.close(&lease, EndReason::Disconnected).await {
                warn!(session_key = %lease.key, error = %e, "Implicit close failed");
            }
        }
    }

    async fn on_initialize(&mut self, session_key: &str) -> ServerFrame {
        if self.is_closed() {
            return ServerFrame::error(ErrorKind::Validation, MSG_STREAM_CLOSED);
        }

        let lease = match self.manager.initialize(session_key).await {
            Ok(lease) => lease,
            Err(e) => return error_frame(&e),
        };

        let frame = ServerFrame::session_response(MSG_INITIALIZED, &lease.key);
        let key = lease.key.clone();

        // Bind first so a cancelled release below still leaves the new
        // session owned by this stream.
        let previous = std::mem::replace(&mut self.state, StreamState::Active(lease));
        if let StreamState::Active(previous) = previous {
            if previous.key != key {
                if let Err(e) = self.manager.close(&previous, EndReason::Replaced).await {
                    warn!(session_key = %previous.key, error = %e, "Failed to release previous session");
                }
            }
        }
        frame
    }

    async fn on_close(&mut self) -> ServerFrame {
        let StreamState::Active(lease) = &self.state else {
            return ServerFrame::error(ErrorKind::Validation, MSG_MUST_INITIALIZE);
        };

        let result = self.manager.close(lease, EndReason::Closed).await;
        self.state = StreamState::Closed;
        match result {
            Ok(_) => ServerFrame::response(MSG_CLOSED),
            Err(e) => error_frame(&e),
        }
    }
}

impl Drop for StreamProtocol {
    fn drop(&mut self) {
        let StreamState::Active(lease) = std::mem::replace(&mut self.state, StreamState::Closed)
        else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = Arc::clone(&self.manager);
                handle.spawn(async move {
                    debug!(session_key = %lease.key, epoch = lease.epoch, "Stream dropped while active");
                    if let Err(e) = manager.close(&lease, EndReason::Disconnected).await {
                        warn!(session_key = %lease.key, error = %e, "Implicit close failed");
                    }
                });
            }
            Err(_) => {
                warn!(session_key = %lease.key, "Stream dropped outside runtime; session left to reaper");
            }
        }
    }
}

fn error_frame(err: &SessionError) -> ServerFrame {
    ServerFrame::error(err.kind(), err.to_string())
}

/// Drive a protocol over a frame stream until CLOSE, end of input, or the
/// peer stops listening.
pub async fn serve_stream<S>(
    mut protocol: StreamProtocol,
    mut inbound: S,
    outbound: mpsc::UnboundedSender<ServerFrame>,
) where
    S: Stream<Item = Result<ClientFrame, FrameError>> + Unpin,
{
    while let Some(frame) = inbound.next().await {
        let reply = protocol.handle_raw(frame).await;
        if outbound.send(reply).is_err() {
            debug!("Peer stopped listening");
            break;
        }
        if protocol.is_closed() {
            break;
        }
    }
    protocol.finish().await;
}
