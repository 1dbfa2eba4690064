//! In-process stream binding over a pair of channels.

use std::sync::Arc;

use agent_hub_session::SessionManager;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};

use crate::{
    protocol::{ClientFrame, ServerFrame},
    stream::{StreamProtocol, serve_stream},
};

/// Client side of an in-process stream.
pub struct ChannelClient {
    /// Sender for client frames.
    pub frame_tx: mpsc::UnboundedSender<ClientFrame>,
    /// Receiver for server frames.
    pub reply_rx: mpsc::UnboundedReceiver<ServerFrame>,
}

impl ChannelClient {
    /// Open a stream served by a background task.
    ///
    /// Dropping the client (or its sender) ends the stream, which closes
    /// any bound session.
    #[must_use]
    pub fn connect(manager: Arc<SessionManager>) -> (Self, JoinHandle<()>) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        let inbound = UnboundedReceiverStream::new(frame_rx).map(Ok);
        let task = tokio::spawn(serve_stream(
            StreamProtocol::new(manager),
            inbound,
            reply_tx,
        ));

        (Self { frame_tx, reply_rx }, task)
    }

    /// Send a frame.
    ///
    /// # Errors
    /// Returns error if the stream has ended.
    pub fn send(&self, frame: ClientFrame) -> Result<(), SendError> {
        self.frame_tx
            .send(frame)
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Receive the next server frame.
    pub async fn recv(&mut self) -> Option<ServerFrame> {
        self.reply_rx.recv().await
    }

    /// Send a frame and wait for its response.
    ///
    /// # Errors
    /// Returns error if the stream has ended.
    pub async fn request(&mut self, frame: ClientFrame) -> Result<ServerFrame, SendError> {
        self.send(frame)?;
        self.recv().await.ok_or(SendError::ChannelClosed)
    }
}

/// Send error.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Channel closed")]
    ChannelClosed,
}
