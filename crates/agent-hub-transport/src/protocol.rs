//! Wire frames for the duplex session stream.

use std::collections::HashMap;

use agent_hub_core::ErrorKind;
use serde::{Deserialize, Serialize};

/// Metadata key carrying the error category on ERROR frames.
pub const KIND_KEY: &str = "kind";

/// Metadata key carrying the session key on responses.
pub const SESSION_KEY: &str = "session_key";

/// Frame from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    /// Bind the stream to a session, creating its agent.
    Initialize {
        #[serde(default, alias = "sessionKey")]
        session_key: String,
    },
    /// Run one message through the session's agent.
    UserMessage {
        #[serde(default)]
        content: String,
        #[serde(default)]
        metadata: HashMap<String, String>,
    },
    /// End the session and the stream.
    Close,
    /// Any frame type this server does not know.
    #[serde(other)]
    Unknown,
}

impl ClientFrame {
    /// Parse one JSON text frame.
    ///
    /// # Errors
    /// Returns `FrameError::Malformed` for invalid JSON or a missing `type`.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    #[must_use]
    pub fn initialize(session_key: impl Into<String>) -> Self {
        Self::Initialize {
            session_key: session_key.into(),
        }
    }

    #[must_use]
    pub fn user_message(content: impl Into<String>) -> Self {
        Self::UserMessage {
            content: content.into(),
            metadata: HashMap::new(),
        }
    }
}

/// Frame from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    AgentResponse {
        content: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        metadata: HashMap<String, String>,
    },
    Error {
        content: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        metadata: HashMap<String, String>,
    },
}

impl ServerFrame {
    /// Successful response without metadata.
    #[must_use]
    pub fn response(content: impl Into<String>) -> Self {
        Self::AgentResponse {
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    /// Successful response tagged with the session key.
    #[must_use]
    pub fn session_response(content: impl Into<String>, session_key: &str) -> Self {
        Self::AgentResponse {
            content: content.into(),
            metadata: HashMap::from([(SESSION_KEY.to_string(), session_key.to_string())]),
        }
    }

    /// Error frame tagged with its category.
    #[must_use]
    pub fn error(kind: ErrorKind, content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
            metadata: HashMap::from([(KIND_KEY.to_string(), kind.as_str().to_string())]),
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::AgentResponse { content, .. } | Self::Error { content, .. } => content,
        }
    }

    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, String> {
        match self {
            Self::AgentResponse { metadata, .. } | Self::Error { metadata, .. } => metadata,
        }
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Error category, for ERROR frames.
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Error { metadata, .. } => metadata.get(KIND_KEY).map(String::as_str),
            Self::AgentResponse { .. } => None,
        }
    }
}

/// Inbound frame could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Invalid frame: binary payload is not UTF-8")]
    NotUtf8,
}

impl FrameError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_parsing() {
        let frame = ClientFrame::parse(r#"{"type":"INITIALIZE","session_key":"u1"}"#).unwrap();
        assert_eq!(frame, ClientFrame::initialize("u1"));

        let frame = ClientFrame::parse(r#"{"type":"INITIALIZE","sessionKey":"u2"}"#).unwrap();
        assert_eq!(frame, ClientFrame::initialize("u2"));

        let frame = ClientFrame::parse(
            r#"{"type":"USER_MESSAGE","content":"hi","metadata":{"trace":"t1"}}"#,
        )
        .unwrap();
        let ClientFrame::UserMessage { content, metadata } = frame else {
            panic!("Wrong frame type");
        };
        assert_eq!(content, "hi");
        assert_eq!(metadata["trace"], "t1");

        assert_eq!(
            ClientFrame::parse(r#"{"type":"CLOSE"}"#).unwrap(),
            ClientFrame::Close
        );
    }

    #[test]
    fn test_unknown_and_malformed_frames() {
        assert_eq!(
            ClientFrame::parse(r#"{"type":"PING"}"#).unwrap(),
            ClientFrame::Unknown
        );
        assert!(ClientFrame::parse("not json").is_err());
        assert!(ClientFrame::parse(r#"{"content":"no type"}"#).is_err());
    }

    #[test]
    fn test_initialize_without_key_parses_empty() {
        assert_eq!(
            ClientFrame::parse(r#"{"type":"INITIALIZE"}"#).unwrap(),
            ClientFrame::initialize("")
        );
    }

    #[test]
    fn test_server_frame_serialization() {
        let json = serde_json::to_value(ServerFrame::response("closed")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "AGENT_RESPONSE", "content": "closed"}));

        let frame = ServerFrame::error(ErrorKind::NotFound, "Session not found: u1");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "ERROR");
        assert_eq!(json["metadata"]["kind"], "not_found");
        assert_eq!(frame.kind(), Some("not_found"));
        assert!(frame.is_error());
    }
}
