//! Best-effort agent release for sessions leaving the store.

use std::{fmt, sync::Arc};

use agent_hub_core::AgentCleanup;
use tracing::{info, warn};

use crate::store::Session;

/// Why a session left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Client sent CLOSE.
    Closed,
    /// Transport ended without CLOSE.
    Disconnected,
    /// Same key was initialized again.
    Replaced,
    /// Reaped after inactivity.
    Idle,
    /// Process shutdown.
    Shutdown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Disconnected => "disconnected",
            Self::Replaced => "replaced",
            Self::Idle => "idle",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Run external cleanup for a removed session. Failures are logged only.
pub(crate) async fn release_session(
    cleanup: Option<&Arc<dyn AgentCleanup>>,
    session: Session,
    reason: EndReason,
) {
    let key = session.key().to_string();
    let epoch = session.epoch();
    let turns = session.history().len();

    if let Some(cleanup) = cleanup {
        if let Err(e) = cleanup.cleanup(session.into_agent()).await {
            warn!(session_key = %key, epoch, %reason, error = %e, "Agent cleanup failed");
        }
    }

    info!(session_key = %key, epoch, turns, %reason, "Session ended");
}
