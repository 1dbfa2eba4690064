//! Core traits for agent collaborators and session access.

use std::{any::Any, collections::HashMap, fmt, sync::Arc, time::Instant};

use async_trait::async_trait;
use thiserror::Error;

use crate::UserConfiguration;

/// Session key. In the streaming binding this is the user identifier.
pub type SessionKey = String;

/// Opaque, long-lived agent object owned by a session.
pub trait Agent: Send + Sync + fmt::Debug {
    /// Human-readable agent name (for logs).
    fn name(&self) -> &str;

    /// Downcast hook for invokers that need the concrete agent type.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a session's agent.
pub type AgentHandle = Arc<dyn Agent>;

/// Proof that a caller created a particular incarnation of a session.
///
/// Re-initializing a key bumps its epoch, so operations carrying an older
/// lease cannot touch the newer session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionLease {
    /// Session key.
    pub key: SessionKey,
    /// Incarnation counter, unique per store.
    pub epoch: u64,
}

impl fmt::Display for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.key, self.epoch)
    }
}

/// Point-in-time copy of a session, taken under the store lock.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub lease: SessionLease,
    pub agent: AgentHandle,
    /// Prior responses, oldest first.
    pub history: Vec<String>,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
    pub last_activity: Instant,
}

/// A unit of work for the execution bridge. Consumed exactly once.
#[derive(Debug, Clone)]
pub struct PendingInvocation {
    pub lease: SessionLease,
    pub message: String,
    pub metadata: HashMap<String, String>,
}

impl PendingInvocation {
    /// Create an invocation without metadata.
    #[must_use]
    pub fn new(lease: SessionLease, message: impl Into<String>) -> Self {
        Self {
            lease,
            message: message.into(),
            metadata: HashMap::new(),
        }
    }
}

/// Store error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(SessionKey),
    #[error("Store error: {0}")]
    Internal(String),
}

/// Configuration lookup error.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Configuration not found for user {0}")]
    NotFound(String),
    #[error("Configuration service unavailable: {0}")]
    Unavailable(String),
}

/// Agent construction error.
#[derive(Debug, Clone, Error)]
pub enum FactoryError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("Agent creation failed: {0}")]
    CreationFailed(String),
}

/// Agent invocation error.
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    #[error("Invocation failed: {0}")]
    Failed(String),
    #[error("Invocation panicked: {0}")]
    Panicked(String),
}

/// Agent cleanup error.
#[derive(Debug, Clone, Error)]
#[error("Agent cleanup failed: {0}")]
pub struct CleanupError(pub String);

/// Source of per-user configuration.
#[async_trait]
pub trait ConfigurationProvider: Send + Sync {
    /// Fetch configuration for a user.
    async fn fetch(&self, user_id: &str) -> Result<UserConfiguration, ConfigError>;
}

/// Builds agents from user configuration.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    /// Build a new agent.
    async fn build(&self, config: &UserConfiguration) -> Result<AgentHandle, FactoryError>;
}

/// Runs an agent against a message.
///
/// Invocations run on the bridge's single-threaded run-loop, so the
/// returned future does not need to be `Send`.
#[async_trait(?Send)]
pub trait AgentInvoker: Send + Sync {
    /// Produce a response for `message` given prior `history`.
    async fn invoke(
        &self,
        agent: &AgentHandle,
        message: &str,
        history: &[String],
    ) -> Result<String, InvokeError>;
}

/// Optional teardown for agents leaving the store.
///
/// Best-effort: failures are logged by the caller and never propagated.
#[async_trait]
pub trait AgentCleanup: Send + Sync {
    /// Release resources held by an agent.
    async fn cleanup(&self, agent: AgentHandle) -> Result<(), CleanupError>;
}

/// Session access needed while an invocation runs.
///
/// Both calls are epoch-checked against the lease.
pub trait SessionAccess: Send + Sync {
    /// Snapshot the agent and history for an invocation.
    ///
    /// # Errors
    /// Returns `NotFound` if the leased incarnation is gone.
    fn load(&self, lease: &SessionLease) -> Result<SessionSnapshot, StoreError>;

    /// Append a response to history and refresh last activity.
    ///
    /// # Errors
    /// Returns `NotFound` if the leased incarnation is gone.
    fn record(&self, lease: &SessionLease, text: String) -> Result<(), StoreError>;
}
