//! Session manager for orchestrating agent sessions.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use agent_hub_core::{
    AgentCleanup, AgentFactory, AgentInvoker, ConfigurationProvider, ErrorKind, PendingInvocation,
    SessionKey, SessionLease,
    traits::{ConfigError, FactoryError, StoreError},
};
use agent_hub_executor::{BridgeConfig, BridgeError, ExecutionBridge};
use tracing::{debug, info, warn};

use crate::{
    cleanup::{EndReason, release_session},
    config::SessionManagerConfig,
    reaper::IdleReaper,
    store::SessionStore,
};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),
    #[error("Session not found: {0}")]
    NotFound(SessionKey),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Agent creation error: {0}")]
    Factory(#[from] FactoryError),
    #[error("Session busy: {0}")]
    Busy(SessionKey),
    #[error("Session manager is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Bridge(BridgeError),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl SessionError {
    /// Client-facing category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Config(_) | Self::Factory(_) | Self::Storage(_) => ErrorKind::Upstream,
            Self::Busy(_) => ErrorKind::Concurrency,
            Self::ShuttingDown => ErrorKind::Shutdown,
            Self::Bridge(e) => e.kind(),
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => Self::NotFound(key),
            StoreError::Internal(msg) => Self::Storage(msg),
        }
    }
}

impl From<BridgeError> for SessionError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::NotFound(key) => Self::NotFound(key),
            BridgeError::SessionBusy(key) => Self::Busy(key),
            BridgeError::ShuttingDown | BridgeError::Startup(_) => Self::ShuttingDown,
            other => Self::Bridge(other),
        }
    }
}

/// External collaborators the manager delegates to.
pub struct Collaborators {
    pub configs: Arc<dyn ConfigurationProvider>,
    pub factory: Arc<dyn AgentFactory>,
    pub invoker: Arc<dyn AgentInvoker>,
    pub cleanup: Option<Arc<dyn AgentCleanup>>,
}

/// Session manager: store, run-loop bridge and reaper behind one API.
///
/// Construct once at process start and call [`shutdown`](Self::shutdown)
/// before exit.
pub struct SessionManager {
    store: Arc<SessionStore>,
    bridge: ExecutionBridge,
    reaper: IdleReaper,
    configs: Arc<dyn ConfigurationProvider>,
    factory: Arc<dyn AgentFactory>,
    cleanup: Option<Arc<dyn AgentCleanup>>,
    config: SessionManagerConfig,
    stopped: AtomicBool,
}

impl SessionManager {
    /// Start the manager: run-loop thread plus idle reaper.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns `Validation` for a zero interval or timeout, and
    /// `ShuttingDown` if the run-loop cannot be started.
    pub fn start(
        collaborators: Collaborators,
        config: SessionManagerConfig,
    ) -> Result<Self, SessionError> {
        config.validate().map_err(SessionError::Validation)?;

        let Collaborators {
            configs,
            factory,
            invoker,
            cleanup,
        } = collaborators;

        let store = Arc::new(SessionStore::new());
        let bridge = ExecutionBridge::start(
            invoker,
            store.clone(),
            BridgeConfig {
                busy_policy: config.busy_policy,
                drain_timeout: config.drain_timeout,
            },
        )?;
        let reaper = IdleReaper::spawn(
            Arc::clone(&store),
            cleanup.clone(),
            config.cleanup_interval,
            config.idle_threshold(),
        );

        Ok(Self {
            store,
            bridge,
            reaper,
            configs,
            factory,
            cleanup,
            config,
            stopped: AtomicBool::new(false),
        })
    }

    /// Initialize a session keyed by the user id.
    ///
    /// # Errors
    /// See [`initialize_for`](Self::initialize_for).
    pub async fn initialize(&self, user_id: &str) -> Result<SessionLease, SessionError> {
        self.initialize_for(user_id, user_id).await
    }

    /// Build an agent for `user_id` and store it under `session_key`.
    ///
    /// An existing session under the same key is replaced; its agent is
    /// cleaned up unless `close_displaced` is off.
    ///
    /// # Errors
    /// Returns `Validation` for empty ids, `Config`/`Factory` when the
    /// collaborators fail (no session is created), and `ShuttingDown`
    /// after shutdown.
    pub async fn initialize_for(
        &self,
        user_id: &str,
        session_key: &str,
    ) -> Result<SessionLease, SessionError> {
        if user_id.trim().is_empty() {
            return Err(SessionError::Validation("invalid user id".to_string()));
        }
        if session_key.trim().is_empty() {
            return Err(SessionError::Validation("invalid session key".to_string()));
        }
        self.ensure_running()?;

        let user_config = self.configs.fetch(user_id).await?;
        let agent = self.factory.build(&user_config).await?;
        let agent_name = agent.name().to_string();

        let (lease, displaced) = self.store.create(session_key, agent)?;
        info!(session_key, epoch = lease.epoch, user_id, agent = %agent_name, "Session initialized");

        if let Some(previous) = displaced {
            if self.config.close_displaced {
                release_session(self.cleanup.as_ref(), previous, EndReason::Replaced).await;
            } else {
                warn!(
                    session_key,
                    epoch = previous.epoch(),
                    "Session replaced without cleanup"
                );
            }
        }

        // Shutdown may have drained the store while we were building.
        if self.stopped.load(Ordering::Acquire) {
            if let Ok(session) = self.store.release(&lease) {
                release_session(self.cleanup.as_ref(), session, EndReason::Shutdown).await;
            }
            return Err(SessionError::ShuttingDown);
        }

        Ok(lease)
    }

    /// Run one message through the session's agent and record the reply.
    ///
    /// # Errors
    /// Returns `Validation` for blank content, `NotFound` if the session was
    /// closed, reaped or replaced, `Busy` under the reject policy,
    /// `ShuttingDown` while draining, and `Bridge` for invoker failures and
    /// timeouts.
    pub async fn send_message(
        &self,
        lease: &SessionLease,
        content: &str,
        metadata: HashMap<String, String>,
    ) -> Result<String, SessionError> {
        if content.trim().is_empty() {
            return Err(SessionError::Validation(
                "message must not be empty".to_string(),
            ));
        }

        // Keep the reaper away while the invocation runs.
        self.store.touch_lease(lease)?;

        let pending = self.bridge.submit(PendingInvocation {
            lease: lease.clone(),
            message: content.to_string(),
            metadata,
        })?;
        let reply = pending.await_result(self.config.invocation_timeout).await?;

        debug!(session_key = %lease.key, epoch = lease.epoch, "Message processed");
        Ok(reply)
    }

    /// Close a session the caller created. Idempotent.
    ///
    /// Returns `false` if the session was already gone (or replaced).
    ///
    /// # Errors
    /// Returns `Storage` only if the store is unusable.
    pub async fn close(&self, lease: &SessionLease, reason: EndReason) -> Result<bool, SessionError> {
        match self.store.release(lease) {
            Ok(session) => {
                release_session(self.cleanup.as_ref(), session, reason).await;
                Ok(true)
            }
            Err(StoreError::NotFound(_)) => {
                debug!(session_key = %lease.key, epoch = lease.epoch, %reason, "Session already gone");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close whatever session lives under `key`. Idempotent.
    ///
    /// # Errors
    /// Returns `Storage` only if the store is unusable.
    pub async fn close_key(&self, key: &str, reason: EndReason) -> Result<bool, SessionError> {
        match self.store.remove(key) {
            Ok(session) => {
                release_session(self.cleanup.as_ref(), session, reason).await;
                Ok(true)
            }
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Current lease for a key, if a session exists.
    #[must_use]
    pub fn lease_for(&self, key: &str) -> Option<SessionLease> {
        self.store.with_session(key, |s| s.lease()).ok()
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.store.len()
    }

    #[must_use]
    pub const fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop the reaper, drain the run-loop and release every session.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(sessions = self.store.len(), "Shutting down session manager");

        self.reaper.stop().await;
        self.bridge.shutdown().await;

        match self.store.drain() {
            Ok(sessions) => {
                for session in sessions {
                    release_session(self.cleanup.as_ref(), session, EndReason::Shutdown).await;
                }
            }
            Err(e) => warn!(error = %e, "Failed to drain session store"),
        }

        info!("Session manager shutdown complete");
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        if self.stopped.load(Ordering::Acquire) || !self.bridge.is_running() {
            return Err(SessionError::ShuttingDown);
        }
        Ok(())
    }
}
