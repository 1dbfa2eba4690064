//! Reference collaborators.
//!
//! Good enough for demos and tests; real deployments plug in their own
//! provider, factory and invoker.

use std::{
    any::Any,
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    UserConfiguration,
    traits::{
        Agent, AgentCleanup, AgentFactory, AgentHandle, AgentInvoker, CleanupError, ConfigError,
        ConfigurationProvider, FactoryError, InvokeError,
    },
};

/// Capability that routes to the calendar sub-agent.
pub const CALENDAR_CAPABILITY: &str = "calendar";

/// Agent that repeats what it is told.
#[derive(Debug, Clone)]
pub struct EchoAgent {
    pub name: String,
    pub user_id: String,
    /// Sub-agents this agent may hand off to.
    pub handoffs: Vec<String>,
}

impl Agent for EchoAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory producing [`EchoAgent`]s.
#[derive(Debug, Default, Clone)]
pub struct EchoAgentFactory;

#[async_trait]
impl AgentFactory for EchoAgentFactory {
    async fn build(&self, config: &UserConfiguration) -> Result<AgentHandle, FactoryError> {
        if config.user_id.trim().is_empty() {
            return Err(FactoryError::ConfigInvalid(
                "configuration has no user id".to_string(),
            ));
        }

        let mut handoffs = Vec::new();
        if config.has_capability(CALENDAR_CAPABILITY) {
            handoffs.push(CALENDAR_CAPABILITY.to_string());
        }

        Ok(std::sync::Arc::new(EchoAgent {
            name: "Gateway agent".to_string(),
            user_id: config.user_id.clone(),
            handoffs,
        }))
    }
}

/// Invoker that answers `echo: <message>`, optionally after a delay.
#[derive(Debug, Default, Clone)]
pub struct EchoInvoker {
    latency: Option<Duration>,
}

impl EchoInvoker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before answering.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
        }
    }
}

#[async_trait(?Send)]
impl AgentInvoker for EchoInvoker {
    async fn invoke(
        &self,
        _agent: &AgentHandle,
        message: &str,
        _history: &[String],
    ) -> Result<String, InvokeError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        Ok(format!("echo: {message}"))
    }
}

/// In-memory configuration provider.
#[derive(Debug, Default, Clone)]
pub struct StaticConfigurationProvider {
    users: HashMap<String, UserConfiguration>,
    fallback: bool,
}

impl StaticConfigurationProvider {
    /// Provider that only knows the given users.
    #[must_use]
    pub fn new(users: HashMap<String, UserConfiguration>) -> Self {
        Self {
            users,
            fallback: false,
        }
    }

    /// Serve an empty configuration for unknown users instead of `NotFound`.
    #[must_use]
    pub fn with_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    /// Register a user.
    pub fn insert(&mut self, config: UserConfiguration) {
        self.users.insert(config.user_id.clone(), config);
    }
}

#[async_trait]
impl ConfigurationProvider for StaticConfigurationProvider {
    async fn fetch(&self, user_id: &str) -> Result<UserConfiguration, ConfigError> {
        match self.users.get(user_id) {
            Some(config) => {
                let mut config = config.clone();
                config.user_id = user_id.to_string();
                Ok(config)
            }
            None if self.fallback => Ok(UserConfiguration::new(user_id)),
            None => Err(ConfigError::NotFound(user_id.to_string())),
        }
    }
}

/// Cleanup that only counts and logs released agents.
#[derive(Debug, Default)]
pub struct TrackingCleanup {
    calls: AtomicUsize,
}

impl TrackingCleanup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of agents cleaned up so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentCleanup for TrackingCleanup {
    async fn cleanup(&self, agent: AgentHandle) -> Result<(), CleanupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(agent = agent.name(), "Agent released");
        Ok(())
    }
}
