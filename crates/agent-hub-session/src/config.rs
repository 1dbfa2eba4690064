//! Session manager configuration.

use std::time::Duration;

use agent_hub_executor::{BusyPolicy, bridge::DEFAULT_DRAIN_TIMEOUT};

/// Default interval between idle scans (and default idle threshold).
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Default time a stream waits for one invocation.
pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for the session manager.
#[derive(Clone, Debug)]
pub struct SessionManagerConfig {
    /// Time between idle scans.
    pub cleanup_interval: Duration,
    /// Inactivity after which a session is evicted. Defaults to `cleanup_interval`.
    pub idle_timeout: Option<Duration>,
    /// How long a caller waits for an invocation result.
    pub invocation_timeout: Duration,
    /// How long shutdown waits for running invocations.
    pub drain_timeout: Duration,
    /// Handling of concurrent messages for one session.
    pub busy_policy: BusyPolicy,
    /// Clean up the previous agent when a key is initialized again.
    pub close_displaced: bool,
}

impl SessionManagerConfig {
    /// Effective idle threshold.
    #[must_use]
    pub fn idle_threshold(&self) -> Duration {
        self.idle_timeout.unwrap_or(self.cleanup_interval)
    }

    /// Check that every period the manager relies on is non-zero.
    ///
    /// # Errors
    /// Returns a message naming the offending setting.
    pub fn validate(&self) -> Result<(), String> {
        let periods = [
            ("cleanup_interval", self.cleanup_interval),
            ("idle_timeout", self.idle_threshold()),
            ("invocation_timeout", self.invocation_timeout),
        ];
        for (name, period) in periods {
            if period.is_zero() {
                return Err(format!("{name} must be greater than zero"));
            }
        }
        Ok(())
    }
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            idle_timeout: None,
            invocation_timeout: DEFAULT_INVOCATION_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            busy_policy: BusyPolicy::default(),
            close_displaced: true,
        }
    }
}
