use std::{collections::HashMap, fs, io::ErrorKind, path::Path, time::Duration};

use agent_hub_core::UserConfiguration;
use agent_hub_session::{BusyPolicy, SessionManagerConfig};
use serde::Deserialize;

// -----------------------------------------------------------------------------
// Config (root)
// -----------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    /// Per-user configuration served to the agent factory.
    #[serde(default)]
    pub users: HashMap<String, UserConfiguration>,
    /// Serve an empty configuration to users not listed above.
    #[serde(default)]
    pub allow_unknown_users: bool,
}

impl Config {
    /// Load from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `SERVICE_HOST` / `SERVICE_PORT` from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(host) = lookup("SERVICE_HOST").filter(|h| !h.is_empty()) {
            self.server.host = host;
        }
        if let Some(port) = lookup("SERVICE_PORT").filter(|p| !p.is_empty()) {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidPort(port))?;
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ServerConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    50051
}

// -----------------------------------------------------------------------------
// SessionsConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    /// Defaults to the cleanup interval.
    #[serde(default)]
    pub idle_timeout_seconds: Option<u64>,
    #[serde(default = "default_invocation_timeout")]
    pub invocation_timeout_seconds: u64,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,
    #[serde(default)]
    pub busy_policy: BusyPolicy,
    #[serde(default = "default_close_displaced")]
    pub close_displaced: bool,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: default_cleanup_interval(),
            idle_timeout_seconds: None,
            invocation_timeout_seconds: default_invocation_timeout(),
            drain_timeout_seconds: default_drain_timeout(),
            busy_policy: BusyPolicy::default(),
            close_displaced: default_close_displaced(),
        }
    }
}

impl SessionsConfig {
    pub fn to_manager_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            cleanup_interval: Duration::from_secs(self.cleanup_interval_seconds),
            idle_timeout: self.idle_timeout_seconds.map(Duration::from_secs),
            invocation_timeout: Duration::from_secs(self.invocation_timeout_seconds),
            drain_timeout: Duration::from_secs(self.drain_timeout_seconds),
            busy_policy: self.busy_policy,
            close_displaced: self.close_displaced,
        }
    }
}

const fn default_cleanup_interval() -> u64 {
    300
}

const fn default_invocation_timeout() -> u64 {
    120
}

const fn default_drain_timeout() -> u64 {
    10
}

const fn default_close_displaced() -> bool {
    true
}

// -----------------------------------------------------------------------------
// ConfigError
// -----------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid SERVICE_PORT: {0}")]
    InvalidPort(String),
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 50051);
        assert_eq!(config.sessions.cleanup_interval_seconds, 300);
        assert_eq!(config.sessions.invocation_timeout_seconds, 120);
        assert!(config.users.is_empty());

        let manager = config.sessions.to_manager_config();
        assert_eq!(manager.idle_threshold(), Duration::from_secs(300));
        assert_eq!(manager.drain_timeout, Duration::from_secs(10));
        assert!(manager.close_displaced);
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let config = Config::load(Path::new("definitely/not/here/agent-hub.toml")).unwrap();
        assert_eq!(config.server.port, 50051);
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(
            r#"
allow_unknown_users = true

[server]
host = "127.0.0.1"
port = 8080

[sessions]
cleanup_interval_seconds = 60
idle_timeout_seconds = 900
busy_policy = "reject"

[users.alice]
capabilities = ["calendar"]

[users.alice.metadata]
timezone = "Europe/Lisbon"
"#,
        )
        .unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert!(config.allow_unknown_users);

        let manager = config.sessions.to_manager_config();
        assert_eq!(manager.cleanup_interval, Duration::from_secs(60));
        assert_eq!(manager.idle_threshold(), Duration::from_secs(900));
        assert_eq!(manager.busy_policy, BusyPolicy::Reject);

        let alice = &config.users["alice"];
        assert!(alice.has_capability("calendar"));
        assert_eq!(alice.metadata["timezone"], "Europe/Lisbon");
    }

    #[test]
    fn test_zero_cleanup_interval_fails_validation() {
        let config = Config::from_toml("[sessions]\ncleanup_interval_seconds = 0").unwrap();
        let err = config.sessions.to_manager_config().validate().unwrap_err();
        assert!(err.contains("cleanup_interval"));
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = Config::from_toml("[server]\nport = \"high\"").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml("[server]\nhost = \"127.0.0.1\"\nport = 9000").unwrap();
        config
            .apply_env_with(|name| match name {
                "SERVICE_HOST" => Some("10.0.0.5".to_string()),
                "SERVICE_PORT" => Some("7000".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.server.host, "10.0.0.5");
        assert_eq!(config.server.port, 7000);

        let err = config
            .apply_env_with(|name| (name == "SERVICE_PORT").then(|| "nope".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort(p) if p == "nope"));
    }
}
