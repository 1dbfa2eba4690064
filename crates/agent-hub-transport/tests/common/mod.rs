//! Common test utilities.
#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use agent_hub_core::{
    UserConfiguration,
    echo::{EchoAgentFactory, EchoInvoker, StaticConfigurationProvider, TrackingCleanup},
};
use agent_hub_session::{Collaborators, SessionManager, SessionManagerConfig};

pub struct TestHub {
    pub manager: Arc<SessionManager>,
    pub cleanup: Arc<TrackingCleanup>,
}

/// Manager over echo collaborators with users `u1` and `u2`.
pub fn test_hub() -> TestHub {
    test_hub_with(SessionManagerConfig::default(), EchoInvoker::new())
}

pub fn test_hub_with(config: SessionManagerConfig, invoker: EchoInvoker) -> TestHub {
    let mut configs = StaticConfigurationProvider::default();
    configs.insert(UserConfiguration::new("u1"));
    configs.insert(UserConfiguration::new("u2"));

    let cleanup = Arc::new(TrackingCleanup::new());
    let manager = SessionManager::start(
        Collaborators {
            configs: Arc::new(configs),
            factory: Arc::new(EchoAgentFactory),
            invoker: Arc::new(invoker),
            cleanup: Some(cleanup.clone()),
        },
        config,
    )
    .unwrap();

    TestHub {
        manager: Arc::new(manager),
        cleanup,
    }
}

/// Poll until `check` holds or the deadline passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
