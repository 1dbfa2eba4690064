//! Session orchestration for agent hub.
//!
//! Provides:
//! - `SessionStore` - Keyed, thread-safe session state
//! - `IdleReaper` - Periodic eviction of inactive sessions
//! - `SessionManager` - Initialize, message and close sessions

pub mod cleanup;
pub mod config;
pub mod manager;
pub mod reaper;
pub mod store;

pub use cleanup::EndReason;
pub use config::SessionManagerConfig;
pub use manager::{Collaborators, SessionError, SessionManager};
pub use reaper::IdleReaper;
pub use store::{Session, SessionStore};

pub use agent_hub_executor::BusyPolicy;
