//! Core abstractions for multiplexed agent session management.
//!
//! This crate provides the shared vocabulary:
//! - `UserConfiguration` - Per-user configuration for agent construction
//! - Collaborator traits (`ConfigurationProvider`, `AgentFactory`,
//!   `AgentInvoker`, `AgentCleanup`) and `SessionAccess`
//! - `ErrorKind` - Client-facing error taxonomy
//! - Echo reference collaborators

pub mod context;
pub mod echo;
pub mod error;
pub mod traits;

pub use context::UserConfiguration;
pub use error::ErrorKind;
pub use traits::{
    Agent, AgentCleanup, AgentFactory, AgentHandle, AgentInvoker, ConfigurationProvider,
    PendingInvocation, SessionAccess, SessionKey, SessionLease, SessionSnapshot,
};
