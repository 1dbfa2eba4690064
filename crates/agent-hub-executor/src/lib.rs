//! Execution bridge for agent invocations.
//!
//! Provides:
//! - `ExecutionBridge` - Dedicated single-threaded run-loop reachable from any thread
//! - `PendingResult` - Handle for awaiting one invocation's outcome
//! - `BusyPolicy` - Per-session serialization strategy

pub mod bridge;
pub mod slots;

pub use bridge::{BridgeConfig, BridgeError, ExecutionBridge, PendingResult};
pub use slots::BusyPolicy;
