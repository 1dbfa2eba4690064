//! Error classification shared by every layer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse error category reported to clients.
///
/// Every category is recoverable from the process's point of view; they
/// differ in what the client should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input (empty key or message). Fix the request.
    Validation,
    /// Session missing or evicted. Re-initialize.
    NotFound,
    /// Configuration, factory or invoker failure.
    Upstream,
    /// Session busy. Retry later.
    Concurrency,
    /// Bridge draining or dead. Reconnect.
    Shutdown,
}

impl ErrorKind {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Upstream => "upstream",
            Self::Concurrency => "concurrency",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
