// src/debugger/mod.rs
//
// Remote-debugging primitive used by the session manager.
// The manager only ever sees attach / send_command / detach / list_targets
// scoped to a tab; the CDP client in `cdp` is the production implementation.

pub mod cdp;
#[cfg(test)]
pub(crate) mod mock;

pub use cdp::{CdpBrowser, CdpConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// DevTools protocol version requested on attach.
pub const PROTOCOL_VERSION: &str = "1.3";

/// Browser tab identifier (a CDP page target id).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub String);

impl TabId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TabId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TabId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Entry returned by `list_targets`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub tab_id: TabId,
    /// Whether any debugger client is attached to the target
    pub attached: bool,
}

/// Failures reported by the debugging primitive
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DebuggerError {
    #[error("a debugger is already attached to tab {0}")]
    AlreadyAttached(TabId),
    #[error("no debugger attached to tab {0}")]
    NotAttached(TabId),
    #[error("no target with id {0}")]
    TargetNotFound(TabId),
    #[error("{method} failed: {message}")]
    Command { method: String, message: String },
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("browser connection closed")]
    Closed,
}

impl DebuggerError {
    /// "Already attached" counts as a successful attach.
    pub fn is_already_attached(&self) -> bool {
        matches!(self, DebuggerError::AlreadyAttached(_))
    }

    /// The override being set is already active on the target, e.g.
    /// "Timezone override is already in effect".
    pub fn is_already_in_effect(&self) -> bool {
        match self {
            DebuggerError::Command { message, .. } => {
                message.to_ascii_lowercase().contains("already in effect")
            }
            _ => false,
        }
    }

    /// The session the command was sent on no longer exists.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, DebuggerError::NotAttached(_) | DebuggerError::Closed)
    }
}

/// Attach-scoped debugging operations on browser tabs.
#[async_trait]
pub trait DebugSession: Send + Sync {
    /// Open a debugging session on the tab
    async fn attach(&self, tab: &TabId, protocol_version: &str) -> Result<(), DebuggerError>;

    /// Send a protocol command on the tab's session
    async fn send_command(
        &self,
        tab: &TabId,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, DebuggerError>;

    /// Close the tab's debugging session
    async fn detach(&self, tab: &TabId) -> Result<(), DebuggerError>;

    /// List page targets known to the browser
    async fn list_targets(&self) -> Result<Vec<TargetInfo>, DebuggerError>;
}

/// Run a primitive call with an upper bound on how long it may stay pending.
/// Expiry is reported as `DebuggerError::Timeout`; the inner future is dropped.
pub async fn bounded<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T, DebuggerError>
where
    F: Future<Output = Result<T, DebuggerError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DebuggerError::Timeout {
            operation: operation.to_string(),
            after: limit,
        }),
    }
}
