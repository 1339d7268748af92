//! The in-browser side of the relay.
//!
//! The browser's native debugging API is abstracted behind [`Debugger`]; the
//! [`ExtensionPeer`] drives it, owns the per-tab attachment state and talks
//! to the relay through the [`Supervisor`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod peer;
pub mod supervisor;

pub use self::peer::{AttachedTab, ExtensionPeer, PeerEvent, PeerHandle, TabSnapshot, TabState};
pub use self::supervisor::Supervisor;

/// Pages the browser refuses to debug
pub const RESTRICTED_URL_PREFIXES: &[&str] = &[
    "chrome://",
    "chrome-extension://",
    "edge://",
    "devtools://",
    "view-source:",
    "chrome-search://",
    "about:devtools",
];

pub fn is_restricted_url(url: &str) -> bool {
    RESTRICTED_URL_PREFIXES
        .iter()
        .any(|prefix| url.starts_with(prefix))
}

/// Browser tab identifier
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabId(pub i64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a native debugger call is addressed to: a tab, or a child session
/// (iframe, worker) inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebuggeeId {
    pub tab_id: TabId,
    pub session_id: Option<String>,
}

impl DebuggeeId {
    pub fn tab(tab_id: TabId) -> Self {
        Self {
            tab_id,
            session_id: None,
        }
    }

    pub fn child(tab_id: TabId, session_id: impl Into<String>) -> Self {
        Self {
            tab_id,
            session_id: Some(session_id.into()),
        }
    }
}

/// What the browser knows about a tab without a debugger attached
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabInfo {
    pub url: String,
    pub title: String,
}

/// Something the browser reported on its own
#[derive(Debug, Clone, PartialEq)]
pub enum DebuggerEvent {
    /// A protocol event emitted by an attached tab or one of its child sessions
    Cdp {
        source: DebuggeeId,
        method: String,
        params: Value,
    },
    /// The debugger was detached without being asked to, e.g. the user
    /// dismissed the debugging banner
    Detached { tab_id: TabId, reason: String },
    TabRemoved { tab_id: TabId },
    TabUpdated { tab_id: TabId, info: TabInfo },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DebuggerError {
    /// Error reported by the browser, passed on verbatim
    #[error("{0}")]
    Native(String),
    #[error("Cannot attach to restricted page {0}")]
    Restricted(String),
    #[error("Tab {0} not found")]
    TabNotFound(TabId),
    #[error("Tab {0} is already connecting")]
    AlreadyConnecting(TabId),
    #[error("No tab found for sessionId {0}")]
    UnknownSession(String),
    #[error("No tab found for targetId {0}")]
    UnknownTarget(String),
    #[error("{0} requires a sessionId")]
    MissingSession(String),
    #[error("Relay not connected")]
    RelayNotConnected,
    #[error("Timeout waiting for {0}")]
    Timeout(String),
    #[error("Extension peer stopped")]
    PeerGone,
}

/// The browser's native debugging API.
///
/// Implementations wrap the real extension APIs; tests use an in-memory
/// browser.
#[async_trait]
pub trait Debugger: Send + Sync + 'static {
    /// Looks a tab up, `None` if it does not exist (anymore).
    async fn tab(&self, tab_id: TabId) -> Result<Option<TabInfo>, DebuggerError>;

    async fn attach(&self, tab_id: TabId) -> Result<(), DebuggerError>;

    async fn detach(&self, tab_id: TabId) -> Result<(), DebuggerError>;

    async fn send_command(
        &self,
        target: DebuggeeId,
        method: &str,
        params: Value,
    ) -> Result<Value, DebuggerError>;

    /// Opens a new tab and returns its id.
    async fn create_tab(&self, url: &str) -> Result<TabId, DebuggerError>;

    async fn close_tab(&self, tab_id: TabId) -> Result<(), DebuggerError>;

    /// Closes the window containing the tab.
    async fn close_window(&self, tab_id: TabId) -> Result<(), DebuggerError>;

    async fn show_notification(&self, title: &str, message: &str) -> Result<(), DebuggerError>;
}
