//! MCP error types.
//!
//! Defines the error variants surfaced by the client manager (connect, transport,
//! remote tool, lookup and configuration errors) and the non-fatal warnings raised
//! while tearing a server connection down.

use std::time::Duration;

use thiserror::Error;

pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    /// Connecting to a server failed. The manager has already rolled back any
    /// partial state for `server_id` when this is returned.
    #[error("Connection to '{server_id}' failed: {kind}")]
    Connect {
        server_id: String,
        kind: ConnectErrorKind,
    },

    /// The channel to a connected server broke mid-session.
    #[error("Transport error on '{server_id}': {message}")]
    Transport { server_id: String, message: String },

    /// The server executed the call and reported an application-level error.
    #[error("Tool '{tool}' on '{server_id}' returned an error: {message}")]
    RemoteTool {
        server_id: String,
        tool: String,
        message: String,
    },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Session for '{server_id}' is {actual}, expected {expected}")]
    InvalidState {
        server_id: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl McpError {
    pub(crate) fn connect(server_id: impl Into<String>, kind: ConnectErrorKind) -> Self {
        McpError::Connect {
            server_id: server_id.into(),
            kind,
        }
    }

    pub(crate) fn transport(server_id: impl Into<String>, message: impl Into<String>) -> Self {
        McpError::Transport {
            server_id: server_id.into(),
            message: message.into(),
        }
    }

    /// True for errors raised while establishing a connection.
    pub fn is_connect_error(&self) -> bool {
        matches!(self, McpError::Connect { .. })
    }
}

/// Why a connection attempt failed.
#[derive(Debug, Error)]
pub enum ConnectErrorKind {
    /// The server process could not be started.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// The endpoint refused the connection or could not be reached.
    /// Never retried inside the transport layer.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The channel opened but the protocol handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The handshake succeeded but the initial tool discovery failed.
    #[error("tool discovery failed: {0}")]
    Discovery(String),

    /// The whole connect bracket exceeded its ceiling.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Non-fatal conditions observed while tearing a connection down.
///
/// These are classified where they happen (transport close path, session
/// shutdown) so callers never have to inspect error text. They are logged and
/// counted, never returned from `disconnect`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TeardownWarning {
    /// The remote end had already closed the channel.
    #[error("peer already closed the connection")]
    PeerClosed,

    /// The server process exited before it was asked to.
    #[error("process already exited")]
    AlreadyExited,

    /// In-flight calls still hold the session; it closes when they finish.
    #[error("session still referenced by {0} in-flight call(s)")]
    StillInUse(usize),

    /// Graceful shutdown exceeded its ceiling and the session was force-released.
    #[error("graceful shutdown timed out after {0:?}")]
    ShutdownTimedOut(Duration),

    /// Releasing one bundle resource exceeded its ceiling.
    #[error("releasing '{label}' timed out after {timeout:?}")]
    ReleaseTimedOut { label: String, timeout: Duration },

    /// The background task driving the session or shutdown failed.
    #[error("session task failed: {0}")]
    TaskFailed(String),

    /// An OS-level error while releasing a resource.
    #[error("releasing '{label}' failed: {message}")]
    Io { label: String, message: String },
}
