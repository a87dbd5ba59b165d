//! Error types for the CDP relay.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use cdp_relay::{Result, Error};
//!
//! async fn example(opts: &cdp_relay::EnsureOptions) -> Result<()> {
//!     let outcome = cdp_relay::ensure_relay_running(opts).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Protocol | [`Error::InvalidRequest`], [`Error::MethodNotFound`], [`Error::InvalidParams`] |
//! | Routing | [`Error::NoPageSession`], [`Error::SessionNotFound`] |
//! | Extension | [`Error::ExtensionDisconnected`], [`Error::ExtensionNotConnected`] |
//! | Lifecycle | [`Error::PortInUse`], [`Error::StartTimeout`], [`Error::SpawnFailed`] |
//! | Cancellation | [`Error::Cancelled`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::Http`], [`Error::ChannelClosed`] |
//!
//! Protocol and routing variants map to CDP error codes via
//! [`Error::cdp_code`]; lifecycle variants are programmatic and surface to
//! the supervisor or the wait utility instead of the wire.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;

use crate::identifiers::SessionId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// CDP Error Codes
// ============================================================================

/// CDP error code for malformed frames.
pub const CODE_INVALID_REQUEST: i64 = -32600;

/// CDP error code for unsupported browser-scope commands.
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;

/// CDP error code for missing or ill-typed command fields.
pub const CODE_INVALID_PARAMS: i64 = -32602;

/// CDP error code for server-side failures (no page session available).
pub const CODE_SERVER_ERROR: i64 = -32000;

/// CDP error code for session-scoped failures (unknown session, requests
/// lost with the extension link).
pub const CODE_SESSION_ERROR: i64 = -32001;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when relay configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed CDP frame.
    ///
    /// Returned to the originator as CDP code `-32600`; the link stays open.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of the frame defect.
        message: String,
    },

    /// Unsupported browser-scope command.
    ///
    /// Returned to the originator as CDP code `-32601`.
    #[error("Method not found: {method}")]
    MethodNotFound {
        /// The unrecognized command method.
        method: String,
    },

    /// Missing or ill-typed command parameters.
    ///
    /// Returned to the originator as CDP code `-32602`.
    #[error("Invalid params: {message}")]
    InvalidParams {
        /// Description of the invalid parameter.
        message: String,
    },

    // ========================================================================
    // Routing Errors
    // ========================================================================
    /// A rewrite needed a page session and none was available.
    ///
    /// Returned to the originator as CDP code `-32000`.
    #[error("no page available to execute {operation}")]
    NoPageSession {
        /// The command that required a page session.
        operation: String,
    },

    /// Command addressed a session the registry does not know.
    #[error("Session not found: {session_id}")]
    SessionNotFound {
        /// The unknown session id.
        session_id: SessionId,
    },

    // ========================================================================
    // Extension Errors
    // ========================================================================
    /// The extension link closed while requests were in flight.
    ///
    /// Every pending forward resolves with this error (CDP code `-32001`).
    #[error("Extension disconnected")]
    ExtensionDisconnected,

    /// The wait utility gave up before the extension connected.
    #[error("Extension not connected on port {port}")]
    ExtensionNotConnected {
        /// Relay port that was polled.
        port: u16,
    },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// Startup bind collision.
    ///
    /// The relay process exits with code 2 when this is hit at startup.
    #[error("Port {port} already in use")]
    PortInUse {
        /// The contested port.
        port: u16,
    },

    /// Supervisor poll exhausted before the spawned relay served its version.
    #[error("Relay did not become ready within {timeout_ms}ms")]
    StartTimeout {
        /// Milliseconds waited before giving up.
        timeout_ms: u64,
    },

    /// Failed to spawn the detached relay process.
    #[error("Failed to spawn relay: {message}")]
    SpawnFailed {
        /// Description of the spawn failure.
        message: String,
    },

    // ========================================================================
    // Cancellation
    // ========================================================================
    /// Pending request cancelled because its holder went away.
    #[error("Request cancelled")]
    Cancelled,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP probe error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid request error.
    #[inline]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a method not found error.
    #[inline]
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            method: method.into(),
        }
    }

    /// Creates an invalid params error.
    #[inline]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Creates a no-page-session error.
    #[inline]
    pub fn no_page_session(operation: impl Into<String>) -> Self {
        Self::NoPageSession {
            operation: operation.into(),
        }
    }

    /// Creates a session not found error.
    #[inline]
    pub fn session_not_found(session_id: SessionId) -> Self {
        Self::SessionNotFound { session_id }
    }

    /// Creates an extension not connected error.
    #[inline]
    pub fn extension_not_connected(port: u16) -> Self {
        Self::ExtensionNotConnected { port }
    }

    /// Creates a port in use error.
    #[inline]
    pub fn port_in_use(port: u16) -> Self {
        Self::PortInUse { port }
    }

    /// Creates a start timeout error.
    #[inline]
    pub fn start_timeout(timeout_ms: u64) -> Self {
        Self::StartTimeout { timeout_ms }
    }

    /// Creates a spawn failed error.
    #[inline]
    pub fn spawn_failed(err: IoError) -> Self {
        Self::SpawnFailed {
            message: err.to_string(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns the CDP error code for wire-visible errors.
    ///
    /// Programmatic errors (lifecycle, IO) return `None`; they are never
    /// shaped into CDP error frames.
    #[must_use]
    pub fn cdp_code(&self) -> Option<i64> {
        match self {
            Self::InvalidRequest { .. } => Some(CODE_INVALID_REQUEST),
            Self::MethodNotFound { .. } => Some(CODE_METHOD_NOT_FOUND),
            Self::InvalidParams { .. } => Some(CODE_INVALID_PARAMS),
            Self::NoPageSession { .. } => Some(CODE_SERVER_ERROR),
            Self::SessionNotFound { .. } | Self::ExtensionDisconnected | Self::Cancelled => {
                Some(CODE_SESSION_ERROR)
            }
            _ => None,
        }
    }

    /// Returns `true` if this is a disconnect-class error.
    #[inline]
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::ExtensionDisconnected | Self::ExtensionNotConnected { .. } | Self::Cancelled
        )
    }

    /// Returns `true` if this error terminates relay startup.
    #[inline]
    #[must_use]
    pub fn is_fatal_startup(&self) -> bool {
        matches!(self, Self::PortInUse { .. } | Self::Config { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
