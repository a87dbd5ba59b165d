//! CDP wire protocol types.
//!
//! This module defines the message formats the relay speaks on both sides:
//! plain CDP frames toward clients, and the envelope protocol toward the
//! extension.
//!
//! # Frame Shapes
//!
//! | Frame | Shape |
//! |-------|-------|
//! | Command | `{id, method, params?, sessionId?}` |
//! | Response | `{id, result}` or `{id, error: {code, message, data?}}` |
//! | Event | `{method, params, sessionId?}` |
//! | Envelope | `{type: "cdp"\|"meta", sessionId?, payload}` |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | CDP frame codec, validation, error payloads |
//! | `envelope` | Extension envelope and meta methods |

// ============================================================================
// Submodules
// ============================================================================

/// CDP frame codec and validation.
pub mod frame;

/// Extension envelope protocol.
pub mod envelope;

// ============================================================================
// Constants
// ============================================================================

/// CDP protocol version reported by `Browser.getVersion` and
/// `/json/version`.
pub const PROTOCOL_VERSION: &str = "1.3";

/// Product string identifying the relay on the CDP surface.
#[must_use]
pub fn product() -> String {
    format!("CdpRelay/{}", crate::config::RELAY_VERSION)
}

// ============================================================================
// Re-exports
// ============================================================================

pub use envelope::{meta, Envelope, MetaPayload};
pub use frame::{
    parse_client_command, parse_extension_cdp, probe_id, CdpError, CommandFrame, EventFrame,
    ExtensionCdp, ResponseFrame, TargetInfo,
};
