//! Extension envelope protocol.
//!
//! The extension does not speak a browser-wide CDP endpoint; it speaks an
//! envelope protocol that multiplexes per-tab CDP traffic and a small meta
//! vocabulary over one WebSocket:
//!
//! ```json
//! { "type": "cdp",  "sessionId": "S1", "payload": { "id": 3, "method": "..." } }
//! { "type": "meta", "payload": { "method": "Target.attached", "params": { ... } } }
//! ```
//!
//! Meta traffic covers target lifecycle notifications (extension → relay)
//! and relay-issued requests that are browser operations rather than CDP
//! commands (`Target.createTarget`, `setWindowMode`). Meta requests carry
//! ids from the same relay-global counter as forwarded CDP commands.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::SessionId;

use super::frame::{CdpError, TargetInfo};

// ============================================================================
// Meta Methods
// ============================================================================

/// Meta method names used on the extension link.
pub mod meta {
    /// Extension reports a new page attachment.
    pub const TARGET_ATTACHED: &str = "Target.attached";

    /// Extension reports a page detachment.
    pub const TARGET_DETACHED: &str = "Target.detached";

    /// Extension reports a title/URL change.
    pub const TARGET_INFO_CHANGED: &str = "Target.targetInfoChanged";

    /// Relay asks the extension to open a new page.
    pub const CREATE_TARGET: &str = "Target.createTarget";

    /// Relay signals the separate-window preference on link open.
    pub const SET_WINDOW_MODE: &str = "setWindowMode";
}

// ============================================================================
// Envelope
// ============================================================================

/// A frame on the extension link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// Per-session CDP traffic.
    Cdp {
        /// The session the payload belongs to; absent for browser-scope
        /// events the extension emits without a tab context.
        #[serde(
            rename = "sessionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        session_id: Option<SessionId>,

        /// Raw CDP frame.
        payload: Value,
    },

    /// Meta traffic: lifecycle notifications and extension-level requests.
    Meta {
        /// Meta payload.
        payload: MetaPayload,
    },
}

impl Envelope {
    /// Wraps a CDP payload for a session.
    #[must_use]
    pub fn cdp(session_id: SessionId, payload: Value) -> Self {
        Self::Cdp {
            session_id: Some(session_id),
            payload,
        }
    }

    /// Builds a meta request with a relay-assigned id.
    #[must_use]
    pub fn meta_request(id: i64, method: &str, params: Value) -> Self {
        Self::Meta {
            payload: MetaPayload {
                id: Some(id),
                method: Some(method.to_string()),
                params: Some(params),
                result: None,
                error: None,
            },
        }
    }

    /// Builds a meta notification (no reply expected).
    #[must_use]
    pub fn meta_notification(method: &str, params: Value) -> Self {
        Self::Meta {
            payload: MetaPayload {
                id: None,
                method: Some(method.to_string()),
                params: Some(params),
                result: None,
                error: None,
            },
        }
    }

    /// Parses an envelope from link text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for non-JSON input or an unknown
    /// envelope type.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::invalid_request(format!("malformed envelope: {e}")))
    }

    /// Serializes the envelope to link text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] when serialization fails.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// MetaPayload
// ============================================================================

/// Payload of a meta envelope.
///
/// Requests carry `id` + `method` + `params`; replies echo `id` with
/// `result` or `error`; notifications carry `method` + `params` with no id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaPayload {
    /// Correlation id for request/reply pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    /// Meta method name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Request or notification parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Reply result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Reply error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CdpError>,
}

impl MetaPayload {
    /// Returns `true` when this payload is a reply to a relay request.
    #[inline]
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.id.is_some() && (self.result.is_some() || self.error.is_some())
    }
}

// ============================================================================
// Meta Parameter Shapes
// ============================================================================

/// Parameters of a `Target.attached` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedParams {
    /// Browser-assigned session id.
    pub session_id: SessionId,

    /// Descriptor of the attached page.
    pub target_info: TargetInfo,
}

/// Parameters of a `Target.detached` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedParams {
    /// The page that went away.
    pub target_id: crate::identifiers::TargetId,
}

/// Parameters of a `Target.targetInfoChanged` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoChangedParams {
    /// Updated descriptor.
    pub target_info: TargetInfo,
}

// ============================================================================
// Tests
// ============================================================================
