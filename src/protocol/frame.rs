//! CDP frame codec and validation.
//!
//! Every CDP frame is a JSON object. The codec validates inbound command
//! frames (positive integer `id`, `Domain.name` method with non-empty
//! parts) and preserves unknown top-level fields on frames it re-emits, so
//! newer protocol fields pass through untouched.
//!
//! Frames that fail validation never tear the link down; the router answers
//! them with a `-32600 Invalid Request` error frame instead.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{
    Error, Result, CODE_INVALID_PARAMS, CODE_INVALID_REQUEST, CODE_METHOD_NOT_FOUND,
    CODE_SERVER_ERROR, CODE_SESSION_ERROR,
};
use crate::identifiers::{SessionId, TargetId};

// ============================================================================
// CommandFrame
// ============================================================================

/// A CDP command frame.
///
/// # Format
///
/// ```json
/// {
///   "id": 7,
///   "method": "Network.getCookies",
///   "params": { "urls": [] },
///   "sessionId": "A1B2"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFrame {
    /// Identifier for request/response correlation, unique within the
    /// sender.
    pub id: i64,

    /// Method in `Domain.name` form.
    pub method: String,

    /// Command parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Session scope; absent for browser-scope commands.
    #[serde(
        rename = "sessionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<SessionId>,

    /// Unknown top-level fields, preserved on forwarded frames.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommandFrame {
    /// Creates a command frame for the extension link.
    #[must_use]
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            session_id: None,
            extra: Map::new(),
        }
    }

    /// Validates id and method shape.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for a non-positive id or malformed
    /// method name.
    pub fn validate(&self) -> Result<()> {
        if self.id <= 0 {
            return Err(Error::invalid_request(format!(
                "command id must be a positive integer, got {}",
                self.id
            )));
        }
        if !is_valid_method(&self.method) {
            return Err(Error::invalid_request(format!(
                "method must be Domain.name, got {:?}",
                self.method
            )));
        }
        Ok(())
    }
}

/// Returns `true` when `method` has the `Domain.name` shape with two
/// non-empty parts.
#[must_use]
pub fn is_valid_method(method: &str) -> bool {
    match method.split_once('.') {
        Some((domain, name)) => !domain.is_empty() && !name.is_empty() && !name.contains('.'),
        None => false,
    }
}

/// Parses and validates a command frame from client text.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] for non-JSON input, a missing or
/// non-integer `id`, or a malformed method name.
pub fn parse_client_command(text: &str) -> Result<CommandFrame> {
    let frame: CommandFrame = serde_json::from_str(text)
        .map_err(|e| Error::invalid_request(format!("malformed command frame: {e}")))?;
    frame.validate()?;
    Ok(frame)
}

/// Best-effort extraction of a command id from arbitrary frame text.
///
/// Used to echo the sender's id on `-32600` replies when the frame parsed
/// as JSON but failed validation. Returns 0 when no usable id exists.
#[must_use]
pub fn probe_id(text: &str) -> i64 {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("id").and_then(Value::as_i64))
        .filter(|id| *id > 0)
        .unwrap_or(0)
}

// ============================================================================
// CdpError
// ============================================================================

/// Error payload of a CDP response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdpError {
    /// CDP error code.
    pub code: i64,

    /// Human-readable message.
    pub message: String,

    /// Optional extension-provided detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CdpError {
    /// Creates an error payload.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// `-32600 Invalid Request`.
    #[inline]
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(CODE_INVALID_REQUEST, message)
    }

    /// `-32601 Method not found`.
    #[inline]
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(CODE_METHOD_NOT_FOUND, format!("'{method}' wasn't found"))
    }

    /// `-32602 Invalid params`.
    #[inline]
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(CODE_INVALID_PARAMS, message)
    }

    /// `-32000` no page session available for `operation`.
    #[inline]
    #[must_use]
    pub fn no_page(operation: &str) -> Self {
        Self::new(
            CODE_SERVER_ERROR,
            format!("no page available to execute {operation}"),
        )
    }

    /// `-32001` request lost with the extension link.
    #[inline]
    #[must_use]
    pub fn disconnected() -> Self {
        Self::new(CODE_SESSION_ERROR, "Extension disconnected")
    }

    /// `-32001` unknown session id.
    #[inline]
    #[must_use]
    pub fn session_not_found(session_id: &SessionId) -> Self {
        Self::new(
            CODE_SESSION_ERROR,
            format!("Session not found: {session_id}"),
        )
    }
}

impl From<&Error> for CdpError {
    fn from(err: &Error) -> Self {
        Self::new(err.cdp_code().unwrap_or(CODE_SERVER_ERROR), err.to_string())
    }
}

// ============================================================================
// ResponseFrame
// ============================================================================

/// A CDP response frame.
///
/// Exactly one of `result` and `error` is present on well-formed frames;
/// unknown top-level fields survive the id translation round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Matches the command `id` (rewritten by the router on forwards).
    pub id: i64,

    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error payload on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CdpError>,

    /// Session scope echoed back to the client.
    #[serde(
        rename = "sessionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<SessionId>,

    /// Unknown top-level fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponseFrame {
    /// Creates a success response.
    #[must_use]
    pub fn ok(id: i64, result: Value, session_id: Option<SessionId>) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
            session_id,
            extra: Map::new(),
        }
    }

    /// Creates an error response.
    #[must_use]
    pub fn err(id: i64, error: CdpError, session_id: Option<SessionId>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
            session_id,
            extra: Map::new(),
        }
    }

    /// Returns `true` if this is an error response.
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ============================================================================
// EventFrame
// ============================================================================

/// A CDP event frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    /// Event method in `Domain.name` form.
    pub method: String,

    /// Event parameters.
    #[serde(default)]
    pub params: Value,

    /// Session scope; absent for browser-scope events.
    #[serde(
        rename = "sessionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<SessionId>,
}

impl EventFrame {
    /// Creates an event frame.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value, session_id: Option<SessionId>) -> Self {
        Self {
            method: method.into(),
            params,
            session_id,
        }
    }
}

// ============================================================================
// Extension CDP Payloads
// ============================================================================

/// A CDP payload received from the extension: either a response to a
/// relay-sent command or a browser event.
#[derive(Debug, Clone)]
pub enum ExtensionCdp {
    /// Response to a command the relay sent.
    Response(ResponseFrame),
    /// Browser event for some session.
    Event(EventFrame),
}

/// Classifies a CDP payload from the extension.
///
/// Frames carrying an `id` are responses; frames carrying a `method` are
/// events.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] when the payload is neither.
pub fn parse_extension_cdp(payload: Value) -> Result<ExtensionCdp> {
    if payload.get("id").is_some() {
        let frame: ResponseFrame = serde_json::from_value(payload)
            .map_err(|e| Error::invalid_request(format!("malformed response frame: {e}")))?;
        Ok(ExtensionCdp::Response(frame))
    } else if payload.get("method").is_some() {
        let frame: EventFrame = serde_json::from_value(payload)
            .map_err(|e| Error::invalid_request(format!("malformed event frame: {e}")))?;
        Ok(ExtensionCdp::Event(frame))
    } else {
        Err(Error::invalid_request(
            "extension cdp payload has neither id nor method",
        ))
    }
}

// ============================================================================
// TargetInfo
// ============================================================================

/// Descriptor of a page target, shaped like CDP `Target.TargetInfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    /// Stable page identity.
    pub target_id: TargetId,

    /// Target type; always `"page"` for extension-held tabs.
    #[serde(rename = "type", default = "page_type")]
    pub target_type: String,

    /// Current page title.
    #[serde(default)]
    pub title: String,

    /// Current page URL.
    #[serde(default)]
    pub url: String,

    /// Whether a debugger is attached.
    #[serde(default = "attached_default")]
    pub attached: bool,
}

fn page_type() -> String {
    "page".to_string()
}

const fn attached_default() -> bool {
    true
}

impl TargetInfo {
    /// Creates a page target descriptor.
    #[must_use]
    pub fn page(target_id: TargetId, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            target_id,
            target_type: page_type(),
            title: title.into(),
            url: url.into(),
            attached: true,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
