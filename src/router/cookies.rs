//! Cookie command rewrites.
//!
//! Browser-scope cookie commands have no counterpart on the extension's
//! per-tab debugger surface, so the router rewrites them into page-scope
//! equivalents executed against the earliest-attached target with an open
//! session:
//!
//! | Incoming | Rewrite |
//! |----------|---------|
//! | `Storage.getCookies` | `Network.getCookies` with empty `urls` |
//! | `Storage.setCookies` | `Network.setCookies`, `browserContextId` stripped |
//! | `Storage.clearCookies` | `Network.getCookies`, then one `Network.deleteCookies` per cookie |
//!
//! Each rewrite spans one or more extension round-trips but appears atomic
//! to the client: a single success or failure reply. `clearCookies`
//! continues past individual delete failures and surfaces the first error
//! only when not a single deletion succeeded.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::identifiers::SessionId;
use crate::link::client::ClientHandle;
use crate::link::extension::ExtensionLink;
use crate::protocol::{CdpError, CommandFrame};

use super::{respond_err, respond_ok, Relay};

// ============================================================================
// Types
// ============================================================================

/// Cookie rewrite plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieOp {
    /// `Storage.getCookies`.
    Get,
    /// `Storage.setCookies`.
    Set,
    /// `Storage.clearCookies`.
    Clear,
}

/// Cookie identity fields copied onto `Network.deleteCookies`.
const DELETE_FIELDS: [&str; 4] = ["name", "domain", "path", "partitionKey"];

// ============================================================================
// Dispatch
// ============================================================================

/// Executes a cookie rewrite and answers the client.
pub(crate) async fn dispatch(
    relay: &Arc<Relay>,
    client: &Arc<ClientHandle>,
    op: CookieOp,
    frame: CommandFrame,
) {
    let session_id = relay.registry().earliest_session();
    let link = relay.extension();
    let (Some(session_id), Some(link)) = (session_id, link) else {
        respond_err(client, frame.id, CdpError::no_page(&frame.method));
        return;
    };

    debug!(
        client_id = %client.id(),
        method = %frame.method,
        session_id = %session_id,
        "Rewriting cookie command"
    );

    match op {
        CookieOp::Get => get_cookies(client, &link, &session_id, frame).await,
        CookieOp::Set => set_cookies(client, &link, &session_id, frame).await,
        CookieOp::Clear => clear_cookies(client, &link, &session_id, frame).await,
    }
}

// ============================================================================
// Plans
// ============================================================================

/// `Storage.getCookies` → `Network.getCookies`. The `{cookies}` result
/// shape is identical, so the reply passes through unchanged.
async fn get_cookies(
    client: &Arc<ClientHandle>,
    link: &Arc<ExtensionLink>,
    session_id: &SessionId,
    frame: CommandFrame,
) {
    match link
        .request_cdp(session_id, "Network.getCookies", json!({ "urls": [] }))
        .await
    {
        Ok(result) => respond_ok(client, frame.id, result),
        Err(error) => respond_err(client, frame.id, error),
    }
}

/// `Storage.setCookies` → `Network.setCookies` with the same cookie list,
/// minus the browser-context scoping the extension cannot honor.
async fn set_cookies(
    client: &Arc<ClientHandle>,
    link: &Arc<ExtensionLink>,
    session_id: &SessionId,
    frame: CommandFrame,
) {
    let cookies = frame
        .params
        .as_ref()
        .and_then(|p| p.get("cookies"))
        .and_then(Value::as_array);
    let Some(cookies) = cookies else {
        respond_err(
            client,
            frame.id,
            CdpError::invalid_params("array 'cookies' is required"),
        );
        return;
    };

    let stripped: Vec<Value> = cookies
        .iter()
        .map(|cookie| {
            let mut cookie = cookie.clone();
            if let Some(object) = cookie.as_object_mut() {
                object.remove("browserContextId");
            }
            cookie
        })
        .collect();

    match link
        .request_cdp(session_id, "Network.setCookies", json!({ "cookies": stripped }))
        .await
    {
        Ok(_) => respond_ok(client, frame.id, json!({})),
        Err(error) => respond_err(client, frame.id, error),
    }
}

/// `Storage.clearCookies` → fetch, then one delete per cookie in iteration
/// order. Zero cookies costs exactly one extension call.
async fn clear_cookies(
    client: &Arc<ClientHandle>,
    link: &Arc<ExtensionLink>,
    session_id: &SessionId,
    frame: CommandFrame,
) {
    let listed = link
        .request_cdp(session_id, "Network.getCookies", json!({ "urls": [] }))
        .await;
    let cookies = match listed {
        Ok(result) => result
            .get("cookies")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        Err(error) => {
            respond_err(client, frame.id, error);
            return;
        }
    };

    if cookies.is_empty() {
        respond_ok(client, frame.id, json!({}));
        return;
    }

    let mut deleted = 0usize;
    let mut first_error: Option<CdpError> = None;
    for cookie in &cookies {
        match link
            .request_cdp(session_id, "Network.deleteCookies", delete_params(cookie))
            .await
        {
            Ok(_) => deleted += 1,
            Err(error) => {
                // Partial failure policy: keep going, remember the first.
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
    }

    if deleted == 0 {
        if let Some(error) = first_error {
            respond_err(client, frame.id, error);
            return;
        }
    }
    respond_ok(client, frame.id, json!({}));
}

/// Builds `Network.deleteCookies` params from a cookie's identity fields.
///
/// Copies whatever identity fields are present. Every listed cookie gets a
/// delete attempt; a cookie the extension cannot address (no `name`) fails
/// there, and that failure feeds the partial-failure accounting like any
/// other.
fn delete_params(cookie: &Value) -> Value {
    let mut params = Map::new();
    for field in DELETE_FIELDS {
        if let Some(value) = cookie.get(field) {
            params.insert(field.to_string(), value.clone());
        }
    }
    Value::Object(params)
}

// ============================================================================
// Tests
// ============================================================================
