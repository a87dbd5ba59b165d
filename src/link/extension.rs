//! Extension link: the single WebSocket to the browser extension.
//!
//! At most one extension link is open at a time; a second accept closes the
//! first with a policy code and reseeds the registry from the new
//! extension's target reports.
//!
//! The link exposes two primitives:
//!
//! - [`ExtensionLink::send`]: enqueue a frame on the single-writer outbound
//!   queue; writes are serialized by the writer task.
//! - [`ExtensionLink::request_cdp`] / [`ExtensionLink::request_meta`]:
//!   allocate a relay id, register a waiter, send, and resolve on the
//!   matching reply. Waiters reject with a disconnect error on link close.
//!
//! The link does not parse inbound frames; the reader task hands them to
//! the router, which resolves waiters through [`ExtensionLink::complete`].

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::{RelayRequestId, SessionId};
use crate::protocol::{meta, CdpError, CommandFrame, Envelope};
use crate::router::{self, Relay};

// ============================================================================
// Constants
// ============================================================================

/// Outbound queue capacity on the extension link.
pub const QUEUE_CAPACITY: usize = 256;

/// Policy close sent to a replaced extension.
pub const CLOSE_REPLACED: u16 = 1008;

static NEXT_LINK_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Reply channel for an in-flight extension request.
type Waiter = oneshot::Sender<StdResult<Value, CdpError>>;

// ============================================================================
// ExtensionLink
// ============================================================================

/// Shared handle to the extension link.
pub struct ExtensionLink {
    generation: u64,
    outbound: mpsc::Sender<String>,
    waiters: Mutex<FxHashMap<i64, Waiter>>,
    close_tx: Mutex<Option<oneshot::Sender<(u16, &'static str)>>>,
}

impl ExtensionLink {
    /// Creates a link handle plus the receivers its writer task drains.
    pub fn new() -> (
        Arc<Self>,
        mpsc::Receiver<String>,
        oneshot::Receiver<(u16, &'static str)>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();
        let link = Arc::new(Self {
            generation: NEXT_LINK_GENERATION.fetch_add(1, Ordering::Relaxed),
            outbound: outbound_tx,
            waiters: Mutex::new(FxHashMap::default()),
            close_tx: Mutex::new(Some(close_tx)),
        });
        (link, outbound_rx, close_rx)
    }

    /// Link generation (unique per accepted socket).
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Enqueues a frame on the outbound queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExtensionDisconnected`] when the link has closed.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let text = envelope.to_text()?;
        self.outbound
            .send(text)
            .await
            .map_err(|_| Error::ExtensionDisconnected)
    }

    /// Sends a CDP command on a session and waits for the matching reply.
    ///
    /// The command id comes from the relay-global counter, so it never
    /// collides with forwarded client commands sharing this link.
    pub async fn request_cdp(
        &self,
        session_id: &SessionId,
        method: &str,
        params: Value,
    ) -> StdResult<Value, CdpError> {
        let id = RelayRequestId::next().value();
        let frame = CommandFrame::new(id, method, Some(params));
        let payload = match serde_json::to_value(&frame) {
            Ok(payload) => payload,
            Err(e) => return Err(CdpError::invalid_request(e.to_string())),
        };
        self.request(id, Envelope::cdp(session_id.clone(), payload))
            .await
    }

    /// Sends an extension-level meta request and waits for the reply.
    pub async fn request_meta(&self, method: &str, params: Value) -> StdResult<Value, CdpError> {
        let id = RelayRequestId::next().value();
        self.request(id, Envelope::meta_request(id, method, params))
            .await
    }

    async fn request(&self, id: i64, envelope: Envelope) -> StdResult<Value, CdpError> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);

        if self.send(&envelope).await.is_err() {
            self.waiters.lock().remove(&id);
            return Err(CdpError::disconnected());
        }

        match rx.await {
            Ok(outcome) => outcome,
            // Waiter dropped without resolution: the link died.
            Err(_) => Err(CdpError::disconnected()),
        }
    }

    /// Resolves the waiter registered under `id`.
    ///
    /// Returns `false` when no waiter matches, meaning the reply belongs to
    /// a forwarded client command instead.
    pub fn complete(&self, id: i64, outcome: StdResult<Value, CdpError>) -> bool {
        match self.waiters.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Rejects every registered waiter with a disconnect error.
    pub fn fail_all(&self) {
        let drained: Vec<(i64, Waiter)> = self.waiters.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(CdpError::disconnected()));
        }
        if count > 0 {
            debug!(count, "Failed pending extension requests");
        }
    }

    /// Requests a close; the first call wins.
    pub fn close(&self, code: u16, reason: &'static str) {
        if let Some(tx) = self.close_tx.lock().take() {
            let _ = tx.send((code, reason));
        }
    }
}

impl std::fmt::Debug for ExtensionLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionLink")
            .field("generation", &self.generation)
            .field("pending_waiters", &self.waiters.lock().len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Socket Tasks
// ============================================================================

/// Runs one extension WebSocket to completion.
///
/// Installs the link (closing any previous extension and tearing down its
/// registry state), signals the window-mode preference, then pumps frames
/// until the socket ends.
pub async fn run_extension_socket(relay: Arc<Relay>, socket: WebSocket) {
    let (link, outbound_rx, close_rx) = ExtensionLink::new();

    router::register_extension(&relay, &link);
    info!(generation = link.generation(), "Extension connected");

    if relay.config().separate_window {
        let link_for_mode = Arc::clone(&link);
        tokio::spawn(async move {
            match link_for_mode
                .request_meta(meta::SET_WINDOW_MODE, serde_json::json!({"separate": true}))
                .await
            {
                Ok(_) => debug!("Extension acknowledged separate window mode"),
                Err(e) => warn!(error = %e.message, "setWindowMode not acknowledged"),
            }
        });
    }

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(ws_tx, outbound_rx, close_rx));

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                router::handle_extension_text(&relay, &link, text.as_str()).await;
            }
            Ok(Message::Close(_)) => {
                debug!("Extension sent close frame");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Extension socket error");
                break;
            }
        }
    }

    // Tear down only if this link is still the installed one; a replaced
    // link was already torn down when its successor arrived.
    if relay.remove_extension_if(&link) {
        router::extension_lost(&relay, &link);
    }
    writer.abort();

    info!(generation = link.generation(), "Extension disconnected");
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<String>,
    mut close_rx: oneshot::Receiver<(u16, &'static str)>,
) {
    loop {
        tokio::select! {
            biased;

            closed = &mut close_rx => {
                if let Ok((code, reason)) = closed {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                }
                break;
            }

            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CODE_SESSION_ERROR;

    #[tokio::test]
    async fn test_request_resolves_on_complete() {
        let (link, mut outbound_rx, _close) = ExtensionLink::new();

        let request_link = Arc::clone(&link);
        let request = tokio::spawn(async move {
            request_link
                .request_cdp(
                    &SessionId::new("S1"),
                    "Network.getCookies",
                    serde_json::json!({"urls": []}),
                )
                .await
        });

        let sent = outbound_rx.recv().await.expect("outbound frame");
        let envelope = Envelope::parse(&sent).expect("envelope");
        let id = match envelope {
            Envelope::Cdp { session_id, payload } => {
                assert_eq!(session_id, Some(SessionId::new("S1")));
                assert_eq!(payload["method"], "Network.getCookies");
                payload["id"].as_i64().expect("id")
            }
            Envelope::Meta { .. } => panic!("expected cdp envelope"),
        };

        assert!(link.complete(id, Ok(serde_json::json!({"cookies": []}))));
        let outcome = request.await.expect("join").expect("resolved");
        assert_eq!(outcome["cookies"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_complete_unknown_id_returns_false() {
        let (link, _outbound_rx, _close) = ExtensionLink::new();
        assert!(!link.complete(12345, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_fail_all_rejects_waiters() {
        let (link, mut outbound_rx, _close) = ExtensionLink::new();

        let request_link = Arc::clone(&link);
        let request = tokio::spawn(async move {
            request_link
                .request_meta(meta::CREATE_TARGET, serde_json::json!({"url": "about:blank"}))
                .await
        });
        let _ = outbound_rx.recv().await.expect("outbound frame");

        link.fail_all();
        let err = request.await.expect("join").expect_err("rejected");
        assert_eq!(err.code, CODE_SESSION_ERROR);
    }

    #[tokio::test]
    async fn test_request_after_close_is_disconnected() {
        let (link, outbound_rx, _close) = ExtensionLink::new();
        drop(outbound_rx);

        let err = link
            .request_cdp(&SessionId::new("S1"), "Network.getCookies", Value::Null)
            .await
            .expect_err("disconnected");
        assert_eq!(err.code, CODE_SESSION_ERROR);
        // The waiter must not leak.
        assert!(link.waiters.lock().is_empty());
    }

    #[tokio::test]
    async fn test_send_preserves_enqueue_order() {
        let (link, mut outbound_rx, _close) = ExtensionLink::new();
        for i in 0..3 {
            link.send(&Envelope::meta_notification(
                "setWindowMode",
                serde_json::json!({"seq": i}),
            ))
            .await
            .expect("send");
        }
        for i in 0..3 {
            let text = outbound_rx.recv().await.expect("frame");
            assert!(text.contains(&format!("\"seq\":{i}")));
        }
    }
}
