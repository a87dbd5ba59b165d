//! Client link: one WebSocket per CDP client.
//!
//! Each accepted client gets a [`ClientHandle`] with a bounded outbound
//! mailbox. The reader task hands frames to the router; the writer task
//! drains the mailbox. A client that cannot keep up overflows its mailbox
//! and is closed with a policy code, and its pending requests are reaped.
//!
//! Duplicate client ids are last-writer-wins: installing a new handle under
//! an existing id closes the older link.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::identifiers::{ClientId, SessionId};
use crate::router::{self, Relay};

// ============================================================================
// Constants
// ============================================================================

/// Outbound mailbox capacity per client.
pub const MAILBOX_CAPACITY: usize = 256;

/// Normal close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Policy close: backpressure overflow or duplicate client id.
pub const CLOSE_POLICY: u16 = 1011;

// ============================================================================
// Types
// ============================================================================

/// Frames travelling to the client writer task.
#[derive(Debug)]
pub enum ClientOutbound {
    /// Serialized CDP frame.
    Frame(String),
    /// Pong reply.
    Pong(axum::body::Bytes),
}

/// Outcome of a mailbox enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Frame queued.
    Sent,
    /// Mailbox full; the client is falling behind.
    Overflow,
    /// Client already gone.
    Gone,
}

static NEXT_CLIENT_GENERATION: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// ClientHandle
// ============================================================================

/// Shared handle to one client link.
///
/// Owned by the connection tasks and the router; cheap to clone through
/// `Arc`. The generation distinguishes successive connections that reuse
/// the same client id, so a replaced link never reaps its successor's
/// pending requests.
pub struct ClientHandle {
    id: ClientId,
    generation: u64,
    mailbox: mpsc::Sender<ClientOutbound>,
    close_tx: Mutex<Option<oneshot::Sender<(u16, &'static str)>>>,
    discover: AtomicBool,
    announced: Mutex<FxHashSet<SessionId>>,
}

impl ClientHandle {
    /// Creates a handle plus the receivers its writer task drains.
    pub fn new(
        id: ClientId,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<ClientOutbound>,
        oneshot::Receiver<(u16, &'static str)>,
    ) {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();
        let handle = Arc::new(Self {
            id,
            generation: NEXT_CLIENT_GENERATION.fetch_add(1, Ordering::Relaxed),
            mailbox: mailbox_tx,
            close_tx: Mutex::new(Some(close_tx)),
            discover: AtomicBool::new(false),
            announced: Mutex::new(FxHashSet::default()),
        });
        (handle, mailbox_rx, close_rx)
    }

    /// Client id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Connection generation (unique per accepted socket).
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Enqueues a serializable frame on the mailbox.
    pub fn enqueue_json<T: Serialize>(&self, frame: &T) -> EnqueueOutcome {
        match serde_json::to_string(frame) {
            Ok(text) => self.enqueue_text(text),
            Err(e) => {
                warn!(client_id = %self.id, error = %e, "Failed to serialize outbound frame");
                EnqueueOutcome::Sent
            }
        }
    }

    /// Enqueues pre-serialized text on the mailbox.
    pub fn enqueue_text(&self, text: String) -> EnqueueOutcome {
        match self.mailbox.try_send(ClientOutbound::Frame(text)) {
            Ok(()) => EnqueueOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => EnqueueOutcome::Overflow,
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::Gone,
        }
    }

    /// Requests a close; the first call wins.
    pub fn close(&self, code: u16, reason: &'static str) {
        if let Some(tx) = self.close_tx.lock().take() {
            let _ = tx.send((code, reason));
        }
    }

    /// Sets the target-discovery flag (`Target.setDiscoverTargets` /
    /// `Target.setAutoAttach`).
    #[inline]
    pub fn set_discover(&self, on: bool) {
        self.discover.store(on, Ordering::Relaxed);
    }

    /// Returns the target-discovery flag.
    #[inline]
    #[must_use]
    pub fn discover(&self) -> bool {
        self.discover.load(Ordering::Relaxed)
    }

    /// Records that `Target.attachedToTarget` was sent for a session.
    ///
    /// Returns `true` only the first time, making discovery replays
    /// idempotent per client.
    pub fn announce(&self, session_id: &SessionId) -> bool {
        self.announced.lock().insert(session_id.clone())
    }

    /// Forgets an announced session after its detach.
    pub fn forget(&self, session_id: &SessionId) {
        self.announced.lock().remove(session_id);
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Socket Tasks
// ============================================================================

/// Runs one client WebSocket to completion.
///
/// Registers the handle (evicting any older link with the same id), pumps
/// frames both ways, and reaps the client's registrations and pending
/// requests when the socket ends.
pub async fn run_client_socket(relay: Arc<Relay>, client_id: ClientId, socket: WebSocket) {
    let (handle, mailbox_rx, close_rx) = ClientHandle::new(client_id.clone());

    router::register_client(&relay, &handle);
    info!(
        client_id = %client_id,
        generation = handle.generation(),
        "Client connected"
    );

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(ws_tx, mailbox_rx, close_rx));

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                router::handle_client_frame(&relay, &handle, text.as_str()).await;
            }
            Ok(Message::Ping(data)) => {
                let _ = handle.mailbox.try_send(ClientOutbound::Pong(data));
            }
            Ok(Message::Close(_)) => {
                debug!(client_id = %client_id, "Client sent close frame");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Client socket error");
                break;
            }
        }
    }

    relay.remove_client_if(&handle);
    router::reap_client(&relay, &handle);
    writer.abort();

    info!(client_id = %client_id, "Client disconnected");
}

/// Drains the mailbox into the socket; a close request preempts queued
/// frames.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut mailbox_rx: mpsc::Receiver<ClientOutbound>,
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

            outbound = mailbox_rx.recv() => {
                let result = match outbound {
                    Some(ClientOutbound::Frame(text)) => ws_tx.send(Message::Text(text.into())).await,
                    Some(ClientOutbound::Pong(data)) => ws_tx.send(Message::Pong(data)).await,
                    None => break,
                };
                if result.is_err() {
                    break;
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
