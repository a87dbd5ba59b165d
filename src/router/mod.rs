//! Command router: the heart of the relay.
//!
//! For every inbound client command the router picks one of four
//! dispositions:
//!
//! | Disposition | When | Handling |
//! |-------------|------|----------|
//! | Synthesize | Browser-level commands with no extension counterpart | Answered by the relay |
//! | Rewrite | Browser-scope cookie commands | Re-issued as page-scope commands ([`cookies`]) |
//! | Forward | Command carries a known `sessionId` | Relay-assigned id, pending-table record |
//! | Reject | Anything else at browser scope | `-32601 Method not found` |
//!
//! Events from the extension fan out to every client subscribed to the
//! event's session; sessionless events broadcast to all clients. Per
//! `(sessionId, client)` pair the router never reorders frames: events are
//! delivered in extension-receive order and replies in command-send order,
//! both riding the client's single FIFO mailbox.

// ============================================================================
// Submodules
// ============================================================================

/// Cookie command rewrites.
pub mod cookies;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, trace, warn};

use crate::config::RelayConfig;
use crate::identifiers::{ClientId, RelayRequestId, SessionId, TargetId};
use crate::link::client::{ClientHandle, EnqueueOutcome, CLOSE_POLICY};
use crate::link::extension::{ExtensionLink, CLOSE_REPLACED};
use crate::protocol::envelope::{AttachedParams, DetachedParams, InfoChangedParams};
use crate::protocol::{
    meta, parse_client_command, parse_extension_cdp, probe_id, CdpError, CommandFrame, Envelope,
    EventFrame, ExtensionCdp, MetaPayload, ResponseFrame, TargetInfo, PROTOCOL_VERSION,
};
use crate::registry::{ExtensionStatus, Registry};

use cookies::CookieOp;

// ============================================================================
// Relay State
// ============================================================================

/// Shared relay state: registry, pending table, client handles, and the
/// extension slot.
///
/// Cross-references between clients, sessions, and pending requests are id
/// values into these tables, never object references; lifetime is governed
/// by the tables.
pub struct Relay {
    config: RelayConfig,
    registry: Mutex<Registry>,
    pending: Mutex<FxHashMap<i64, PendingRequest>>,
    clients: Mutex<FxHashMap<ClientId, Arc<ClientHandle>>>,
    extension: Mutex<Option<Arc<ExtensionLink>>>,
}

/// An in-flight forwarded command awaiting its extension reply.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Holder of the request.
    pub client_id: ClientId,

    /// Holder's connection generation; a reconnect under the same id must
    /// not receive stale replies.
    pub client_generation: u64,

    /// The id the client used, restored on reply.
    pub client_request_id: i64,

    /// Original method, kept for logging.
    pub method: String,

    /// Session the command was scoped to.
    pub session_id: SessionId,

    /// Creation timestamp.
    pub sent_at: Instant,
}

impl Relay {
    /// Creates relay state from a configuration.
    #[must_use]
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Mutex::new(Registry::new()),
            pending: Mutex::new(FxHashMap::default()),
            clients: Mutex::new(FxHashMap::default()),
            extension: Mutex::new(None),
        })
    }

    /// Relay configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Installs a client handle, returning any displaced older handle for
    /// the same id (last-writer-wins).
    pub fn install_client(&self, handle: Arc<ClientHandle>) -> Option<Arc<ClientHandle>> {
        self.clients.lock().insert(handle.id().clone(), handle)
    }

    /// Removes a client handle if it is still the installed one.
    pub fn remove_client_if(&self, handle: &Arc<ClientHandle>) -> bool {
        let mut clients = self.clients.lock();
        match clients.get(handle.id()) {
            Some(current) if current.generation() == handle.generation() => {
                clients.remove(handle.id());
                true
            }
            _ => false,
        }
    }

    /// Looks up a client handle.
    #[must_use]
    pub fn client(&self, id: &ClientId) -> Option<Arc<ClientHandle>> {
        self.clients.lock().get(id).cloned()
    }

    /// Snapshot of every connected client.
    #[must_use]
    pub fn clients(&self) -> Vec<Arc<ClientHandle>> {
        self.clients.lock().values().cloned().collect()
    }

    /// Installs the extension link, returning the displaced one if an
    /// extension was already connected.
    pub fn install_extension(&self, link: Arc<ExtensionLink>) -> Option<Arc<ExtensionLink>> {
        self.extension.lock().replace(link)
    }

    /// Removes the extension link if it is still the installed one.
    pub fn remove_extension_if(&self, link: &Arc<ExtensionLink>) -> bool {
        let mut slot = self.extension.lock();
        match slot.as_ref() {
            Some(current) if current.generation() == link.generation() => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// The current extension link.
    #[must_use]
    pub fn extension(&self) -> Option<Arc<ExtensionLink>> {
        self.extension.lock().clone()
    }

    /// Registry guard for small critical sections.
    pub(crate) fn registry(&self) -> parking_lot::MutexGuard<'_, Registry> {
        self.registry.lock()
    }

    /// Target descriptors in attachment order (HTTP discovery surface).
    #[must_use]
    pub fn list_targets(&self) -> Vec<TargetInfo> {
        self.registry.lock().list_targets()
    }

    /// Extension status snapshot.
    #[must_use]
    pub fn status(&self) -> ExtensionStatus {
        let connected = self.extension.lock().is_some();
        let registry = self.registry.lock();
        ExtensionStatus {
            connected,
            page_count: registry.page_count(),
            pages: registry.list_targets(),
        }
    }

    /// Number of in-flight forwards (diagnostics and tests).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

// ============================================================================
// Registration
// ============================================================================

/// Registers a client link, evicting an older link holding the same id.
pub fn register_client(relay: &Arc<Relay>, handle: &Arc<ClientHandle>) {
    if let Some(older) = relay.install_client(Arc::clone(handle)) {
        info!(client_id = %handle.id(), "Evicting older link for duplicate clientId");
        older.close(CLOSE_POLICY, "duplicate clientId");
    }
}

/// Registers the extension link, replacing and tearing down a previous one.
pub fn register_extension(relay: &Arc<Relay>, link: &Arc<ExtensionLink>) {
    if let Some(older) = relay.install_extension(Arc::clone(link)) {
        info!("Second extension connected; replacing the first");
        older.close(CLOSE_REPLACED, "extension replaced");
        extension_lost(relay, &older);
    }
}

// ============================================================================
// Dispositions
// ============================================================================

/// How a browser-scope command is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Answered directly by the relay.
    Synthesize(SynthOp),
    /// Rewritten to page-scope commands.
    Rewrite(CookieOp),
    /// `-32601 Method not found`.
    Reject,
}

/// Synthesized browser-scope operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SynthOp {
    GetTargets,
    SetDiscoverTargets,
    SetAutoAttach,
    AttachToTarget,
    BrowserVersion,
    CreateTarget,
}

/// Dispatch table for browser-scope methods. Session-scoped commands never
/// reach this table; they forward based on the session lookup alone.
pub(crate) fn disposition(method: &str) -> Disposition {
    match method {
        "Target.getTargets" => Disposition::Synthesize(SynthOp::GetTargets),
        "Target.setDiscoverTargets" => Disposition::Synthesize(SynthOp::SetDiscoverTargets),
        "Target.setAutoAttach" => Disposition::Synthesize(SynthOp::SetAutoAttach),
        "Target.attachToTarget" => Disposition::Synthesize(SynthOp::AttachToTarget),
        "Target.createTarget" => Disposition::Synthesize(SynthOp::CreateTarget),
        "Browser.getVersion" => Disposition::Synthesize(SynthOp::BrowserVersion),
        "Storage.getCookies" => Disposition::Rewrite(CookieOp::Get),
        "Storage.setCookies" => Disposition::Rewrite(CookieOp::Set),
        "Storage.clearCookies" => Disposition::Rewrite(CookieOp::Clear),
        _ => Disposition::Reject,
    }
}

// ============================================================================
// Delivery Helpers
// ============================================================================

/// Puts a frame on a client mailbox; overflow closes the link with the
/// policy code.
pub(crate) fn deliver<T: Serialize>(handle: &Arc<ClientHandle>, frame: &T) {
    match handle.enqueue_json(frame) {
        EnqueueOutcome::Sent | EnqueueOutcome::Gone => {}
        EnqueueOutcome::Overflow => {
            warn!(client_id = %handle.id(), "Client mailbox overflow; closing");
            handle.close(CLOSE_POLICY, "backpressure overflow");
        }
    }
}

pub(crate) fn respond_ok(handle: &Arc<ClientHandle>, id: i64, result: Value) {
    deliver(handle, &ResponseFrame::ok(id, result, None));
}

pub(crate) fn respond_err(handle: &Arc<ClientHandle>, id: i64, error: CdpError) {
    deliver(handle, &ResponseFrame::err(id, error, None));
}

// ============================================================================
// Client Frames
// ============================================================================

/// Routes one frame received from a client.
pub async fn handle_client_frame(relay: &Arc<Relay>, client: &Arc<ClientHandle>, text: &str) {
    let frame = match parse_client_command(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(client_id = %client.id(), error = %e, "Rejecting malformed client frame");
            respond_err(client, probe_id(text), CdpError::from(&e));
            return;
        }
    };

    trace!(
        client_id = %client.id(),
        id = frame.id,
        method = %frame.method,
        session_id = ?frame.session_id,
        "Client command"
    );

    // Session-scoped commands forward verbatim; everything else goes
    // through the browser-scope dispatch table.
    if let Some(session_id) = frame.session_id.clone() {
        forward(relay, client, frame, session_id).await;
        return;
    }

    match disposition(&frame.method) {
        Disposition::Synthesize(op) => synthesize(relay, client, op, frame).await,
        Disposition::Rewrite(op) => {
            // Rewrites span several extension round-trips; run them off the
            // reader so the client can keep issuing commands.
            let relay = Arc::clone(relay);
            let client = Arc::clone(client);
            tokio::spawn(async move {
                cookies::dispatch(&relay, &client, op, frame).await;
            });
        }
        Disposition::Reject => {
            respond_err(client, frame.id, CdpError::method_not_found(&frame.method));
        }
    }
}

/// Forwards a session-scoped command to the extension.
async fn forward(
    relay: &Arc<Relay>,
    client: &Arc<ClientHandle>,
    mut frame: CommandFrame,
    session_id: SessionId,
) {
    if !relay.registry().has_session(&session_id) {
        respond_err(client, frame.id, CdpError::session_not_found(&session_id));
        return;
    }
    let Some(link) = relay.extension() else {
        respond_err(client, frame.id, CdpError::disconnected());
        return;
    };

    let relay_id = RelayRequestId::next().value();
    relay.pending.lock().insert(
        relay_id,
        PendingRequest {
            client_id: client.id().clone(),
            client_generation: client.generation(),
            client_request_id: frame.id,
            method: frame.method.clone(),
            session_id: session_id.clone(),
            sent_at: Instant::now(),
        },
    );

    let client_request_id = frame.id;
    frame.id = relay_id;
    frame.session_id = None;
    let payload = match serde_json::to_value(&frame) {
        Ok(payload) => payload,
        Err(e) => {
            relay.pending.lock().remove(&relay_id);
            respond_err(client, client_request_id, CdpError::invalid_request(e.to_string()));
            return;
        }
    };

    if link.send(&Envelope::cdp(session_id, payload)).await.is_err() {
        if let Some(entry) = relay.pending.lock().remove(&relay_id) {
            respond_err(client, entry.client_request_id, CdpError::disconnected());
        }
    }
}

// ============================================================================
// Synthesized Commands
// ============================================================================

async fn synthesize(relay: &Arc<Relay>, client: &Arc<ClientHandle>, op: SynthOp, frame: CommandFrame) {
    match op {
        SynthOp::GetTargets => {
            let target_infos = relay.list_targets();
            respond_ok(client, frame.id, json!({ "targetInfos": target_infos }));
        }

        SynthOp::BrowserVersion => {
            let product = crate::protocol::product();
            respond_ok(
                client,
                frame.id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "product": product,
                    "userAgent": product,
                }),
            );
        }

        SynthOp::SetDiscoverTargets => {
            let discover = frame
                .params
                .as_ref()
                .and_then(|p| p.get("discover"))
                .and_then(Value::as_bool);
            let Some(discover) = discover else {
                respond_err(
                    client,
                    frame.id,
                    CdpError::invalid_params("boolean 'discover' is required"),
                );
                return;
            };
            client.set_discover(discover);
            respond_ok(client, frame.id, json!({}));
            if discover {
                replay_targets(relay, client);
            }
        }

        SynthOp::SetAutoAttach => {
            let auto_attach = frame
                .params
                .as_ref()
                .and_then(|p| p.get("autoAttach"))
                .and_then(Value::as_bool)
                .unwrap_or(true);
            client.set_discover(auto_attach);
            respond_ok(client, frame.id, json!({}));
            if auto_attach {
                replay_targets(relay, client);
            }
        }

        SynthOp::AttachToTarget => {
            let target_id = frame
                .params
                .as_ref()
                .and_then(|p| p.get("targetId"))
                .and_then(Value::as_str)
                .map(TargetId::new);
            let Some(target_id) = target_id else {
                respond_err(
                    client,
                    frame.id,
                    CdpError::invalid_params("string 'targetId' is required"),
                );
                return;
            };

            let session_id = {
                let mut registry = relay.registry();
                let session_id = registry.session_for(&target_id);
                if let Some(ref session_id) = session_id {
                    registry.subscribe(client.id().clone(), session_id);
                }
                session_id
            };
            match session_id {
                Some(session_id) => {
                    client.announce(&session_id);
                    respond_ok(client, frame.id, json!({ "sessionId": session_id }));
                }
                None => respond_err(
                    client,
                    frame.id,
                    CdpError::invalid_params(format!("No target with given id found: {target_id}")),
                ),
            }
        }

        SynthOp::CreateTarget => {
            // A browser operation the extension executes; forwarded as an
            // extension-level RPC rather than CDP.
            let Some(link) = relay.extension() else {
                respond_err(client, frame.id, CdpError::disconnected());
                return;
            };
            let params = frame.params.clone().unwrap_or_else(|| json!({}));
            let client_clone = Arc::clone(client);
            let client_request_id = frame.id;
            tokio::spawn(async move {
                match link.request_meta(meta::CREATE_TARGET, params).await {
                    Ok(result) => respond_ok(&client_clone, client_request_id, result),
                    Err(error) => respond_err(&client_clone, client_request_id, error),
                }
            });
        }
    }
}

/// Emits `Target.attachedToTarget` for every existing target the client has
/// not been told about yet, subscribing it along the way. Replay order is
/// attachment order; repeated discovery calls are idempotent because
/// [`ClientHandle::announce`] only fires once per session.
fn replay_targets(relay: &Arc<Relay>, client: &Arc<ClientHandle>) {
    let entries = relay.registry().ordered_entries();
    for (session_id, info) in entries {
        announce_target(relay, client, &session_id, &info);
    }
}

fn announce_target(
    relay: &Arc<Relay>,
    client: &Arc<ClientHandle>,
    session_id: &SessionId,
    info: &TargetInfo,
) {
    if !client.announce(session_id) {
        return;
    }
    relay.registry().subscribe(client.id().clone(), session_id);
    deliver(
        client,
        &EventFrame::new(
            "Target.attachedToTarget",
            json!({
                "sessionId": session_id,
                "targetInfo": info,
                "waitingForDebugger": false,
            }),
            None,
        ),
    );
}

// ============================================================================
// Extension Frames
// ============================================================================

/// Routes one frame received from the extension.
pub async fn handle_extension_text(relay: &Arc<Relay>, link: &Arc<ExtensionLink>, text: &str) {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "Rejecting malformed extension frame");
            let reply = Envelope::Meta {
                payload: MetaPayload {
                    id: None,
                    method: None,
                    params: None,
                    result: None,
                    error: Some(CdpError::invalid_request(e.to_string())),
                },
            };
            let _ = link.send(&reply).await;
            return;
        }
    };

    match envelope {
        Envelope::Meta { payload } if payload.is_reply() => {
            let id = payload.id.unwrap_or_default();
            let outcome = match payload.error {
                Some(error) => Err(error),
                None => Ok(payload.result.unwrap_or(Value::Null)),
            };
            if !link.complete(id, outcome) {
                debug!(id, "Meta reply with no waiter");
            }
        }
        Envelope::Meta { payload } => handle_meta_notification(relay, payload),
        Envelope::Cdp { session_id, payload } => match parse_extension_cdp(payload) {
            Ok(ExtensionCdp::Response(frame)) => handle_extension_response(relay, link, frame),
            Ok(ExtensionCdp::Event(frame)) => handle_extension_event(relay, frame, session_id),
            Err(e) => {
                debug!(error = %e, "Rejecting malformed cdp payload from extension");
                let reply = Envelope::Cdp {
                    session_id,
                    payload: serde_json::to_value(ResponseFrame::err(
                        0,
                        CdpError::invalid_request(e.to_string()),
                        None,
                    ))
                    .unwrap_or(Value::Null),
                };
                let _ = link.send(&reply).await;
            }
        },
    }
}

/// Handles target lifecycle notifications from the extension.
fn handle_meta_notification(relay: &Arc<Relay>, payload: MetaPayload) {
    let method = payload.method.as_deref().unwrap_or_default();
    let params = payload.params.unwrap_or(Value::Null);

    match method {
        meta::TARGET_ATTACHED => {
            let parsed: AttachedParams = match serde_json::from_value(params) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "Malformed Target.attached params");
                    return;
                }
            };
            let info = parsed.target_info.clone();
            let outcome = relay
                .registry()
                .attach(parsed.target_info, parsed.session_id);
            info!(
                target_id = %info.target_id,
                session_id = %outcome.session_id,
                is_new = outcome.is_new,
                url = %info.url,
                "Target attached"
            );
            if outcome.is_new {
                for client in relay.clients() {
                    if client.discover() {
                        announce_target(relay, &client, &outcome.session_id, &info);
                    }
                }
            }
        }

        meta::TARGET_DETACHED => {
            let parsed: DetachedParams = match serde_json::from_value(params) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "Malformed Target.detached params");
                    return;
                }
            };
            let Some(detached) = relay.registry().detach(&parsed.target_id) else {
                debug!(target_id = %parsed.target_id, "Detach for unknown target");
                return;
            };
            info!(
                target_id = %detached.target_id,
                session_id = %detached.session_id,
                "Target detached"
            );
            emit_detached(relay, &detached.session_id, &detached.target_id, &detached.subscribers);
        }

        meta::TARGET_INFO_CHANGED => {
            let parsed: InfoChangedParams = match serde_json::from_value(params) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "Malformed Target.targetInfoChanged params");
                    return;
                }
            };
            let info = parsed.target_info.clone();
            let session_id = relay.registry().update_info(parsed.target_info);
            if let Some(session_id) = session_id {
                let subscribers = relay.registry().subscribers(&session_id);
                let event = EventFrame::new(
                    "Target.targetInfoChanged",
                    json!({ "targetInfo": info }),
                    None,
                );
                for client_id in subscribers {
                    if let Some(client) = relay.client(&client_id) {
                        deliver(&client, &event);
                    }
                }
            }
        }

        other => debug!(method = %other, "Ignoring unknown meta notification"),
    }
}

/// Translates a forwarded reply back to its holder.
fn handle_extension_response(
    relay: &Arc<Relay>,
    link: &Arc<ExtensionLink>,
    mut frame: ResponseFrame,
) {
    // Internal waiters (rewrites, createTarget) resolve in O(1) first.
    let waiter_outcome = match &frame.error {
        Some(error) => Err(error.clone()),
        None => Ok(frame.result.clone().unwrap_or(Value::Null)),
    };
    if link.complete(frame.id, waiter_outcome) {
        return;
    }

    let Some(entry) = relay.pending.lock().remove(&frame.id) else {
        debug!(id = frame.id, "Reply for unknown request id");
        return;
    };

    let holder = relay
        .client(&entry.client_id)
        .filter(|client| client.generation() == entry.client_generation);
    let Some(client) = holder else {
        debug!(
            client_id = %entry.client_id,
            method = %entry.method,
            "Dropping reply; holder is gone"
        );
        return;
    };

    trace!(
        client_id = %entry.client_id,
        method = %entry.method,
        elapsed_ms = entry.sent_at.elapsed().as_millis() as u64,
        "Forward completed"
    );

    frame.id = entry.client_request_id;
    frame.session_id = Some(entry.session_id);
    deliver(&client, &frame);
}

/// Fans a browser event out to subscribed clients, stamping the session's
/// outbound sequence for ordering checks.
fn handle_extension_event(
    relay: &Arc<Relay>,
    mut frame: EventFrame,
    envelope_session: Option<SessionId>,
) {
    let session_id = frame.session_id.take().or(envelope_session);

    match session_id {
        Some(session_id) => {
            let (seq, subscribers) = {
                let mut registry = relay.registry();
                (
                    registry.next_event_seq(&session_id),
                    registry.subscribers(&session_id),
                )
            };
            if seq.is_none() {
                debug!(
                    session_id = %session_id,
                    method = %frame.method,
                    "Event for unknown session"
                );
                return;
            }
            trace!(
                session_id = %session_id,
                method = %frame.method,
                seq = seq.unwrap_or_default(),
                subscribers = subscribers.len(),
                "Fanning out session event"
            );

            frame.session_id = Some(session_id);
            for client_id in subscribers {
                if let Some(client) = relay.client(&client_id) {
                    deliver(&client, &frame);
                }
            }
        }
        None => {
            // Browser-scope events broadcast to every client.
            for client in relay.clients() {
                deliver(&client, &frame);
            }
        }
    }
}

// ============================================================================
// Teardown
// ============================================================================

/// Reaps a closed client: subscriptions and its pending requests.
///
/// In-flight extension-side operations are allowed to complete; their
/// replies are dropped when no holder matches.
pub fn reap_client(relay: &Arc<Relay>, handle: &Arc<ClientHandle>) {
    relay.registry().unsubscribe_client(handle.id());

    let mut pending = relay.pending.lock();
    let before = pending.len();
    pending.retain(|_, entry| {
        entry.client_id != *handle.id() || entry.client_generation != handle.generation()
    });
    let reaped = before - pending.len();
    if reaped > 0 {
        debug!(client_id = %handle.id(), reaped, "Reaped pending requests for closed client");
    }
}

/// Tears down state bound to a lost extension link: every pending forward
/// resolves with extension-disconnected, every session detaches, and every
/// internal waiter rejects.
pub fn extension_lost(relay: &Arc<Relay>, link: &Arc<ExtensionLink>) {
    link.fail_all();

    let drained: Vec<PendingRequest> = {
        let mut pending = relay.pending.lock();
        pending.drain().map(|(_, entry)| entry).collect()
    };
    if !drained.is_empty() {
        info!(count = drained.len(), "Cancelling forwards lost with extension link");
    }
    for entry in drained {
        let holder = relay
            .client(&entry.client_id)
            .filter(|client| client.generation() == entry.client_generation);
        if let Some(client) = holder {
            deliver(
                &client,
                &ResponseFrame::err(
                    entry.client_request_id,
                    CdpError::disconnected(),
                    Some(entry.session_id),
                ),
            );
        }
    }

    let detached = relay.registry().clear();
    for session in detached {
        emit_detached(relay, &session.session_id, &session.target_id, &session.subscribers);
    }
}

/// Sends a synthetic `Target.detachedFromTarget` to each subscriber.
fn emit_detached(
    relay: &Arc<Relay>,
    session_id: &SessionId,
    target_id: &TargetId,
    subscribers: &[ClientId],
) {
    let event = EventFrame::new(
        "Target.detachedFromTarget",
        json!({ "sessionId": session_id, "targetId": target_id }),
        None,
    );
    for client_id in subscribers {
        if let Some(client) = relay.client(client_id) {
            client.forget(session_id);
            deliver(&client, &event);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{
        CODE_INVALID_REQUEST, CODE_METHOD_NOT_FOUND, CODE_SERVER_ERROR, CODE_SESSION_ERROR,
    };
    use crate::link::client::ClientOutbound;
    use tokio::sync::{mpsc, oneshot};

    // ------------------------------------------------------------------
    // Harness: mailbox receivers stand in for sockets.
    // ------------------------------------------------------------------

    struct TestClient {
        handle: Arc<ClientHandle>,
        rx: mpsc::Receiver<ClientOutbound>,
        close_rx: oneshot::Receiver<(u16, &'static str)>,
    }

    impl TestClient {
        async fn next_json(&mut self) -> Value {
            match self.rx.recv().await.expect("outbound frame") {
                ClientOutbound::Frame(text) => {
                    serde_json::from_str(&text).expect("valid frame json")
                }
                other => panic!("unexpected outbound: {other:?}"),
            }
        }

        fn try_next_json(&mut self) -> Option<Value> {
            match self.rx.try_recv() {
                Ok(ClientOutbound::Frame(text)) => {
                    Some(serde_json::from_str(&text).expect("valid frame json"))
                }
                Ok(other) => panic!("unexpected outbound: {other:?}"),
                Err(_) => None,
            }
        }
    }

    struct TestExtension {
        link: Arc<ExtensionLink>,
        rx: mpsc::Receiver<String>,
        close_rx: oneshot::Receiver<(u16, &'static str)>,
    }

    impl TestExtension {
        async fn next_envelope(&mut self) -> Value {
            let text = self.rx.recv().await.expect("extension outbound");
            serde_json::from_str(&text).expect("valid envelope json")
        }
    }

    fn relay() -> Arc<Relay> {
        Relay::new(RelayConfig::default())
    }

    fn connect_client(relay: &Arc<Relay>, name: &str) -> TestClient {
        let (handle, rx, close_rx) =
            ClientHandle::new(ClientId::parse(name).expect("client id"));
        register_client(relay, &handle);
        TestClient { handle, rx, close_rx }
    }

    fn connect_extension(relay: &Arc<Relay>) -> TestExtension {
        let (link, rx, close_rx) = ExtensionLink::new();
        register_extension(relay, &link);
        TestExtension { link, rx, close_rx }
    }

    async fn attach_target(
        relay: &Arc<Relay>,
        ext: &TestExtension,
        session_id: &str,
        target_id: &str,
        url: &str,
    ) {
        let text = json!({
            "type": "meta",
            "payload": {
                "method": "Target.attached",
                "params": {
                    "sessionId": session_id,
                    "targetInfo": {
                        "targetId": target_id,
                        "type": "page",
                        "title": "page",
                        "url": url,
                    }
                }
            }
        })
        .to_string();
        handle_extension_text(relay, &ext.link, &text).await;
    }

    async fn extension_replies(
        relay: &Arc<Relay>,
        ext: &TestExtension,
        session_id: &str,
        id: i64,
        result: Value,
    ) {
        let text = json!({
            "type": "cdp",
            "sessionId": session_id,
            "payload": { "id": id, "result": result }
        })
        .to_string();
        handle_extension_text(relay, &ext.link, &text).await;
    }

    // ------------------------------------------------------------------
    // Scenario 1: cookie read rewrite.
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_cookie_read_rewrite() {
        let relay = relay();
        let mut ext = connect_extension(&relay);
        attach_target(&relay, &ext, "S1", "T1", "https://example.com/").await;
        let mut client = connect_client(&relay, "c1");

        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":1,"method":"Storage.getCookies"}"#,
        )
        .await;

        let envelope = ext.next_envelope().await;
        assert_eq!(envelope["type"], "cdp");
        assert_eq!(envelope["sessionId"], "S1");
        assert_eq!(envelope["payload"]["method"], "Network.getCookies");
        assert_eq!(envelope["payload"]["params"]["urls"], json!([]));
        let relay_id = envelope["payload"]["id"].as_i64().expect("relay id");

        let cookies = json!({"cookies": [
            {"name": "s", "value": "1", "domain": "example.com", "path": "/"}
        ]});
        extension_replies(&relay, &ext, "S1", relay_id, cookies.clone()).await;

        let reply = client.next_json().await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"], cookies);
    }

    // ------------------------------------------------------------------
    // Scenario 2: clear-cookies fan-out.
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_clear_cookies_fan_out() {
        let relay = relay();
        let mut ext = connect_extension(&relay);
        attach_target(&relay, &ext, "S1", "T1", "https://example.com/").await;
        let mut client = connect_client(&relay, "c1");

        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":2,"method":"Storage.clearCookies"}"#,
        )
        .await;

        let get = ext.next_envelope().await;
        assert_eq!(get["payload"]["method"], "Network.getCookies");
        let get_id = get["payload"]["id"].as_i64().expect("id");
        extension_replies(
            &relay,
            &ext,
            "S1",
            get_id,
            json!({"cookies": [
                {"name": "a", "domain": "example.com", "path": "/"},
                {"name": "b", "domain": "example.com", "path": "/x", "partitionKey": "pk"}
            ]}),
        )
        .await;

        let del_a = ext.next_envelope().await;
        assert_eq!(del_a["payload"]["method"], "Network.deleteCookies");
        assert_eq!(del_a["payload"]["params"]["name"], "a");
        assert_eq!(del_a["payload"]["params"]["path"], "/");
        assert!(del_a["payload"]["params"].get("partitionKey").is_none());
        let del_a_id = del_a["payload"]["id"].as_i64().expect("id");
        extension_replies(&relay, &ext, "S1", del_a_id, json!({})).await;

        let del_b = ext.next_envelope().await;
        assert_eq!(del_b["payload"]["params"]["name"], "b");
        assert_eq!(del_b["payload"]["params"]["partitionKey"], "pk");
        let del_b_id = del_b["payload"]["id"].as_i64().expect("id");
        extension_replies(&relay, &ext, "S1", del_b_id, json!({})).await;

        let reply = client.next_json().await;
        assert_eq!(reply["id"], 2);
        assert_eq!(reply["result"], json!({}));
    }

    #[tokio::test]
    async fn test_clear_cookies_zero_cookies_single_call() {
        let relay = relay();
        let mut ext = connect_extension(&relay);
        attach_target(&relay, &ext, "S1", "T1", "https://example.com/").await;
        let mut client = connect_client(&relay, "c1");

        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":7,"method":"Storage.clearCookies"}"#,
        )
        .await;

        let get = ext.next_envelope().await;
        let get_id = get["payload"]["id"].as_i64().expect("id");
        extension_replies(&relay, &ext, "S1", get_id, json!({"cookies": []})).await;

        let reply = client.next_json().await;
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["result"], json!({}));
        // Exactly one extension call: the queue is empty now.
        assert!(ext.rx.try_recv().is_err());
    }

    // ------------------------------------------------------------------
    // Scenario 3: no session available.
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_cookie_rewrite_without_pages() {
        let relay = relay();
        let _ext = connect_extension(&relay);
        let mut client = connect_client(&relay, "c1");

        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":3,"method":"Storage.getCookies"}"#,
        )
        .await;

        let reply = client.next_json().await;
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["error"]["code"], CODE_SERVER_ERROR);
        let message = reply["error"]["message"].as_str().expect("message");
        assert!(message.contains("no page"), "message was: {message}");
    }

    // ------------------------------------------------------------------
    // Scenario 4: discovery handshake.
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_discovery_handshake_replays_targets() {
        let relay = relay();
        let ext = connect_extension(&relay);
        attach_target(&relay, &ext, "S1", "T1", "https://a/").await;
        attach_target(&relay, &ext, "S2", "T2", "https://b/").await;
        let mut client = connect_client(&relay, "c1");

        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":4,"method":"Target.setDiscoverTargets","params":{"discover":true}}"#,
        )
        .await;

        // Reply first, then one attachedToTarget per target in attach order.
        let reply = client.next_json().await;
        assert_eq!(reply["id"], 4);
        assert_eq!(reply["result"], json!({}));

        let first = client.next_json().await;
        assert_eq!(first["method"], "Target.attachedToTarget");
        assert_eq!(first["params"]["sessionId"], "S1");
        assert_eq!(first["params"]["targetInfo"]["targetId"], "T1");

        let second = client.next_json().await;
        assert_eq!(second["params"]["sessionId"], "S2");
    }

    #[tokio::test]
    async fn test_auto_attach_replay_is_idempotent() {
        let relay = relay();
        let ext = connect_extension(&relay);
        attach_target(&relay, &ext, "S1", "T1", "https://a/").await;
        let mut client = connect_client(&relay, "c1");

        for id in [10, 11] {
            let frame = format!(
                r#"{{"id":{id},"method":"Target.setAutoAttach","params":{{"autoAttach":true,"waitForDebuggerOnStart":false}}}}"#
            );
            handle_client_frame(&relay, &client.handle, &frame).await;
        }

        let mut attached_events = 0;
        while let Some(frame) = client.try_next_json() {
            if frame["method"] == "Target.attachedToTarget" {
                attached_events += 1;
            }
        }
        assert_eq!(attached_events, 1);
    }

    #[tokio::test]
    async fn test_new_attach_announced_to_discovering_clients() {
        let relay = relay();
        let ext = connect_extension(&relay);
        let mut watcher = connect_client(&relay, "watcher");
        let mut passive = connect_client(&relay, "passive");

        handle_client_frame(
            &relay,
            &watcher.handle,
            r#"{"id":1,"method":"Target.setDiscoverTargets","params":{"discover":true}}"#,
        )
        .await;
        let _ = watcher.next_json().await; // reply

        attach_target(&relay, &ext, "S1", "T1", "https://a/").await;

        let event = watcher.next_json().await;
        assert_eq!(event["method"], "Target.attachedToTarget");
        assert_eq!(event["params"]["sessionId"], "S1");
        assert!(passive.try_next_json().is_none());
    }

    // ------------------------------------------------------------------
    // Scenario 6: extension replacement.
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_extension_replacement() {
        let relay = relay();
        let mut first = connect_extension(&relay);
        attach_target(&relay, &first, "S1", "T1", "https://a/").await;

        let mut client = connect_client(&relay, "c1");
        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":1,"method":"Target.setDiscoverTargets","params":{"discover":true}}"#,
        )
        .await;
        let _ = client.next_json().await; // reply
        let _ = client.next_json().await; // attachedToTarget S1

        let second = connect_extension(&relay);
        assert!(matches!(
            first.close_rx.try_recv(),
            Ok((CLOSE_REPLACED, "extension replaced"))
        ));

        let detached = client.next_json().await;
        assert_eq!(detached["method"], "Target.detachedFromTarget");
        assert_eq!(detached["params"]["sessionId"], "S1");
        assert_eq!(relay.status().page_count, 0);

        // Registry reseeds from the new extension's report, and the client
        // is re-announced because the detach cleared its announce set.
        attach_target(&relay, &second, "S9", "T9", "https://b/").await;
        let event = client.next_json().await;
        assert_eq!(event["params"]["sessionId"], "S9");
    }

    // ------------------------------------------------------------------
    // Forwarding: id round-trips, namespaces, cancellation.
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_forward_round_trip_translates_ids() {
        let relay = relay();
        let mut ext = connect_extension(&relay);
        attach_target(&relay, &ext, "S1", "T1", "https://a/").await;
        let mut client = connect_client(&relay, "c1");

        // A client id far above anything the relay counter reaches, so the
        // translation is observable.
        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":4000000042,"method":"Page.enable","sessionId":"S1"}"#,
        )
        .await;

        let envelope = ext.next_envelope().await;
        let relay_id = envelope["payload"]["id"].as_i64().expect("id");
        assert_ne!(relay_id, 4_000_000_042);
        // The envelope carries the session; the payload does not.
        assert_eq!(envelope["sessionId"], "S1");
        assert!(envelope["payload"].get("sessionId").is_none());

        extension_replies(&relay, &ext, "S1", relay_id, json!({})).await;
        let reply = client.next_json().await;
        assert_eq!(reply["id"], 4_000_000_042_i64);
        assert_eq!(reply["sessionId"], "S1");
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_two_clients_have_independent_id_namespaces() {
        let relay = relay();
        let mut ext = connect_extension(&relay);
        attach_target(&relay, &ext, "S1", "T1", "https://a/").await;
        let mut alice = connect_client(&relay, "alice");
        let mut bob = connect_client(&relay, "bob");

        handle_client_frame(
            &relay,
            &alice.handle,
            r#"{"id":1,"method":"Page.enable","sessionId":"S1"}"#,
        )
        .await;
        handle_client_frame(
            &relay,
            &bob.handle,
            r#"{"id":1,"method":"Runtime.enable","sessionId":"S1"}"#,
        )
        .await;

        let first = ext.next_envelope().await;
        let second = ext.next_envelope().await;
        let first_id = first["payload"]["id"].as_i64().expect("id");
        let second_id = second["payload"]["id"].as_i64().expect("id");
        assert_ne!(first_id, second_id, "relay ids must never collide");

        // Reply out of order; each reply lands on its own client.
        extension_replies(&relay, &ext, "S1", second_id, json!({"who": "bob"})).await;
        extension_replies(&relay, &ext, "S1", first_id, json!({"who": "alice"})).await;

        let bob_reply = bob.next_json().await;
        assert_eq!(bob_reply["id"], 1);
        assert_eq!(bob_reply["result"]["who"], "bob");
        let alice_reply = alice.next_json().await;
        assert_eq!(alice_reply["id"], 1);
        assert_eq!(alice_reply["result"]["who"], "alice");
    }

    #[tokio::test]
    async fn test_extension_disconnect_cancels_in_flight_forwards() {
        let relay = relay();
        let mut ext = connect_extension(&relay);
        attach_target(&relay, &ext, "S1", "T1", "https://a/").await;
        let mut client = connect_client(&relay, "c1");

        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":5,"method":"Page.enable","sessionId":"S1"}"#,
        )
        .await;
        let _ = ext.next_envelope().await;
        assert_eq!(relay.pending_count(), 1);

        assert!(relay.remove_extension_if(&ext.link));
        extension_lost(&relay, &ext.link);

        let reply = client.next_json().await;
        assert_eq!(reply["id"], 5);
        assert_eq!(reply["error"]["code"], CODE_SESSION_ERROR);
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_client_close_reaps_pending_and_drops_reply() {
        let relay = relay();
        let mut ext = connect_extension(&relay);
        attach_target(&relay, &ext, "S1", "T1", "https://a/").await;
        let mut client = connect_client(&relay, "c1");

        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":5,"method":"Page.enable","sessionId":"S1"}"#,
        )
        .await;
        let envelope = ext.next_envelope().await;
        let relay_id = envelope["payload"]["id"].as_i64().expect("id");

        relay.remove_client_if(&client.handle);
        reap_client(&relay, &client.handle);
        assert_eq!(relay.pending_count(), 0);

        // Late reply is dropped, not misdelivered.
        extension_replies(&relay, &ext, "S1", relay_id, json!({})).await;
        assert!(client.try_next_json().is_none());
    }

    #[tokio::test]
    async fn test_forward_unknown_session_rejected() {
        let relay = relay();
        let _ext = connect_extension(&relay);
        let mut client = connect_client(&relay, "c1");

        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":6,"method":"Page.enable","sessionId":"ghost"}"#,
        )
        .await;

        let reply = client.next_json().await;
        assert_eq!(reply["id"], 6);
        assert_eq!(reply["error"]["code"], CODE_SESSION_ERROR);
    }

    // ------------------------------------------------------------------
    // Synthesized commands.
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_get_targets_snapshot() {
        let relay = relay();
        let ext = connect_extension(&relay);
        attach_target(&relay, &ext, "S1", "T1", "https://a/").await;
        let mut client = connect_client(&relay, "c1");

        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":1,"method":"Target.getTargets"}"#,
        )
        .await;

        let reply = client.next_json().await;
        let infos = reply["result"]["targetInfos"].as_array().expect("array");
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0]["targetId"], "T1");
        assert_eq!(infos[0]["type"], "page");
    }

    #[tokio::test]
    async fn test_browser_get_version() {
        let relay = relay();
        let mut client = connect_client(&relay, "c1");

        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":2,"method":"Browser.getVersion"}"#,
        )
        .await;

        let reply = client.next_json().await;
        assert_eq!(reply["result"]["protocolVersion"], PROTOCOL_VERSION);
        let product = reply["result"]["product"].as_str().expect("product");
        assert!(product.starts_with("CdpRelay/"));
    }

    #[tokio::test]
    async fn test_attach_to_target_binds_session() {
        let relay = relay();
        let ext = connect_extension(&relay);
        attach_target(&relay, &ext, "S1", "T1", "https://a/").await;
        let mut client = connect_client(&relay, "c1");

        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":3,"method":"Target.attachToTarget","params":{"targetId":"T1"}}"#,
        )
        .await;
        let reply = client.next_json().await;
        assert_eq!(reply["result"]["sessionId"], "S1");

        // Bound: session events now reach this client.
        handle_extension_text(
            &relay,
            &ext.link,
            &json!({
                "type": "cdp",
                "sessionId": "S1",
                "payload": {"method": "Page.loadEventFired", "params": {"timestamp": 1.0}}
            })
            .to_string(),
        )
        .await;
        let event = client.next_json().await;
        assert_eq!(event["method"], "Page.loadEventFired");
        assert_eq!(event["sessionId"], "S1");
    }

    #[tokio::test]
    async fn test_attach_to_unknown_target_errors() {
        let relay = relay();
        let _ext = connect_extension(&relay);
        let mut client = connect_client(&relay, "c1");

        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":3,"method":"Target.attachToTarget","params":{"targetId":"nope"}}"#,
        )
        .await;
        let reply = client.next_json().await;
        assert_eq!(reply["error"]["code"], crate::error::CODE_INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_create_target_goes_through_meta_rpc() {
        let relay = relay();
        let mut ext = connect_extension(&relay);
        let mut client = connect_client(&relay, "c1");

        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":8,"method":"Target.createTarget","params":{"url":"https://a/"}}"#,
        )
        .await;

        let envelope = ext.next_envelope().await;
        assert_eq!(envelope["type"], "meta");
        assert_eq!(envelope["payload"]["method"], "Target.createTarget");
        assert_eq!(envelope["payload"]["params"]["url"], "https://a/");
        let meta_id = envelope["payload"]["id"].as_i64().expect("id");

        handle_extension_text(
            &relay,
            &ext.link,
            &json!({
                "type": "meta",
                "payload": {"id": meta_id, "result": {"targetId": "T-new"}}
            })
            .to_string(),
        )
        .await;

        let reply = client.next_json().await;
        assert_eq!(reply["id"], 8);
        assert_eq!(reply["result"]["targetId"], "T-new");
    }

    #[tokio::test]
    async fn test_unknown_browser_command_rejected() {
        let relay = relay();
        let mut client = connect_client(&relay, "c1");

        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":9,"method":"Browser.setDownloadBehavior"}"#,
        )
        .await;
        let reply = client.next_json().await;
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["error"]["code"], CODE_METHOD_NOT_FOUND);
    }

    // ------------------------------------------------------------------
    // Malformed frames and ordering.
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_malformed_frame_keeps_link_open() {
        let relay = relay();
        let mut client = connect_client(&relay, "c1");

        handle_client_frame(&relay, &client.handle, "not json at all").await;
        let reply = client.next_json().await;
        assert_eq!(reply["error"]["code"], CODE_INVALID_REQUEST);

        // Link still works.
        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":1,"method":"Browser.getVersion"}"#,
        )
        .await;
        let reply = client.next_json().await;
        assert_eq!(reply["id"], 1);
        assert!(reply.get("result").is_some());
    }

    #[tokio::test]
    async fn test_invalid_id_echoed_on_error() {
        let relay = relay();
        let mut client = connect_client(&relay, "c1");

        handle_client_frame(&relay, &client.handle, r#"{"id":13,"method":"nodot"}"#).await;
        let reply = client.next_json().await;
        assert_eq!(reply["id"], 13);
        assert_eq!(reply["error"]["code"], CODE_INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_session_events_preserve_receive_order() {
        let relay = relay();
        let ext = connect_extension(&relay);
        attach_target(&relay, &ext, "S1", "T1", "https://a/").await;
        let mut client = connect_client(&relay, "c1");
        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":1,"method":"Target.setDiscoverTargets","params":{"discover":true}}"#,
        )
        .await;
        let _ = client.next_json().await; // reply
        let _ = client.next_json().await; // attachedToTarget

        for i in 0..10 {
            handle_extension_text(
                &relay,
                &ext.link,
                &json!({
                    "type": "cdp",
                    "sessionId": "S1",
                    "payload": {"method": "Page.frameNavigated", "params": {"seq": i}}
                })
                .to_string(),
            )
            .await;
        }
        for i in 0..10 {
            let event = client.next_json().await;
            assert_eq!(event["params"]["seq"], i);
        }
    }

    #[tokio::test]
    async fn test_sessionless_events_broadcast() {
        let relay = relay();
        let ext = connect_extension(&relay);
        let mut alice = connect_client(&relay, "alice");
        let mut bob = connect_client(&relay, "bob");

        handle_extension_text(
            &relay,
            &ext.link,
            &json!({
                "type": "cdp",
                "payload": {"method": "Browser.downloadWillBegin", "params": {}}
            })
            .to_string(),
        )
        .await;

        assert_eq!(alice.next_json().await["method"], "Browser.downloadWillBegin");
        assert_eq!(bob.next_json().await["method"], "Browser.downloadWillBegin");
    }

    #[tokio::test]
    async fn test_duplicate_client_id_evicts_older() {
        let relay = relay();
        let mut first = connect_client(&relay, "same");
        let second = connect_client(&relay, "same");

        assert!(matches!(
            first.close_rx.try_recv(),
            Ok((CLOSE_POLICY, "duplicate clientId"))
        ));
        assert_eq!(
            relay.client(&ClientId::parse("same").expect("id")).map(|h| h.generation()),
            Some(second.handle.generation())
        );
    }

    #[tokio::test]
    async fn test_mailbox_overflow_closes_with_policy_code() {
        let relay = relay();
        let ext = connect_extension(&relay);
        attach_target(&relay, &ext, "S1", "T1", "https://a/").await;
        let mut client = connect_client(&relay, "slow");
        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":1,"method":"Target.setDiscoverTargets","params":{"discover":true}}"#,
        )
        .await;

        // Never drain the mailbox; keep pushing events until it overflows.
        for i in 0..(crate::link::client::MAILBOX_CAPACITY + 8) {
            handle_extension_text(
                &relay,
                &ext.link,
                &json!({
                    "type": "cdp",
                    "sessionId": "S1",
                    "payload": {"method": "Page.frameNavigated", "params": {"seq": i}}
                })
                .to_string(),
            )
            .await;
        }

        assert!(matches!(
            client.close_rx.try_recv(),
            Ok((CLOSE_POLICY, "backpressure overflow"))
        ));
    }

    #[tokio::test]
    async fn test_detach_emits_exactly_one_event_per_subscriber() {
        let relay = relay();
        let ext = connect_extension(&relay);
        attach_target(&relay, &ext, "S1", "T1", "https://a/").await;
        let mut client = connect_client(&relay, "c1");
        handle_client_frame(
            &relay,
            &client.handle,
            r#"{"id":1,"method":"Target.setDiscoverTargets","params":{"discover":true}}"#,
        )
        .await;
        let _ = client.next_json().await;
        let _ = client.next_json().await;

        let detach = json!({
            "type": "meta",
            "payload": {"method": "Target.detached", "params": {"targetId": "T1"}}
        })
        .to_string();
        handle_extension_text(&relay, &ext.link, &detach).await;
        handle_extension_text(&relay, &ext.link, &detach).await; // repeat is a no-op

        let event = client.next_json().await;
        assert_eq!(event["method"], "Target.detachedFromTarget");
        assert_eq!(event["params"]["sessionId"], "S1");
        assert!(client.try_next_json().is_none());
    }
}
