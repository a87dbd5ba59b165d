//! HTTP and WebSocket surface.
//!
//! One listener serves everything:
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /version` | `{version, pid}` for the lifecycle supervisor probe |
//! | `GET /json/version` | Browser identity + `webSocketDebuggerUrl` |
//! | `GET /json/list` | Target descriptors for client discovery |
//! | `GET /extension-status` | `{connected, pageCount, pages}` |
//! | `GET /extension` | Extension WebSocket upgrade |
//! | `GET /cdp` | Client WebSocket upgrade, generated client id |
//! | `GET /cdp/{clientId}` | Client WebSocket upgrade |
//!
//! The relay binds its port before doing any other work; a bind failure is
//! [`Error::PortInUse`] and the process exits with code 2. This makes the
//! supervisor's "is it running" probe equivalent to "is the port served by
//! the expected version".
//!
//! Every request passes the auth guard: with a configured token, clients
//! must present it via `Authorization: Bearer` or `?token=` (compared in
//! constant time); without one, only loopback peers are accepted.

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Request, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{RelayConfig, RELAY_VERSION};
use crate::error::{Error, Result};
use crate::identifiers::ClientId;
use crate::link::{run_client_socket, run_extension_socket};
use crate::protocol::{product, PROTOCOL_VERSION};
use crate::router::Relay;

// ============================================================================
// Serve
// ============================================================================

/// Binds the configured port and serves the relay until the process ends.
///
/// # Errors
///
/// - [`Error::PortInUse`] when the bind collides with another process
/// - [`Error::Config`] for an invalid configuration
pub async fn serve(config: RelayConfig) -> Result<()> {
    config.validate()?;
    let addr = SocketAddr::new(config.host, config.port);

    // Bind before any other work; the port is the singleton lock.
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            Error::port_in_use(config.port)
        } else {
            Error::Io(e)
        }
    })?;

    let relay = Relay::new(config);
    serve_on(listener, relay).await
}

/// Serves the relay on an already-bound listener.
///
/// Split out from [`serve`] so tests can use an ephemeral port.
pub async fn serve_on(listener: TcpListener, relay: Arc<Relay>) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(
        version = RELAY_VERSION,
        bind_address = %addr,
        pid = std::process::id(),
        "Relay listening"
    );

    let app = router(relay);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Builds the axum router.
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/version", get(version_handler))
        .route("/json/version", get(json_version_handler))
        .route("/json/list", get(json_list_handler))
        .route("/extension-status", get(extension_status_handler))
        .route("/extension", get(extension_ws_handler))
        .route("/cdp", get(default_client_ws_handler))
        .route("/cdp/{client_id}", get(client_ws_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&relay),
            auth_guard,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}

// ============================================================================
// HTTP Handlers
// ============================================================================

async fn version_handler() -> impl IntoResponse {
    Json(json!({
        "version": RELAY_VERSION,
        "pid": std::process::id(),
    }))
}

async fn json_version_handler(State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    let config = relay.config();
    Json(json!({
        "Browser": product(),
        "Protocol-Version": PROTOCOL_VERSION,
        "webSocketDebuggerUrl": format!("{}/cdp/{}", config.ws_base(), ClientId::generate()),
    }))
}

async fn json_list_handler(State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    Json(relay.list_targets())
}

async fn extension_status_handler(State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    Json(relay.status())
}

// ============================================================================
// WebSocket Handlers
// ============================================================================

async fn extension_ws_handler(
    ws: WebSocketUpgrade,
    State(relay): State<Arc<Relay>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_extension_socket(relay, socket))
}

async fn default_client_ws_handler(
    ws: WebSocketUpgrade,
    State(relay): State<Arc<Relay>>,
) -> impl IntoResponse {
    let client_id = ClientId::generate();
    ws.on_upgrade(move |socket| run_client_socket(relay, client_id, socket))
}

async fn client_ws_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    State(relay): State<Arc<Relay>>,
) -> Response {
    let Some(client_id) = ClientId::parse(&client_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "clientId must be 1-64 printable characters"})),
        )
            .into_response();
    };
    ws.on_upgrade(move |socket| run_client_socket(relay, client_id, socket))
        .into_response()
}

// ============================================================================
// Auth Guard
// ============================================================================

/// Auth decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthDecision {
    Allow,
    /// Token configured but missing or wrong.
    Unauthorized,
    /// Non-loopback peer without a configured token.
    Forbidden,
}

async fn auth_guard(
    State(relay): State<Arc<Relay>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let supplied = supplied_token(&request);
    match authorize(relay.config(), peer.ip(), supplied.as_deref()) {
        AuthDecision::Allow => next.run(request).await,
        AuthDecision::Unauthorized => {
            warn!(peer = %peer, path = %request.uri().path(), "Rejecting request: bad token");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid auth token"})),
            )
                .into_response()
        }
        AuthDecision::Forbidden => {
            warn!(peer = %peer, path = %request.uri().path(), "Rejecting non-loopback peer");
            (
                StatusCode::FORBIDDEN,
                Json(json!({"error": "non-loopback connections require an auth token"})),
            )
                .into_response()
        }
    }
}

fn authorize(config: &RelayConfig, peer: IpAddr, supplied: Option<&str>) -> AuthDecision {
    match &config.auth_token {
        Some(expected) => {
            if supplied.is_some_and(|token| tokens_match(expected, token)) {
                AuthDecision::Allow
            } else {
                AuthDecision::Unauthorized
            }
        }
        None => {
            if peer.is_loopback() {
                AuthDecision::Allow
            } else {
                AuthDecision::Forbidden
            }
        }
    }
}

/// Constant-time token comparison; tokens are opaque byte strings.
fn tokens_match(expected: &str, supplied: &str) -> bool {
    ring::constant_time::verify_slices_are_equal(expected.as_bytes(), supplied.as_bytes()).is_ok()
}

/// Pulls the token from `Authorization: Bearer` or the `token` query
/// parameter (WebSocket clients cannot always set headers on upgrade).
fn supplied_token(request: &Request) -> Option<String> {
    if let Some(header) = request.headers().get("authorization") {
        if let Ok(value) = header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    request.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .map(|token| token.to_string())
    })
}

// ============================================================================
// Tests
// ============================================================================
