//! CDP Relay - bridge between CDP clients and a browser extension.
//!
//! The relay is a local singleton process that exposes the browser-wide CDP
//! endpoint automation clients expect, while delegating all actual browser
//! work to an extension that holds page-level debugger attachments in a
//! running browser.
//!
//! # Architecture
//!
//! ```text
//! CDP client ──ws──┐                        ┌──ws── extension ── browser
//! CDP client ──ws──┤  router / registry     │
//! CDP client ──ws──┴──► pending table ──────┘
//!                       (one relay process per port)
//! ```
//!
//! Key design points:
//!
//! - Commands are intercepted, rewritten, forwarded, or rejected by a
//!   dispatch table; browser-scope cookie commands become page-scope ones.
//! - Forwarded ids come from a relay-global counter; replies translate back
//!   to each client's own id namespace.
//! - Per `(sessionId, client)` pair, frame order is never changed.
//! - The port doubles as the singleton lock: the relay binds before doing
//!   anything else, and the supervisor identifies instances by `/version`.
//!
//! # Quick Start
//!
//! ```no_run
//! use cdp_relay::{ensure_relay_running, wait_for_extension, EnsureOptions, WaitOptions};
//!
//! #[tokio::main]
//! async fn main() -> cdp_relay::Result<()> {
//!     // Bring up (or find) the relay singleton.
//!     let outcome = ensure_relay_running(&EnsureOptions::default()).await?;
//!     println!("relay v{} (started: {})", outcome.version, outcome.started);
//!
//!     // Block until the human clicks the extension.
//!     let status = wait_for_extension(&WaitOptions::default()).await?;
//!     println!("{} page(s) available", status.page_count);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Environment-derived relay configuration |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`lifecycle`] | Singleton supervisor (probe, terminate, spawn) |
//! | [`link`] | WebSocket links (clients, extension) |
//! | [`logging`] | Tracing initialization |
//! | [`protocol`] | CDP frames and the extension envelope |
//! | [`registry`] | Target, session, and subscription state |
//! | [`router`] | Command dispatch: the heart of the relay |
//! | [`server`] | HTTP discovery + WebSocket upgrade surface |
//! | [`wait`] | Extension wait utility |

// ============================================================================
// Modules
// ============================================================================

/// Environment-derived relay configuration.
pub mod config;

/// Error types and result aliases.
pub mod error;

/// Type-safe identifiers for relay entities.
pub mod identifiers;

/// Singleton lifecycle supervisor.
pub mod lifecycle;

/// WebSocket links for clients and the extension.
pub mod link;

/// Tracing initialization.
pub mod logging;

/// CDP wire protocol types.
pub mod protocol;

/// Target, session, and subscription state.
pub mod registry;

/// Command router.
pub mod router;

/// HTTP and WebSocket surface.
pub mod server;

/// Extension wait utility.
pub mod wait;

// ============================================================================
// Re-exports
// ============================================================================

// Configuration
pub use config::{RelayConfig, DEFAULT_PORT, RELAY_VERSION};

// Errors
pub use error::{Error, Result};

// Identifiers
pub use identifiers::{ClientId, RelayRequestId, SessionId, TargetId};

// Lifecycle
pub use lifecycle::{ensure_relay_running, EnsureOptions, EnsureOutcome};

// Registry
pub use registry::ExtensionStatus;

// Router
pub use router::Relay;

// Server
pub use server::serve;

// Wait utility
pub use wait::{wait_for_extension, WaitOptions};
