//! WebSocket links.
//!
//! Each link pairs a reader task with a writer task around one WebSocket.
//! Readers hand frames to the router and never block on slow peers; writers
//! drain a queue owned by the link handle. Close requests travel on a
//! dedicated channel so a policy close is never stuck behind a full queue.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `client` | Per-client link: bounded mailbox, duplicate-id eviction |
//! | `extension` | The single extension link: ordered writer, waiters |

/// Client-side links.
pub mod client;

/// Extension-side link.
pub mod extension;

pub use client::{run_client_socket, ClientHandle, ClientOutbound};
pub use extension::{run_extension_socket, ExtensionLink};
