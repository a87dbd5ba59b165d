//! Type-safe identifiers for relay entities.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time:
//!
//! | Type | Source | Shape |
//! |------|--------|-------|
//! | [`ClientId`] | Upgrade path segment or relay-generated | 1-64 printable chars |
//! | [`TargetId`] | Reported by the extension | Opaque string |
//! | [`SessionId`] | Assigned by the browser | Opaque string |
//! | [`RelayRequestId`] | Relay-global monotonic counter | Positive integer |
//!
//! Client request ids are plain `i64`s scoped to one client connection; the
//! relay never puts them on the extension link. [`RelayRequestId`] is the id
//! namespace the extension sees, shared by forwarded commands and internal
//! requests so ids never collide across concurrent requests.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ClientId
// ============================================================================

/// Identifier of an attached CDP client.
///
/// Taken from the WebSocket upgrade path (`/cdp/<clientId>`); generated when
/// a client connects to the default path. Accepted shape is 1-64 printable
/// ASCII characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Maximum accepted length of a client id.
    pub const MAX_LEN: usize = 64;

    /// Parses a client id from an upgrade path segment.
    ///
    /// Returns `None` when the segment is empty, longer than
    /// [`Self::MAX_LEN`], or contains non-printable characters.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() || raw.len() > Self::MAX_LEN {
            return None;
        }
        if !raw.chars().all(|c| c.is_ascii_graphic()) {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    /// Generates a fresh client id for the default client path.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// TargetId
// ============================================================================

/// Identifier of a page target, stable while the page exists.
///
/// Opaque; the extension is the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    /// Wraps a target id reported by the extension.
    #[inline]
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// SessionId
// ============================================================================

/// Identifier of a CDP protocol session bound to one target.
///
/// Assigned by the browser and treated as authoritative; the relay never
/// mints its own session ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wraps a session id reported by the browser.
    #[inline]
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// RelayRequestId
// ============================================================================

/// Relay-assigned command id on the extension link.
///
/// Drawn from a process-global monotonic counter so concurrent forwards from
/// different clients never collide. CDP requires positive integer ids; the
/// counter starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayRequestId(i64);

static NEXT_RELAY_REQUEST_ID: AtomicI64 = AtomicI64::new(1);

impl RelayRequestId {
    /// Allocates the next id from the global counter.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_RELAY_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw integer value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RelayRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
