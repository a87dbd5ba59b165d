//! Session registry: targets, sessions, and client subscriptions.
//!
//! The registry is the single owner of target state. It tracks which pages
//! the extension has attached, the browser-assigned session id for each,
//! and which clients subscribed to which sessions. All mutations happen
//! under one lock held only across map edits; fan-out to client mailboxes
//! happens outside, in the router.
//!
//! Ordering: targets are remembered in attachment order (ties broken by
//! `targetId`), which also fixes the session chosen for cookie rewrites and
//! the replay order of `Target.attachedToTarget` events.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::identifiers::{ClientId, SessionId, TargetId};
use crate::protocol::TargetInfo;

// ============================================================================
// Types
// ============================================================================

/// Registry entry for one attached page.
#[derive(Debug, Clone)]
struct TargetEntry {
    /// Current descriptor.
    info: TargetInfo,

    /// Browser-assigned session id.
    session_id: SessionId,

    /// Attachment order, monotonically increasing per registry.
    attached_at: u64,

    /// Outbound event sequence for this session.
    event_seq: u64,
}

/// Result of [`Registry::attach`].
#[derive(Debug, Clone)]
pub struct AttachOutcome {
    /// The session bound to the target (existing one on repeat attach).
    pub session_id: SessionId,

    /// Whether this attach created a new entry.
    pub is_new: bool,
}

/// A session removed from the registry, with the clients that were watching.
#[derive(Debug, Clone)]
pub struct DetachedSession {
    /// The session that went away.
    pub session_id: SessionId,

    /// Its target.
    pub target_id: TargetId,

    /// Clients subscribed at removal time.
    pub subscribers: Vec<ClientId>,
}

/// Snapshot served by `/extension-status` and the wait utility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    /// Whether exactly one extension link is open.
    pub connected: bool,

    /// Number of attached pages.
    pub page_count: usize,

    /// Descriptors of the attached pages, in attachment order.
    pub pages: Vec<TargetInfo>,
}

// ============================================================================
// Registry
// ============================================================================

/// Target and subscription bookkeeping.
#[derive(Debug, Default)]
pub struct Registry {
    /// Attached pages by target id.
    targets: FxHashMap<TargetId, TargetEntry>,

    /// Session → target lookup.
    sessions: FxHashMap<SessionId, TargetId>,

    /// Session → subscribed clients.
    subscribers: FxHashMap<SessionId, FxHashSet<ClientId>>,

    /// Attachment counter.
    attach_seq: u64,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an extension-reported attachment.
    ///
    /// Idempotent: a second attach for a known `targetId` returns the
    /// existing session id and leaves the entry untouched apart from the
    /// descriptor refresh.
    pub fn attach(&mut self, info: TargetInfo, session_id: SessionId) -> AttachOutcome {
        if let Some(entry) = self.targets.get_mut(&info.target_id) {
            entry.info = info;
            return AttachOutcome {
                session_id: entry.session_id.clone(),
                is_new: false,
            };
        }

        self.attach_seq += 1;
        let target_id = info.target_id.clone();
        self.targets.insert(
            target_id.clone(),
            TargetEntry {
                info,
                session_id: session_id.clone(),
                attached_at: self.attach_seq,
                event_seq: 0,
            },
        );
        self.sessions.insert(session_id.clone(), target_id);

        AttachOutcome {
            session_id,
            is_new: true,
        }
    }

    /// Refreshes a target descriptor. Returns the session id when the
    /// target is known.
    pub fn update_info(&mut self, info: TargetInfo) -> Option<SessionId> {
        let entry = self.targets.get_mut(&info.target_id)?;
        entry.info = info;
        Some(entry.session_id.clone())
    }

    /// Removes a target, returning its session and subscriber set.
    pub fn detach(&mut self, target_id: &TargetId) -> Option<DetachedSession> {
        let entry = self.targets.remove(target_id)?;
        self.sessions.remove(&entry.session_id);
        let subscribers = self
            .subscribers
            .remove(&entry.session_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        Some(DetachedSession {
            session_id: entry.session_id,
            target_id: target_id.clone(),
            subscribers,
        })
    }

    /// Removes every target, returning the detached sessions in attachment
    /// order. Used when the extension link closes or is replaced.
    pub fn clear(&mut self) -> Vec<DetachedSession> {
        let mut order: Vec<TargetId> = self.targets.keys().cloned().collect();
        order.sort_by_key(|id| self.sort_key(id));
        order.into_iter().filter_map(|id| self.detach(&id)).collect()
    }

    /// Subscribes a client to a session's events.
    ///
    /// Returns `false` when the session is unknown.
    pub fn subscribe(&mut self, client_id: ClientId, session_id: &SessionId) -> bool {
        if !self.sessions.contains_key(session_id) {
            return false;
        }
        self.subscribers
            .entry(session_id.clone())
            .or_default()
            .insert(client_id);
        true
    }

    /// Unsubscribes a client from one session.
    pub fn unsubscribe(&mut self, client_id: &ClientId, session_id: &SessionId) {
        if let Some(set) = self.subscribers.get_mut(session_id) {
            set.remove(client_id);
        }
    }

    /// Drops every subscription held by a client. Called on client close.
    pub fn unsubscribe_client(&mut self, client_id: &ClientId) {
        for set in self.subscribers.values_mut() {
            set.remove(client_id);
        }
    }

    /// Returns the clients subscribed to a session.
    #[must_use]
    pub fn subscribers(&self, session_id: &SessionId) -> Vec<ClientId> {
        self.subscribers
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns `true` when the session maps to a live target.
    #[inline]
    #[must_use]
    pub fn has_session(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Returns the session bound to a target.
    #[must_use]
    pub fn session_for(&self, target_id: &TargetId) -> Option<SessionId> {
        self.targets.get(target_id).map(|e| e.session_id.clone())
    }

    /// Returns target descriptors in attachment order, ties broken by
    /// `targetId`.
    #[must_use]
    pub fn list_targets(&self) -> Vec<TargetInfo> {
        self.ordered_entries()
            .into_iter()
            .map(|(_, info)| info)
            .collect()
    }

    /// Returns `(sessionId, targetInfo)` pairs in attachment order.
    #[must_use]
    pub fn ordered_entries(&self) -> Vec<(SessionId, TargetInfo)> {
        let mut ids: Vec<&TargetId> = self.targets.keys().collect();
        ids.sort_by_key(|id| self.sort_key(id));
        ids.into_iter()
            .filter_map(|id| self.targets.get(id))
            .map(|e| (e.session_id.clone(), e.info.clone()))
            .collect()
    }

    /// Returns the session of the earliest-attached target, the
    /// deterministic choice for browser-scope rewrites.
    #[must_use]
    pub fn earliest_session(&self) -> Option<SessionId> {
        self.targets
            .values()
            .min_by(|a, b| {
                a.attached_at
                    .cmp(&b.attached_at)
                    .then_with(|| a.info.target_id.cmp(&b.info.target_id))
            })
            .map(|e| e.session_id.clone())
    }

    /// Bumps and returns the event sequence for a session.
    ///
    /// Returns `None` for unknown sessions.
    pub fn next_event_seq(&mut self, session_id: &SessionId) -> Option<u64> {
        let target_id = self.sessions.get(session_id)?;
        let entry = self.targets.get_mut(target_id)?;
        entry.event_seq += 1;
        Some(entry.event_seq)
    }

    /// Number of attached pages.
    #[inline]
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.targets.len()
    }

    fn sort_key(&self, target_id: &TargetId) -> (u64, TargetId) {
        let seq = self
            .targets
            .get(target_id)
            .map(|e| e.attached_at)
            .unwrap_or(u64::MAX);
        (seq, target_id.clone())
    }
}

// ============================================================================
// Tests
// ============================================================================
