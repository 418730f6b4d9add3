//! Direct peer session lifecycle coordination.
//!
//! Tracks the connection state machine for direct peer-to-peer sessions:
//!
//! ```text
//! initiating -> connecting -> connected -> disconnected
//!                    └─> failed
//! ```
//!
//! The coordinator never assumes network state on its own. The transport
//! layer drives [`P2PSessionCoordinator::connect`] and
//! [`P2PSessionCoordinator::disconnect`] on real, verified connection
//! events only; `connection_info` is an opaque blob (offer/answer/ICE
//! material) the coordinator stores but never interprets.
//!
//! Sessions are keyed by the unordered user pair: lookups for `(a, b)` and
//! `(b, a)` resolve to the same session, and at most one non-terminal
//! session exists per pair.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// P2P session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum P2PSessionStatus {
    /// Session created; signaling not yet started.
    Initiating,
    /// Transport negotiation in progress.
    Connecting,
    /// Live connection established.
    Connected,
    /// Cleanly closed (terminal).
    Disconnected,
    /// Negotiation failed (terminal).
    Failed,
}

impl P2PSessionStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// An unordered pair of user identifiers.
///
/// Construction normalizes the order, so `(alice, bob)` and `(bob, alice)`
/// compare equal and hash identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerPair {
    first: String,
    second: String,
}

impl PeerPair {
    /// Create a normalized pair.
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self {
                first: a.to_string(),
                second: b.to_string(),
            }
        } else {
            Self {
                first: b.to_string(),
                second: a.to_string(),
            }
        }
    }

    /// Whether the given user is part of this pair.
    pub fn contains(&self, user: &str) -> bool {
        self.first == user || self.second == user
    }

    /// The two users, in normalized order.
    pub fn users(&self) -> (&str, &str) {
        (&self.first, &self.second)
    }
}

/// A direct session between two users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2PSession {
    /// Coordinator-local session ID.
    pub id: u64,
    /// The unordered user pair.
    pub peers: PeerPair,
    /// Current lifecycle status.
    pub status: P2PSessionStatus,
    /// Opaque transport negotiation data (offer/answer/ICE).
    pub connection_info: serde_json::Value,
    /// Messages sent over this session.
    pub messages_sent: u64,
    /// Messages received over this session.
    pub messages_received: u64,
    /// Total payload bytes moved in either direction.
    pub bytes_transferred: u64,
    /// Session key generation, bumped on re-keying.
    pub session_key_version: u32,
    /// Creation time (Unix timestamp).
    pub created_at: i64,
    /// Time the connection was established, if it was.
    pub connected_at: Option<i64>,
    /// Time the connection closed, if it did.
    pub disconnected_at: Option<i64>,
    /// Reason recorded when negotiation failed.
    pub failure_reason: Option<String>,
}

/// Coordinates the lifecycle of all direct peer sessions.
#[derive(Default)]
pub struct P2PSessionCoordinator {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<u64, P2PSession>,
    next_id: u64,
}

impl P2PSessionCoordinator {
    /// Create an empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the session for a user pair.
    ///
    /// If a non-terminal session already exists for the pair it is
    /// returned as-is; otherwise a fresh session is created in
    /// `initiating`. This is the only way sessions are created, which
    /// enforces the one-non-terminal-session-per-pair invariant.
    pub fn open_session(&self, a: &str, b: &str) -> Result<P2PSession> {
        let pair = PeerPair::new(a, b);
        let mut inner = self.lock()?;

        if let Some(existing) = inner
            .sessions
            .values()
            .find(|s| s.peers == pair && !s.status.is_terminal())
        {
            debug!(session = existing.id, "reusing non-terminal session for pair");
            return Ok(existing.clone());
        }

        inner.next_id += 1;
        let session = P2PSession {
            id: inner.next_id,
            peers: pair,
            status: P2PSessionStatus::Initiating,
            connection_info: serde_json::Value::Null,
            messages_sent: 0,
            messages_received: 0,
            bytes_transferred: 0,
            session_key_version: 1,
            created_at: chrono::Utc::now().timestamp(),
            connected_at: None,
            disconnected_at: None,
            failure_reason: None,
        };

        info!(session = session.id, "created p2p session");
        inner.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    /// Find the current non-terminal session for a user pair.
    ///
    /// Argument order does not matter.
    pub fn find_session(&self, a: &str, b: &str) -> Option<P2PSession> {
        let pair = PeerPair::new(a, b);
        self.lock().ok().and_then(|inner| {
            inner
                .sessions
                .values()
                .find(|s| s.peers == pair && !s.status.is_terminal())
                .cloned()
        })
    }

    /// Get a session snapshot by ID.
    pub fn get(&self, id: u64) -> Option<P2PSession> {
        self.lock().ok().and_then(|inner| inner.sessions.get(&id).cloned())
    }

    /// Move a session from `initiating` to `connecting`.
    pub fn begin_connecting(&self, id: u64) -> Result<P2PSession> {
        self.transition(id, P2PSessionStatus::Initiating, |session| {
            session.status = P2PSessionStatus::Connecting;
        })
    }

    /// Mark a session connected.
    ///
    /// Must only be called by the transport on a real, verified
    /// connection event.
    pub fn connect(&self, id: u64) -> Result<P2PSession> {
        self.transition(id, P2PSessionStatus::Connecting, |session| {
            session.status = P2PSessionStatus::Connected;
            session.connected_at = Some(chrono::Utc::now().timestamp());
        })
    }

    /// Mark a session disconnected (terminal).
    pub fn disconnect(&self, id: u64) -> Result<P2PSession> {
        self.transition(id, P2PSessionStatus::Connected, |session| {
            session.status = P2PSessionStatus::Disconnected;
            session.disconnected_at = Some(chrono::Utc::now().timestamp());
        })
    }

    /// Mark a session failed during negotiation (terminal).
    pub fn fail(&self, id: u64, reason: &str) -> Result<P2PSession> {
        let reason = reason.to_string();
        let result = self.transition(id, P2PSessionStatus::Connecting, move |session| {
            session.status = P2PSessionStatus::Failed;
            session.failure_reason = Some(reason);
        });
        if result.is_ok() {
            warn!(session = id, "p2p session failed");
        }
        result
    }

    /// Replace the opaque transport negotiation blob.
    pub fn set_connection_info(&self, id: u64, info: serde_json::Value) -> Result<P2PSession> {
        self.with_session(id, move |session| {
            session.connection_info = info;
        })
    }

    /// Record an outbound message of the given size.
    pub fn record_sent(&self, id: u64, bytes: u64) -> Result<P2PSession> {
        self.with_session(id, move |session| {
            session.messages_sent += 1;
            session.bytes_transferred += bytes;
        })
    }

    /// Record an inbound message of the given size.
    pub fn record_received(&self, id: u64, bytes: u64) -> Result<P2PSession> {
        self.with_session(id, move |session| {
            session.messages_received += 1;
            session.bytes_transferred += bytes;
        })
    }

    /// Advance the session key generation after a re-key.
    pub fn bump_key_version(&self, id: u64) -> Result<P2PSession> {
        self.with_session(id, |session| {
            session.session_key_version += 1;
        })
    }

    /// All connected sessions involving a user.
    pub fn active_sessions_for(&self, user: &str) -> Vec<P2PSession> {
        self.lock()
            .map(|inner| {
                inner
                    .sessions
                    .values()
                    .filter(|s| s.status == P2PSessionStatus::Connected && s.peers.contains(user))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply a state transition, validating the current status first.
    fn transition(
        &self,
        id: u64,
        expected: P2PSessionStatus,
        apply: impl FnOnce(&mut P2PSession),
    ) -> Result<P2PSession> {
        let mut inner = self.lock()?;
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or_else(|| Error::Session("unknown session".into()))?;

        if session.status != expected {
            return Err(Error::Session(format!(
                "invalid transition from {:?}",
                session.status
            )));
        }

        apply(session);
        debug!(session = id, status = ?session.status, "p2p session transition");
        Ok(session.clone())
    }

    /// Load-mutate-save under the coordinator lock.
    fn with_session(
        &self,
        id: u64,
        apply: impl FnOnce(&mut P2PSession),
    ) -> Result<P2PSession> {
        let mut inner = self.lock()?;
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or_else(|| Error::Session("unknown session".into()))?;
        apply(session);
        Ok(session.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Storage("lock poisoned".into()))
    }
}
