//! Session registry for connected peers.
//!
//! Every live WebSocket connection owns exactly one session. The registry
//! assigns identities, tracks display names and pushes `peers-updated`
//! snapshots whenever the set of sessions or a name changes.
//!
//! Registration, renaming and removal broadcast while still holding the
//! registry lock, so every session observes the membership changes in
//! the same order. Each broadcast is O(n) deliveries and a burst of n
//! joins is O(n²) messages; that is fine for a LAN-sized population.

use std::collections::HashMap;
use std::sync::Mutex;

use protocol::{PeerInfo, ServerMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Display name used until a session sets its own.
pub const DEFAULT_NAME: &str = "Anonymous";

/// Maximum display name length in characters.
pub const MAX_NAME_LENGTH: usize = 64;

/// Errors returned by registry operations.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("session limit reached ({0})")]
    Full(usize),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("lock poisoned")]
    LockPoisoned,
}

/// Outbound queue of one session.
///
/// Delivery must not block; the connection's writer task drains the queue.
pub trait SessionSink: Send + Sync {
    /// Queues a message. Returns `false` if the session is gone.
    fn deliver(&self, message: ServerMessage) -> bool;
}

impl SessionSink for mpsc::UnboundedSender<ServerMessage> {
    fn deliver(&self, message: ServerMessage) -> bool {
        self.send(message).is_ok()
    }
}

struct SessionEntry<S> {
    name: String,
    joined: u64,
    sink: S,
}

struct Inner<S> {
    sessions: HashMap<String, SessionEntry<S>>,
    next_seq: u64,
}

impl<S: SessionSink> Inner<S> {
    /// Peers other than `id`, in join order.
    fn peers_of(&self, id: &str) -> Vec<PeerInfo> {
        let mut others: Vec<(&String, &SessionEntry<S>)> = self
            .sessions
            .iter()
            .filter(|(other, _)| other.as_str() != id)
            .collect();
        others.sort_by_key(|(_, entry)| entry.joined);
        others
            .into_iter()
            .map(|(id, entry)| PeerInfo {
                id: id.clone(),
                name: entry.name.clone(),
            })
            .collect()
    }

    /// Sends every session its own view of the peer list.
    fn broadcast_peers(&self) {
        for (id, entry) in &self.sessions {
            let message = ServerMessage::PeersUpdated {
                peers: self.peers_of(id),
            };
            if !entry.sink.deliver(message) {
                tracing::debug!(session_id = %id, "Dropped peers-updated for closed session");
            }
        }
    }
}

/// Registry of live sessions.
pub struct SessionRegistry<S> {
    inner: Mutex<Inner<S>>,
    max_sessions: usize,
}

impl<S: SessionSink> SessionRegistry<S> {
    /// Creates an empty registry admitting at most `max_sessions` sessions.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                next_seq: 0,
            }),
            max_sessions,
        }
    }

    /// Registers a new session.
    ///
    /// The session receives `session-created` first, then every session
    /// (including the new one) receives a fresh `peers-updated`.
    pub fn register(&self, sink: S) -> Result<String, RegistryError> {
        let mut inner = self.inner.lock().map_err(|_| RegistryError::LockPoisoned)?;

        if inner.sessions.len() >= self.max_sessions {
            return Err(RegistryError::Full(self.max_sessions));
        }

        let mut id = Uuid::new_v4().to_string();
        while inner.sessions.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }

        sink.deliver(ServerMessage::SessionCreated {
            session_id: id.clone(),
        });

        let joined = inner.next_seq;
        inner.next_seq += 1;
        inner.sessions.insert(
            id.clone(),
            SessionEntry {
                name: DEFAULT_NAME.to_string(),
                joined,
                sink,
            },
        );

        tracing::info!(session_id = %id, sessions = inner.sessions.len(), "Session registered");
        inner.broadcast_peers();
        Ok(id)
    }

    /// Sets a session's display name.
    ///
    /// The name is trimmed and truncated to [`MAX_NAME_LENGTH`] characters.
    /// Names that are empty after trimming are ignored and `Ok(false)` is
    /// returned; otherwise all sessions receive a fresh peer list.
    pub fn rename(&self, id: &str, name: &str) -> Result<bool, RegistryError> {
        let name: String = name.trim().chars().take(MAX_NAME_LENGTH).collect();
        if name.is_empty() {
            tracing::debug!(session_id = %id, "Ignoring empty display name");
            return Ok(false);
        }

        let mut inner = self.inner.lock().map_err(|_| RegistryError::LockPoisoned)?;
        let entry = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        tracing::debug!(session_id = %id, name = %name, "Session renamed");
        entry.name = name;
        inner.broadcast_peers();
        Ok(true)
    }

    /// Removes a session and notifies the remaining ones.
    ///
    /// Returns `false` if the session was not registered.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };

        if inner.sessions.remove(id).is_none() {
            return false;
        }

        tracing::info!(session_id = %id, sessions = inner.sessions.len(), "Session removed");
        inner.broadcast_peers();
        true
    }

    /// Delivers `message` to session `id`.
    ///
    /// Returns `false` if no such session exists or its queue is closed.
    pub fn send_to(&self, id: &str, message: ServerMessage) -> bool {
        let Ok(inner) = self.inner.lock() else {
            return false;
        };
        inner
            .sessions
            .get(id)
            .is_some_and(|entry| entry.sink.deliver(message))
    }

    /// Returns all sessions other than `id`, in join order.
    pub fn peers_of(&self, id: &str) -> Vec<PeerInfo> {
        self.inner
            .lock()
            .map(|inner| inner.peers_of(id))
            .unwrap_or_default()
    }

    /// Returns whether session `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.sessions.contains_key(id))
            .unwrap_or(false)
    }

    /// Returns the number of registered sessions.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.sessions.len())
            .unwrap_or(0)
    }

    /// Returns true if no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
