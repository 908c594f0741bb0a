//! Host-side client session tracking for at-most-once application.

use common::{EntryResult, SmError, SmResult};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use snapshot::codec::{decode_value, encode_value};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use tracing::debug;

/// Why an entry was not applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The client never registered, or its session was evicted.
    SessionNotFound,
    /// A register for a client that is already registered.
    SessionExists,
    /// The client already acknowledged this series id.
    AlreadyResponded,
}

/// What the host did with one entry of a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Applied(EntryResult),
    /// A retried proposal; the cached result of its first application.
    Duplicate(EntryResult),
    Registered,
    Unregistered,
    Rejected(RejectReason),
}

impl Outcome {
    pub fn result(&self) -> Option<&EntryResult> {
        match self {
            Outcome::Applied(r) | Outcome::Duplicate(r) => Some(r),
            _ => None,
        }
    }
}

/// Verdict for a regular session entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionCheck {
    NotRegistered,
    Responded,
    Duplicate(EntryResult),
    New,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ClientState {
    client_id: u64,
    responded_up_to: u64,
    history: BTreeMap<u64, EntryResult>,
}

/// LRU-bounded registry of client sessions.
///
/// Only the apply path mutates it, in log order, so every replica holds
/// the same registry at the same applied index.
pub struct SessionRegistry {
    sessions: LruCache<u64, ClientState>,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            sessions: LruCache::new(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, client_id: u64) -> bool {
        self.sessions.contains(&client_id)
    }

    /// Returns false when the client is already registered.
    pub fn register(&mut self, client_id: u64) -> bool {
        if self.sessions.contains(&client_id) {
            self.sessions.promote(&client_id);
            return false;
        }
        let state = ClientState {
            client_id,
            ..Default::default()
        };
        if let Some((evicted, _)) = self.sessions.push(client_id, state) {
            debug!(client_id = evicted, "evicted least recently used client session");
        }
        true
    }

    /// Returns false when the client was not registered.
    pub fn unregister(&mut self, client_id: u64) -> bool {
        self.sessions.pop(&client_id).is_some()
    }

    /// Classify a regular entry, first dropping results the client has
    /// acknowledged up to `responded_to`.
    pub fn check(&mut self, client_id: u64, series_id: u64, responded_to: u64) -> SessionCheck {
        let Some(state) = self.sessions.get_mut(&client_id) else {
            return SessionCheck::NotRegistered;
        };
        if responded_to > state.responded_up_to {
            state.responded_up_to = responded_to;
            state.history = state.history.split_off(&(responded_to + 1));
        }
        if let Some(result) = state.history.get(&series_id) {
            return SessionCheck::Duplicate(result.clone());
        }
        if series_id <= state.responded_up_to {
            return SessionCheck::Responded;
        }
        SessionCheck::New
    }

    /// Remember the result of a newly applied entry.
    pub fn record(&mut self, client_id: u64, series_id: u64, result: EntryResult) {
        if let Some(state) = self.sessions.peek_mut(&client_id) {
            state.history.insert(series_id, result);
        }
    }

    /// Encode in least-to-most recently used order.
    pub fn encode(&self) -> SmResult<Vec<u8>> {
        let states: Vec<&ClientState> = self.sessions.iter().rev().map(|(_, s)| s).collect();
        encode_value(&states)
    }

    pub fn decode(bytes: &[u8], capacity: usize) -> SmResult<Self> {
        let states: Vec<ClientState> = decode_value(bytes)?;
        if states.len() > capacity {
            return Err(SmError::Session(format!(
                "snapshot carries {} sessions, limit is {}",
                states.len(),
                capacity
            )));
        }
        let mut registry = Self::new(capacity);
        for state in states {
            registry.sessions.push(state.client_id, state);
        }
        Ok(registry)
    }
}
