//! Per-conversation admission tracking
//!
//! Counts how many provider requests each conversation has outstanding and
//! enforces the admission cap. Eviction happens on completion, on explicit
//! cancellation, and as a side effect of [`SessionTracker::check`] once the
//! cap is reached.
//!
//! Every operation runs to completion under the map's per-key entry lock
//! and never awaits, so operations on one key never interleave.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::events::WireId;
use crate::config::RelayConfig;

/// Key identifying a logical conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "WireId")]
pub struct ConversationKey(String);

impl From<ConversationKey> for String {
    fn from(key: ConversationKey) -> Self {
        key.0
    }
}

impl ConversationKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConversationKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConversationKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for ConversationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of an admissibility check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Entry exists and is below the cap
    Admitted { pending: u32 },
    /// No entry: never admitted, completed, or stopped
    Absent,
    /// Entry reached the cap and has just been evicted
    CapExceeded { pending: u32 },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

#[derive(Debug)]
struct Session {
    pending: u32,
    cancel: CancellationToken,
}

/// Tracks outstanding provider requests per conversation
#[derive(Debug)]
pub struct SessionTracker {
    sessions: DashMap<ConversationKey, Session>,
    cap: u32,
    first_admission_counts: bool,
}

impl SessionTracker {
    /// Create a tracker with the given cap; the first admission counts as one
    pub fn new(cap: u32) -> Self {
        Self {
            sessions: DashMap::new(),
            cap,
            first_admission_counts: true,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.concurrency_cap)
            .with_first_admission_counts(config.first_admission_counts)
    }

    /// When false, a new entry starts at zero and the effective cap grows by one
    pub fn with_first_admission_counts(mut self, counts: bool) -> Self {
        self.first_admission_counts = counts;
        self
    }

    /// Record a new request for `key`
    ///
    /// Increments an existing entry or creates a fresh one. Returns the
    /// entry's cancellation token, which fires when the entry is evicted.
    pub fn admit(&self, key: &ConversationKey) -> CancellationToken {
        match self.sessions.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let session = occupied.get_mut();
                session.pending = session.pending.saturating_add(1);
                session.cancel.clone()
            }
            Entry::Vacant(vacant) => {
                let cancel = CancellationToken::new();
                let pending = u32::from(self.first_admission_counts);
                vacant.insert(Session {
                    pending,
                    cancel: cancel.clone(),
                });
                cancel
            }
        }
    }

    /// Check whether `key` may keep going, evicting it if the cap was reached
    pub fn check(&self, key: &ConversationKey) -> Admission {
        match self.sessions.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let pending = occupied.get().pending;
                if pending < self.cap {
                    Admission::Admitted { pending }
                } else {
                    let (_, session) = occupied.remove_entry();
                    session.cancel.cancel();
                    Admission::CapExceeded { pending }
                }
            }
            Entry::Vacant(_) => Admission::Absent,
        }
    }

    pub fn is_admissible(&self, key: &ConversationKey) -> bool {
        self.check(key).is_admitted()
    }

    /// Remove `key` unconditionally; returns whether an entry existed
    pub fn evict(&self, key: &ConversationKey) -> bool {
        match self.sessions.remove(key) {
            Some((_, session)) => {
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Current count for `key`, without side effects
    pub fn pending(&self, key: &ConversationKey) -> Option<u32> {
        self.sessions.get(key).map(|session| session.pending)
    }

    pub fn contains(&self, key: &ConversationKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
