//! Subscription registry.
//!
//! The registry deduplicates and ref-counts subscriptions by query token and
//! tracks where each one stands with the backend. It performs no I/O: every
//! operation returns what the client must send, and the client sends it
//! after releasing its state borrow.
//!
//! A backend subscription exchange moves through three states:
//!
//! ```text
//!   Idle --subscribe--> Subscribing --ack--> Live
//!     ^                      |                 |
//!     +------ack (no watchers), ack error -----+-- last watcher leaves
//! ```
//!
//! Teardown of a subscription whose exchange is still in flight is deferred
//! to its acknowledgement, and skipped if a watcher came back meanwhile.

use hashbrown::HashMap;
use tidal_core::{Cursor, QueryToken};

/// Backend state of one subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendState {
    /// No backend subscription.
    Idle,
    /// A subscribe exchange is in flight.
    Subscribing { generation: u64 },
    /// The backend acknowledged the subscription.
    Live,
}

#[derive(Debug)]
struct Entry {
    refcount: usize,
    cursor: Option<Cursor>,
    backend: BackendState,
}

/// A subscribe exchange the client must start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Issue {
    pub token: QueryToken,
    pub generation: u64,
    pub cursor: Option<Cursor>,
}

/// Outcome of acquiring a watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acquired {
    /// The token was already watched.
    Deduplicated,
    /// The token was known without watchers and its backend subscription
    /// is still, or again, in place.
    Revived,
    /// A backend subscription must be started. `fresh` is true when the
    /// token was not known before.
    Subscribe { issue: Issue, fresh: bool },
}

/// Outcome of releasing a watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Released {
    /// Other watchers remain.
    Remaining(usize),
    /// The last watcher left. `teardown` is true when the backend
    /// subscription must be torn down now.
    Last { teardown: bool },
    /// The token had no watchers.
    Unknown,
}

/// What to do with a subscribe acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckAction {
    /// Stale or for a forgotten token.
    Ignore,
    /// The subscription is live.
    Live,
    /// Every watcher left while the exchange was in flight.
    Teardown,
}

/// Ref-counted subscriptions by token.
pub struct SubscriptionRegistry {
    entries: HashMap<QueryToken, Entry>,
    next_generation: u64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_generation: 1,
        }
    }

    fn issue(&mut self, token: &QueryToken) -> Option<Issue> {
        let generation = self.next_generation;
        let entry = self.entries.get_mut(token)?;
        self.next_generation += 1;
        entry.backend = BackendState::Subscribing { generation };
        Some(Issue {
            token: token.clone(),
            generation,
            cursor: entry.cursor.clone(),
        })
    }

    /// Adds a watcher to `token`.
    ///
    /// `cursor` is only used when the token is not known yet.
    pub fn acquire(&mut self, token: &QueryToken, cursor: Option<Cursor>) -> Acquired {
        let fresh = match self.entries.get_mut(token) {
            Some(entry) if entry.refcount > 0 => {
                entry.refcount += 1;
                return Acquired::Deduplicated;
            }
            Some(entry) => {
                entry.refcount = 1;
                if entry.backend != BackendState::Idle {
                    return Acquired::Revived;
                }
                false
            }
            None => {
                self.entries.insert(
                    token.clone(),
                    Entry {
                        refcount: 1,
                        cursor,
                        backend: BackendState::Idle,
                    },
                );
                true
            }
        };
        match self.issue(token) {
            Some(issue) => Acquired::Subscribe { issue, fresh },
            None => Acquired::Revived,
        }
    }

    /// Removes a watcher from `token`.
    pub fn release(&mut self, token: &QueryToken) -> Released {
        let Some(entry) = self.entries.get_mut(token) else {
            return Released::Unknown;
        };
        if entry.refcount == 0 {
            return Released::Unknown;
        }
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return Released::Remaining(entry.refcount);
        }
        let teardown = entry.backend == BackendState::Live;
        if teardown {
            entry.backend = BackendState::Idle;
        }
        Released::Last { teardown }
    }

    /// Handles the acknowledgement of the exchange started as `generation`.
    pub fn acknowledge(
        &mut self,
        token: &QueryToken,
        generation: u64,
        result: Result<Option<Cursor>, ()>,
    ) -> AckAction {
        let Some(entry) = self.entries.get_mut(token) else {
            return AckAction::Ignore;
        };
        if entry.backend != (BackendState::Subscribing { generation }) {
            return AckAction::Ignore;
        }
        match result {
            Err(()) => {
                entry.backend = BackendState::Idle;
                AckAction::Ignore
            }
            Ok(cursor) => {
                if let Some(cursor) = cursor {
                    entry.cursor = Some(cursor);
                }
                if entry.refcount > 0 {
                    entry.backend = BackendState::Live;
                    AckAction::Live
                } else {
                    entry.backend = BackendState::Idle;
                    AckAction::Teardown
                }
            }
        }
    }

    /// Records a resumption cursor delivered with a transition.
    pub fn set_cursor(&mut self, token: &QueryToken, cursor: Cursor) -> bool {
        match self.entries.get_mut(token) {
            Some(entry) => {
                entry.cursor = Some(cursor);
                true
            }
            None => false,
        }
    }

    /// Re-issues every watched subscription, from its stored cursor.
    ///
    /// Exchanges still in flight are superseded: their acknowledgements
    /// become stale. Unwatched exchanges in flight are dropped.
    pub fn reissue_watched(&mut self) -> Vec<Issue> {
        let mut tokens = Vec::new();
        for (token, entry) in self.entries.iter_mut() {
            if entry.refcount > 0 {
                tokens.push(token.clone());
            } else if matches!(entry.backend, BackendState::Subscribing { .. }) {
                entry.backend = BackendState::Idle;
            }
        }
        tokens.sort();
        tokens.iter().filter_map(|t| self.issue(t)).collect()
    }

    /// Tokens with at least one watcher, in token order.
    pub fn watched(&self) -> Vec<QueryToken> {
        let mut tokens: Vec<QueryToken> = self
            .entries
            .iter()
            .filter(|(_, e)| e.refcount > 0)
            .map(|(t, _)| t.clone())
            .collect();
        tokens.sort();
        tokens
    }

    /// Tokens that are known but have no watchers, in token order.
    pub fn unwatched(&self) -> Vec<QueryToken> {
        let mut tokens: Vec<QueryToken> = self
            .entries
            .iter()
            .filter(|(_, e)| e.refcount == 0)
            .map(|(t, _)| t.clone())
            .collect();
        tokens.sort();
        tokens
    }

    /// Drops an unwatched token whose backend subscription is gone.
    ///
    /// Returns false, keeping the entry, while it is watched or its exchange
    /// is still in flight.
    pub fn forget(&mut self, token: &QueryToken) -> bool {
        match self.entries.get(token) {
            Some(entry) if entry.refcount == 0 && entry.backend == BackendState::Idle => {
                self.entries.remove(token);
                true
            }
            _ => false,
        }
    }

    /// Returns the number of watchers of `token`.
    pub fn refcount(&self, token: &QueryToken) -> usize {
        self.entries.get(token).map_or(0, |e| e.refcount)
    }

    pub fn cursor(&self, token: &QueryToken) -> Option<&Cursor> {
        self.entries.get(token).and_then(|e| e.cursor.as_ref())
    }

    pub fn backend_state(&self, token: &QueryToken) -> Option<BackendState> {
        self.entries.get(token).map(|e| e.backend)
    }

    /// Returns the number of known tokens, watched or not.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
