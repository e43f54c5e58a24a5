//! Change set delivered to listeners.
//!
//! A ChangeSet names the tokens whose composed value changed for one listener
//! in one notification pass, together with what caused the pass.

use std::collections::BTreeSet;
use tidal_core::{Ordinal, QueryToken, Timestamp};

/// What caused a notification pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A backend transition ending at the given timestamp.
    Transition(Timestamp),
    /// An optimistic patch was enqueued.
    Optimistic(Ordinal),
    /// A failed mutation's patch was rolled back.
    Rollback(Ordinal),
    /// Confirmed patches settled outside of a transition.
    Settled,
    /// Local bookkeeping, such as a new subscription or a purged entry.
    Local,
}

/// The tokens that changed for one listener.
///
/// Tokens are kept sorted and unique.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeSet {
    /// Tokens whose composed value changed
    tokens: BTreeSet<QueryToken>,
    /// Cause of this pass
    origin: ChangeOrigin,
}

impl ChangeSet {
    /// Creates an empty change set.
    #[inline]
    pub fn new(origin: ChangeOrigin) -> Self {
        Self {
            tokens: BTreeSet::new(),
            origin,
        }
    }

    /// Creates a change set from the given tokens.
    pub fn from_tokens(origin: ChangeOrigin, tokens: impl IntoIterator<Item = QueryToken>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
            origin,
        }
    }

    #[inline]
    pub fn origin(&self) -> ChangeOrigin {
        self.origin
    }

    /// Returns true if the given token changed.
    #[inline]
    pub fn contains(&self, token: &QueryToken) -> bool {
        self.tokens.contains(token)
    }

    /// Returns true if there are no changes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Returns the number of changed tokens.
    #[inline]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Iterates over the changed tokens in token order.
    pub fn tokens(&self) -> impl Iterator<Item = &QueryToken> {
        self.tokens.iter()
    }

    /// Adds a changed token. Returns false if it was already present.
    #[inline]
    pub fn insert(&mut self, token: QueryToken) -> bool {
        self.tokens.insert(token)
    }

    /// Merges another change set's tokens into this one.
    pub fn merge(&mut self, other: ChangeSet) {
        self.tokens.extend(other.tokens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_core::{QueryRequest, Value};

    fn token(id: i64) -> QueryToken {
        let mut args = tidal_core::ValueObject::new();
        args.insert("id", Value::Int64(id));
        QueryRequest::new("items:get", Value::Object(args))
            .unwrap()
            .token()
    }

    #[test]
    fn test_change_set_new() {
        let cs = ChangeSet::new(ChangeOrigin::Local);
        assert!(cs.is_empty());
        assert_eq!(cs.len(), 0);
        assert_eq!(cs.origin(), ChangeOrigin::Local);
    }

    #[test]
    fn test_change_set_dedups_tokens() {
        let mut cs = ChangeSet::new(ChangeOrigin::Transition(Timestamp(3)));
        assert!(cs.insert(token(1)));
        assert!(!cs.insert(token(1)));
        assert!(cs.insert(token(2)));
        assert_eq!(cs.len(), 2);
        assert!(cs.contains(&token(2)));
    }

    #[test]
    fn test_change_set_merge() {
        let mut cs1 = ChangeSet::from_tokens(ChangeOrigin::Settled, [token(1)]);
        let cs2 = ChangeSet::from_tokens(ChangeOrigin::Settled, [token(1), token(2)]);
        cs1.merge(cs2);
        assert_eq!(cs1.len(), 2);
    }
}
