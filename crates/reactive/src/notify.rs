//! Transition dispatch and notification.
//!
//! This module provides `TransitionDispatcher`, which applies backend
//! transitions to the result store, settles optimistic patches, and builds
//! the notification batch for every listener whose composed value changed.
//!
//! Every method here runs synchronously against borrowed state and returns
//! a [`Notifications`] batch instead of invoking callbacks. Callers fire the
//! batch after releasing their own borrows, so a listener may read or modify
//! client state from inside its callback and always sees post-change values.

use crate::change_set::ChangeOrigin;
use crate::listener::{ListenerManager, Notifications};
use crate::optimistic::{ComposedSnapshot, OptimisticUpdateQueue, Settlement, UpdateFn};
use crate::store::{LocalResultStore, QueryResult};
use crate::transition::{QueryModification, Transition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tidal_core::{Cursor, OptimisticUpdateError, Ordinal, QueryToken, Timestamp};
use tracing::{debug, warn};

/// Rule deciding when a confirmed optimistic patch is settled by the
/// backend and can be retired.
///
/// Patches whose mutation has not been confirmed never settle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SettlementPolicy {
    /// Settle once a transition at or past the mutation's commit timestamp
    /// has been observed. A confirmation without a timestamp settles at the
    /// next transition.
    #[default]
    CommitTimestamp,
    /// Settle on the first transition modifying any token the patch wrote,
    /// or on the first transition at all if it wrote none.
    TouchedTokens,
}

impl SettlementPolicy {
    /// `modified` is the token set of the transition being applied, or
    /// `None` when settling outside of a transition.
    fn settles(
        self,
        settlement: Settlement,
        touched: &BTreeSet<QueryToken>,
        observed: Option<Timestamp>,
        modified: Option<&BTreeSet<QueryToken>>,
    ) -> bool {
        let Settlement::Confirmed(commit_ts) = settlement else {
            return false;
        };
        match self {
            SettlementPolicy::CommitTimestamp => match commit_ts {
                Some(ts) => observed.is_some_and(|observed| observed >= ts),
                None => modified.is_some(),
            },
            SettlementPolicy::TouchedTokens => match modified {
                Some(modified) => touched.is_empty() || !touched.is_disjoint(modified),
                None => false,
            },
        }
    }
}

/// Result of applying one transition.
#[must_use = "notifications do nothing until fired"]
pub struct Applied {
    pub notifications: Notifications,
    /// Resumption cursors delivered with the transition, for known tokens
    pub cursors: Vec<(QueryToken, Cursor)>,
    /// Ordinals of the patches this transition settled
    pub settled: Vec<Ordinal>,
}

/// Applies transitions and optimistic changes, and decides who to notify.
pub struct TransitionDispatcher {
    listeners: ListenerManager,
    policy: SettlementPolicy,
    /// Highest transition end timestamp seen so far
    max_observed_ts: Option<Timestamp>,
}

impl Default for TransitionDispatcher {
    fn default() -> Self {
        Self::new(SettlementPolicy::default())
    }
}

impl TransitionDispatcher {
    /// Creates a dispatcher with the given settlement policy.
    pub fn new(policy: SettlementPolicy) -> Self {
        Self {
            listeners: ListenerManager::new(),
            policy,
            max_observed_ts: None,
        }
    }

    #[inline]
    pub fn policy(&self) -> SettlementPolicy {
        self.policy
    }

    #[inline]
    pub fn listeners(&self) -> &ListenerManager {
        &self.listeners
    }

    #[inline]
    pub fn listeners_mut(&mut self) -> &mut ListenerManager {
        &mut self.listeners
    }

    /// Returns the highest transition end timestamp applied so far.
    #[inline]
    pub fn max_observed_ts(&self) -> Option<Timestamp> {
        self.max_observed_ts
    }

    /// Applies a transition in one pass.
    ///
    /// Every modification for a known token becomes the new confirmed result
    /// (later duplicates win), settled patches are retired, the composed
    /// values are recomputed once, and each listener whose tokens changed
    /// appears exactly once in the returned batch.
    pub fn apply_transition(
        &mut self,
        store: &mut LocalResultStore,
        queue: &mut OptimisticUpdateQueue,
        transition: Transition,
    ) -> Applied {
        let Transition {
            start_ts,
            end_ts,
            modifications,
        } = transition;

        if let (Some(start), Some(observed)) = (start_ts, self.max_observed_ts) {
            if start != observed {
                warn!(start = %start, observed = %observed, "transition does not start at the observed timestamp");
            }
        }

        let modified: BTreeSet<QueryToken> =
            modifications.iter().map(|m| m.token().clone()).collect();
        let before = ComposedSnapshot::capture(store, queue, &modified);

        let mut cursors = Vec::new();
        let mut applied = 0usize;
        for modification in modifications {
            let token = modification.token().clone();
            if !store.contains(&token) {
                warn!(token = %token, "ignoring modification for unknown query");
                continue;
            }
            if let Some(cursor) = modification.cursor() {
                cursors.push((token.clone(), cursor.clone()));
            }
            let result = match modification {
                QueryModification::Updated { value, .. } => Some(QueryResult::Value(value)),
                QueryModification::Failed { error, .. } => Some(QueryResult::Error(error)),
                QueryModification::Removed { .. } => None,
            };
            store.set_result(&token, result);
            applied += 1;
        }

        self.max_observed_ts = Some(self.max_observed_ts.map_or(end_ts, |ts| ts.max(end_ts)));

        let policy = self.policy;
        let observed = self.max_observed_ts;
        let settled = queue.remove_where(|_, settlement, touched| {
            policy.settles(settlement, touched, observed, Some(&modified))
        });
        queue.recompute(store);

        let changed = before.changed(store, queue);
        debug!(
            end_ts = %end_ts,
            modifications = applied,
            settled = settled.len(),
            changed = changed.len(),
            "applied transition"
        );

        Applied {
            notifications: self
                .listeners
                .collect(&changed, ChangeOrigin::Transition(end_ts)),
            cursors,
            settled,
        }
    }

    /// Enqueues an optimistic patch and returns the listeners to notify.
    pub fn enqueue(
        &self,
        store: &LocalResultStore,
        queue: &mut OptimisticUpdateQueue,
        ordinal: Ordinal,
        update: UpdateFn,
    ) -> Result<Notifications, OptimisticUpdateError> {
        let before = ComposedSnapshot::capture(store, queue, []);
        queue.enqueue(store, ordinal, update)?;
        let changed = before.changed(store, queue);
        Ok(self
            .listeners
            .collect(&changed, ChangeOrigin::Optimistic(ordinal)))
    }

    /// Records a successful mutation and retires whatever is already
    /// settled.
    pub fn confirm(
        &self,
        store: &LocalResultStore,
        queue: &mut OptimisticUpdateQueue,
        ordinal: Ordinal,
        commit_ts: Option<Timestamp>,
    ) -> Notifications {
        if queue.confirm(ordinal, commit_ts) {
            debug!(ordinal = %ordinal, commit_ts = ?commit_ts, "mutation confirmed");
        }
        self.settle_observed(store, queue)
    }

    /// Retires confirmed patches whose commit timestamp has already been
    /// observed.
    pub fn settle_observed(
        &self,
        store: &LocalResultStore,
        queue: &mut OptimisticUpdateQueue,
    ) -> Notifications {
        let policy = self.policy;
        let observed = self.max_observed_ts;
        let before = ComposedSnapshot::capture(store, queue, []);
        let settled = queue.remove_where(|_, settlement, touched| {
            policy.settles(settlement, touched, observed, None)
        });
        if settled.is_empty() {
            return Notifications::new();
        }
        debug!(settled = ?settled, "settled patches outside of a transition");
        queue.recompute(store);
        let changed = before.changed(store, queue);
        self.listeners.collect(&changed, ChangeOrigin::Settled)
    }

    /// Rolls back a failed mutation's patch.
    ///
    /// Returns `None` if no patch is queued for `ordinal`.
    pub fn rollback(
        &self,
        store: &LocalResultStore,
        queue: &mut OptimisticUpdateQueue,
        ordinal: Ordinal,
    ) -> Option<Notifications> {
        let before = ComposedSnapshot::capture(store, queue, []);
        if !queue.retire(store, ordinal) {
            return None;
        }
        let changed = before.changed(store, queue);
        Some(
            self.listeners
                .collect(&changed, ChangeOrigin::Rollback(ordinal)),
        )
    }

    /// Builds a batch for tokens changed by local bookkeeping.
    pub fn notify_tokens<'a, I>(&self, tokens: I) -> Notifications
    where
        I: IntoIterator<Item = &'a QueryToken>,
    {
        self.listeners.collect(tokens, ChangeOrigin::Local)
    }
}
