//! Optimistic update queue.
//!
//! Each pending mutation may carry an update function that predicts its
//! effect on locally cached query results. The queue keeps those functions,
//! keyed by mutation ordinal, and maintains the composed overlay: the
//! confirmed results folded through every active patch in ascending ordinal
//! order.
//!
//! The overlay is always reproducible from scratch. [`recompute`] replays
//! every active patch over the confirmed baseline, so retiring one patch
//! never depends on when unrelated patches were enqueued or retired.
//!
//! [`recompute`]: OptimisticUpdateQueue::recompute

use crate::store::{LocalResultStore, QueryResult};
use hashbrown::HashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use tidal_core::{
    ArgLimits, ArgumentError, FunctionRef, OptimisticUpdateError, Ordinal, QueryRequest,
    QueryToken, Timestamp, Value, ValueObject,
};
use tracing::{debug, trace, warn};

/// An optimistic update function.
///
/// Must be pure: it may only read and write through the view it is given.
pub type UpdateFn = Rc<dyn Fn(&mut OptimisticLocalStore<'_>) -> Result<(), OptimisticUpdateError>>;

/// Wraps a closure as an [`UpdateFn`].
pub fn update_fn<F>(f: F) -> UpdateFn
where
    F: Fn(&mut OptimisticLocalStore<'_>) -> Result<(), OptimisticUpdateError> + 'static,
{
    Rc::new(f)
}

/// Per-token writes of one or more patches. `None` means loading.
type Overlay = HashMap<QueryToken, Option<QueryResult>>;

/// Whether the backend has acknowledged a patch's mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// The mutation response has not arrived.
    Pending,
    /// The mutation succeeded, committing at the given timestamp if known.
    Confirmed(Option<Timestamp>),
}

struct OptimisticPatch {
    update: UpdateFn,
    settlement: Settlement,
    /// Tokens written by the patch's most recent successful run
    touched: BTreeSet<QueryToken>,
}

/// Read-write view handed to an update function.
///
/// Reads see the confirmed results with every earlier patch applied. Writes
/// are buffered and only take effect if the update function returns `Ok`.
/// Only known tokens can be written; writes to anything else are ignored.
pub struct OptimisticLocalStore<'a> {
    store: &'a LocalResultStore,
    base: &'a Overlay,
    limits: ArgLimits,
    writes: Overlay,
}

/// A known query as seen through [`OptimisticLocalStore::get_all`].
#[derive(Clone, Debug, PartialEq)]
pub struct LocalQuery {
    pub token: QueryToken,
    pub args: ValueObject,
    /// `None` while loading or holding an error
    pub value: Option<Value>,
}

impl<'a> OptimisticLocalStore<'a> {
    fn new(store: &'a LocalResultStore, base: &'a Overlay, limits: ArgLimits) -> Self {
        Self {
            store,
            base,
            limits,
            writes: Overlay::new(),
        }
    }

    fn current(&self, token: &QueryToken) -> Option<&QueryResult> {
        if let Some(written) = self.writes.get(token) {
            return written.as_ref();
        }
        if let Some(composed) = self.base.get(token) {
            return composed.as_ref();
        }
        self.store.result(token)
    }

    fn token(&self, function: impl Into<FunctionRef>, args: Value) -> Result<QueryToken, ArgumentError> {
        Ok(QueryRequest::with_limits(function, args, &self.limits)?.token())
    }

    /// Reads a query's current value.
    ///
    /// Returns `None` if the query is unknown, loading, or holds an error.
    pub fn get(
        &self,
        function: impl Into<FunctionRef>,
        args: Value,
    ) -> Result<Option<Value>, ArgumentError> {
        let token = self.token(function, args)?;
        Ok(self.get_token(&token))
    }

    /// Reads a query's current value by token.
    pub fn get_token(&self, token: &QueryToken) -> Option<Value> {
        self.current(token).and_then(QueryResult::value).cloned()
    }

    /// Reads a query's current result, including errors.
    pub fn get_result(&self, token: &QueryToken) -> Option<&QueryResult> {
        self.current(token)
    }

    /// Returns every known query of a function, with its current value.
    pub fn get_all(&self, function: impl Into<FunctionRef>) -> Result<Vec<LocalQuery>, ArgumentError> {
        let path = function.into().resolve()?;
        Ok(self
            .store
            .tokens_for(&path)
            .into_iter()
            .filter_map(|token| {
                let args = self.store.get(&token)?.request().args().clone();
                let value = self.get_token(&token);
                Some(LocalQuery { token, args, value })
            })
            .collect())
    }

    /// Overwrites a query's value.
    pub fn set(
        &mut self,
        function: impl Into<FunctionRef>,
        args: Value,
        value: Value,
    ) -> Result<(), ArgumentError> {
        let token = self.token(function, args)?;
        self.set_token(&token, Some(value));
        Ok(())
    }

    /// Puts a query back into the loading state.
    pub fn set_loading(
        &mut self,
        function: impl Into<FunctionRef>,
        args: Value,
    ) -> Result<(), ArgumentError> {
        let token = self.token(function, args)?;
        self.set_token(&token, None);
        Ok(())
    }

    /// Overwrites a query's value by token. `None` means loading.
    pub fn set_token(&mut self, token: &QueryToken, value: Option<Value>) {
        if !self.store.contains(token) {
            debug!(token = %token, "ignoring optimistic write to unknown query");
            return;
        }
        self.writes
            .insert(token.clone(), value.map(QueryResult::Value));
    }
}

/// Active optimistic patches, in mutation ordinal order.
pub struct OptimisticUpdateQueue {
    patches: BTreeMap<Ordinal, OptimisticPatch>,
    /// Composed writes of every active patch
    overlay: Overlay,
    limits: ArgLimits,
}

impl Default for OptimisticUpdateQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimisticUpdateQueue {
    /// Creates an empty queue with the default argument limits.
    pub fn new() -> Self {
        Self::with_limits(ArgLimits::default())
    }

    /// Creates an empty queue whose views validate arguments with `limits`.
    pub fn with_limits(limits: ArgLimits) -> Self {
        Self {
            patches: BTreeMap::new(),
            overlay: Overlay::new(),
            limits,
        }
    }

    /// Runs an update function over the current composed state and, if it
    /// succeeds, keeps it as the patch for `ordinal`.
    ///
    /// On failure nothing changes and the error is returned.
    pub fn enqueue(
        &mut self,
        store: &LocalResultStore,
        ordinal: Ordinal,
        update: UpdateFn,
    ) -> Result<(), OptimisticUpdateError> {
        if self.patches.contains_key(&ordinal) {
            return Err(OptimisticUpdateError::new(format!(
                "a patch is already queued for mutation {ordinal}"
            )));
        }

        let newest = self.patches.keys().next_back().map_or(true, |last| *last < ordinal);
        if !newest {
            // Out of order: insert and replay so the patch lands in place.
            {
                let mut scratch = OptimisticLocalStore::new(store, &self.overlay, self.limits);
                update(&mut scratch)?;
            }
            self.patches.insert(
                ordinal,
                OptimisticPatch {
                    update,
                    settlement: Settlement::Pending,
                    touched: BTreeSet::new(),
                },
            );
            self.recompute(store);
            return Ok(());
        }

        let writes = {
            let mut view = OptimisticLocalStore::new(store, &self.overlay, self.limits);
            if let Err(err) = update(&mut view) {
                debug!(ordinal = %ordinal, error = %err, "optimistic update rejected");
                return Err(err);
            }
            view.writes
        };

        let touched: BTreeSet<QueryToken> = writes.keys().cloned().collect();
        debug!(ordinal = %ordinal, touched = touched.len(), "optimistic patch enqueued");
        self.overlay.extend(writes);
        self.patches.insert(
            ordinal,
            OptimisticPatch {
                update,
                settlement: Settlement::Pending,
                touched,
            },
        );
        Ok(())
    }

    /// Records that the mutation behind `ordinal` succeeded.
    ///
    /// The patch stays active until it is settled. Returns false if no such
    /// patch is queued.
    pub fn confirm(&mut self, ordinal: Ordinal, commit_ts: Option<Timestamp>) -> bool {
        match self.patches.get_mut(&ordinal) {
            Some(patch) => {
                patch.settlement = Settlement::Confirmed(commit_ts);
                true
            }
            None => false,
        }
    }

    /// Removes exactly the patch for `ordinal` and recomputes the overlay.
    ///
    /// Returns false if no such patch is queued, so a patch can only be
    /// retired once.
    pub fn retire(&mut self, store: &LocalResultStore, ordinal: Ordinal) -> bool {
        if self.patches.remove(&ordinal).is_none() {
            return false;
        }
        debug!(ordinal = %ordinal, "optimistic patch retired");
        self.recompute(store);
        true
    }

    /// Removes every patch for which `settles` returns true, without
    /// recomputing. Returns the removed ordinals in ascending order.
    pub fn remove_where<F>(&mut self, mut settles: F) -> Vec<Ordinal>
    where
        F: FnMut(Ordinal, Settlement, &BTreeSet<QueryToken>) -> bool,
    {
        let settled: Vec<Ordinal> = self
            .patches
            .iter()
            .filter(|(ordinal, patch)| settles(**ordinal, patch.settlement, &patch.touched))
            .map(|(ordinal, _)| *ordinal)
            .collect();
        for ordinal in &settled {
            self.patches.remove(ordinal);
        }
        settled
    }

    /// Rebuilds the overlay by replaying every active patch, in ordinal
    /// order, over the confirmed baseline.
    ///
    /// A patch that fails during replay is skipped for this replay.
    pub fn recompute(&mut self, store: &LocalResultStore) {
        let limits = self.limits;
        let mut overlay = Overlay::new();
        for (ordinal, patch) in self.patches.iter_mut() {
            let mut view = OptimisticLocalStore::new(store, &overlay, limits);
            match (patch.update)(&mut view) {
                Ok(()) => {
                    let writes = view.writes;
                    trace!(ordinal = %ordinal, writes = writes.len(), "replayed optimistic patch");
                    patch.touched = writes.keys().cloned().collect();
                    overlay.extend(writes);
                }
                Err(err) => {
                    warn!(ordinal = %ordinal, error = %err, "optimistic update failed during replay, skipping");
                }
            }
        }
        self.overlay = overlay;
    }

    /// Returns the composed result of a known token.
    pub fn composed<'s>(&'s self, store: &'s LocalResultStore, token: &QueryToken) -> Option<&'s QueryResult> {
        if !store.contains(token) {
            return None;
        }
        match self.overlay.get(token) {
            Some(composed) => composed.as_ref(),
            None => store.result(token),
        }
    }

    /// Returns true if any active patch wrote the token.
    pub fn touches(&self, token: &QueryToken) -> bool {
        self.patches.values().any(|p| p.touched.contains(token))
    }

    /// Returns the settlement state of a queued patch.
    pub fn settlement(&self, ordinal: Ordinal) -> Option<Settlement> {
        self.patches.get(&ordinal).map(|p| p.settlement)
    }

    /// Returns true if a patch is queued for `ordinal`.
    #[inline]
    pub fn contains(&self, ordinal: Ordinal) -> bool {
        self.patches.contains_key(&ordinal)
    }

    /// Returns the active ordinals in ascending order.
    pub fn ordinals(&self) -> impl Iterator<Item = Ordinal> + '_ {
        self.patches.keys().copied()
    }

    /// Returns the number of active patches.
    #[inline]
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    fn overlay_tokens(&self) -> impl Iterator<Item = &QueryToken> {
        self.overlay.keys()
    }
}

/// Composed values captured before a critical section, used to find the
/// tokens whose composed value changed across it.
pub struct ComposedSnapshot {
    values: BTreeMap<QueryToken, Option<QueryResult>>,
}

impl ComposedSnapshot {
    /// Captures the composed value of every token in `tokens` and every token
    /// the queue currently overlays.
    ///
    /// `tokens` must cover every token whose confirmed result the section
    /// will change.
    pub fn capture<'a, I>(store: &LocalResultStore, queue: &'a OptimisticUpdateQueue, tokens: I) -> Self
    where
        I: IntoIterator<Item = &'a QueryToken>,
    {
        let mut values = BTreeMap::new();
        for token in tokens.into_iter().chain(queue.overlay_tokens()) {
            if !values.contains_key(token) {
                values.insert(token.clone(), queue.composed(store, token).cloned());
            }
        }
        Self { values }
    }

    /// Returns the tokens whose composed value now differs.
    pub fn changed(&self, store: &LocalResultStore, queue: &OptimisticUpdateQueue) -> BTreeSet<QueryToken> {
        let mut changed = BTreeSet::new();
        for (token, before) in &self.values {
            if queue.composed(store, token) != before.as_ref() {
                changed.insert(token.clone());
            }
        }
        // Newly overlaid tokens were not captured; their confirmed result is
        // their previous composed value.
        for token in queue.overlay_tokens() {
            if !self.values.contains_key(token) && queue.composed(store, token) != store.result(token) {
                changed.insert(token.clone());
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    fn counter() -> QueryRequest {
        QueryRequest::new("counter:get", Value::from(json!({}))).unwrap()
    }

    fn store_with(value: i64) -> LocalResultStore {
        let mut store = LocalResultStore::new();
        let q = counter();
        store.insert_query(q.token(), q.clone());
        store.set_result(&q.token(), Some(Value::Int64(value).into()));
        store
    }

    fn set_to(n: i64) -> UpdateFn {
        update_fn(move |view| {
            view.set("counter:get", Value::from(json!({})), Value::Int64(n))?;
            Ok(())
        })
    }

    fn add(n: i64) -> UpdateFn {
        update_fn(move |view| {
            let current = view
                .get("counter:get", Value::from(json!({})))?
                .and_then(|v| v.as_i64())
                .ok_or("counter not loaded")?;
            view.set("counter:get", Value::from(json!({})), Value::Int64(current + n))?;
            Ok(())
        })
    }

    fn composed_i64(queue: &OptimisticUpdateQueue, store: &LocalResultStore) -> Option<i64> {
        queue
            .composed(store, &counter().token())
            .and_then(QueryResult::value)
            .and_then(Value::as_i64)
    }

    #[test]
    fn test_enqueue_overlays() {
        let store = store_with(5);
        let mut queue = OptimisticUpdateQueue::new();

        queue.enqueue(&store, Ordinal(1), set_to(6)).unwrap();
        assert_eq!(composed_i64(&queue, &store), Some(6));
        assert!(queue.touches(&counter().token()));
        assert_eq!(queue.settlement(Ordinal(1)), Some(Settlement::Pending));
    }

    #[test]
    fn test_composition_in_ordinal_order() {
        let store = store_with(10);
        let mut queue = OptimisticUpdateQueue::new();

        queue.enqueue(&store, Ordinal(1), add(1)).unwrap();
        queue.enqueue(&store, Ordinal(2), set_to(100)).unwrap();
        queue.enqueue(&store, Ordinal(3), add(5)).unwrap();
        assert_eq!(composed_i64(&queue, &store), Some(105));

        // Retiring the middle patch replays the rest over the baseline.
        assert!(queue.retire(&store, Ordinal(2)));
        assert_eq!(composed_i64(&queue, &store), Some(16));
    }

    #[test]
    fn test_failed_update_has_no_effect() {
        let store = store_with(5);
        let mut queue = OptimisticUpdateQueue::new();

        let failing: UpdateFn = update_fn(|view| {
            view.set("counter:get", Value::from(json!({})), Value::Int64(99))?;
            Err(OptimisticUpdateError::new("nope"))
        });

        let err = queue.enqueue(&store, Ordinal(1), failing).unwrap_err();
        assert_eq!(err.message, "nope");
        assert!(queue.is_empty());
        assert_eq!(composed_i64(&queue, &store), Some(5));
    }

    #[test]
    fn test_write_to_unknown_token_ignored() {
        let store = store_with(5);
        let mut queue = OptimisticUpdateQueue::new();

        let update: UpdateFn = update_fn(|view| {
            view.set("other:get", Value::from(json!({})), Value::Int64(1))?;
            Ok(())
        });
        queue.enqueue(&store, Ordinal(1), update).unwrap();

        let other = QueryRequest::new("other:get", Value::from(json!({}))).unwrap();
        assert!(queue.composed(&store, &other.token()).is_none());
        assert!(!queue.touches(&other.token()));
    }

    #[test]
    fn test_set_loading() {
        let store = store_with(5);
        let mut queue = OptimisticUpdateQueue::new();

        let update: UpdateFn = update_fn(|view| {
            view.set_loading("counter:get", Value::from(json!({})))?;
            Ok(())
        });
        queue.enqueue(&store, Ordinal(1), update).unwrap();
        assert!(queue.composed(&store, &counter().token()).is_none());
    }

    #[test]
    fn test_retire_exactly_once() {
        let store = store_with(5);
        let mut queue = OptimisticUpdateQueue::new();

        queue.enqueue(&store, Ordinal(1), set_to(6)).unwrap();
        assert!(queue.retire(&store, Ordinal(1)));
        assert!(!queue.retire(&store, Ordinal(1)));
        assert_eq!(composed_i64(&queue, &store), Some(5));
    }

    #[test]
    fn test_replay_failure_is_skipped() {
        let mut store = store_with(5);
        let mut queue = OptimisticUpdateQueue::new();

        queue.enqueue(&store, Ordinal(1), add(1)).unwrap();
        queue.enqueue(&store, Ordinal(2), set_to(50)).unwrap();

        // Baseline goes back to loading: the add can no longer run.
        store.set_result(&counter().token(), None);
        queue.recompute(&store);

        assert_eq!(composed_i64(&queue, &store), Some(50));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_get_all() {
        let mut store = LocalResultStore::new();
        for channel in ["a", "b"] {
            let q = QueryRequest::new("messages:list", Value::from(json!({ "channel": channel })))
                .unwrap();
            store.insert_query(q.token(), q.clone());
            store.set_result(&q.token(), Some(Value::from(json!([channel])).into()));
        }
        let mut queue = OptimisticUpdateQueue::new();

        let seen = Rc::new(RefCell::new(0));
        let seen_clone = seen.clone();
        let update: UpdateFn = update_fn(move |view| {
            let all = view.get_all("messages:list")?;
            *seen_clone.borrow_mut() = all.len();
            for query in all {
                view.set_token(&query.token, Some(Value::Array(vec![])));
            }
            Ok(())
        });
        queue.enqueue(&store, Ordinal(1), update).unwrap();

        assert_eq!(*seen.borrow(), 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_out_of_order_enqueue_lands_in_place() {
        let store = store_with(1);
        let mut queue = OptimisticUpdateQueue::new();

        queue.enqueue(&store, Ordinal(2), add(10)).unwrap();
        queue.enqueue(&store, Ordinal(1), set_to(100)).unwrap();
        assert_eq!(composed_i64(&queue, &store), Some(110));
    }

    #[test]
    fn test_remove_where_confirmed() {
        let store = store_with(1);
        let mut queue = OptimisticUpdateQueue::new();

        queue.enqueue(&store, Ordinal(1), add(1)).unwrap();
        queue.enqueue(&store, Ordinal(2), add(1)).unwrap();
        assert!(queue.confirm(Ordinal(2), Some(Timestamp(7))));
        assert!(!queue.confirm(Ordinal(9), None));

        let removed = queue.remove_where(|_, s, _| matches!(s, Settlement::Confirmed(_)));
        assert_eq!(removed, vec![Ordinal(2)]);
        queue.recompute(&store);
        assert_eq!(composed_i64(&queue, &store), Some(2));
    }

    #[test]
    fn test_snapshot_changed() {
        let mut store = store_with(5);
        let mut queue = OptimisticUpdateQueue::new();
        let token = counter().token();

        let before = ComposedSnapshot::capture(&store, &queue, []);
        queue.enqueue(&store, Ordinal(1), set_to(6)).unwrap();
        assert!(before.changed(&store, &queue).contains(&token));

        // Masked by the patch: the confirmed change is invisible.
        let before = ComposedSnapshot::capture(&store, &queue, [&token]);
        store.set_result(&token, Some(Value::Int64(8).into()));
        queue.recompute(&store);
        assert!(before.changed(&store, &queue).is_empty());
    }

    // ==================== Property tests ====================

    use proptest::prelude::*;

    proptest! {
        /// The composed value depends only on the active set, never on the
        /// order in which other patches retired.
        #[test]
        fn prop_composition_independent_of_retirement_order(
            deltas in proptest::collection::vec(-5i64..5, 1..6),
            retire_order in Just((0..6).collect::<Vec<usize>>()).prop_shuffle(),
        ) {
            let store = store_with(0);
            let mut queue = OptimisticUpdateQueue::new();
            for (i, d) in deltas.iter().enumerate() {
                queue.enqueue(&store, Ordinal(i as u64 + 1), add(*d)).unwrap();
            }
            let mut remaining: i64 = deltas.iter().sum();
            prop_assert_eq!(composed_i64(&queue, &store), Some(remaining));

            for idx in retire_order.into_iter().filter(|i| *i < deltas.len()) {
                prop_assert!(queue.retire(&store, Ordinal(idx as u64 + 1)));
                remaining -= deltas[idx];
                prop_assert_eq!(composed_i64(&queue, &store), Some(remaining));
            }
            prop_assert!(queue.is_empty());
        }
    }
}
