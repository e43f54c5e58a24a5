//! Listener management.
//!
//! Listeners are callbacks bound to one or more query tokens. The manager
//! never invokes a callback directly: [`ListenerManager::collect`] returns a
//! [`Notifications`] batch that the caller fires once every internal borrow
//! has been released.

use crate::change_set::{ChangeOrigin, ChangeSet};
use hashbrown::HashMap;
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use tidal_core::QueryToken;

/// Unique identifier for a listener.
pub type ListenerId = u64;

/// Callback type for change notifications.
pub type ChangeCallback = Box<dyn Fn(&ChangeSet)>;

/// A registered callback.
pub struct Listener {
    /// Unique identifier
    id: ListenerId,
    /// Callback to invoke on changes
    callback: ChangeCallback,
    /// Cleared on removal, so a batch collected earlier skips this listener
    active: Cell<bool>,
}

impl Listener {
    fn new<F>(id: ListenerId, callback: F) -> Self
    where
        F: Fn(&ChangeSet) + 'static,
    {
        Self {
            id,
            callback: Box::new(callback),
            active: Cell::new(true),
        }
    }

    /// Returns the listener ID.
    #[inline]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Returns whether this listener is active.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Notifies this listener of changes.
    pub fn notify(&self, changes: &ChangeSet) {
        if self.is_active() {
            (self.callback)(changes);
        }
    }
}

struct Entry {
    listener: Rc<Listener>,
    tokens: BTreeSet<QueryToken>,
}

/// Tracks listeners and the tokens they watch.
pub struct ListenerManager {
    /// Listeners in registration order
    listeners: BTreeMap<ListenerId, Entry>,
    /// Token -> listeners watching it
    by_token: HashMap<QueryToken, BTreeSet<ListenerId>>,
    /// Listeners watching every token
    everything: BTreeSet<ListenerId>,
    /// Next listener ID to assign
    next_id: ListenerId,
}

impl Default for ListenerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerManager {
    /// Creates a new listener manager.
    pub fn new() -> Self {
        Self {
            listeners: BTreeMap::new(),
            by_token: HashMap::new(),
            everything: BTreeSet::new(),
            next_id: 1,
        }
    }

    /// Registers a listener for the given tokens.
    ///
    /// Returns the listener ID that can be used to remove it.
    pub fn listen<I, F>(&mut self, tokens: I, callback: F) -> ListenerId
    where
        I: IntoIterator<Item = QueryToken>,
        F: Fn(&ChangeSet) + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;

        let tokens: BTreeSet<QueryToken> = tokens.into_iter().collect();
        for token in &tokens {
            self.by_token.entry(token.clone()).or_default().insert(id);
        }
        self.listeners.insert(
            id,
            Entry {
                listener: Rc::new(Listener::new(id, callback)),
                tokens,
            },
        );

        id
    }

    /// Registers a listener for every token, present and future.
    pub fn listen_all<F>(&mut self, callback: F) -> ListenerId
    where
        F: Fn(&ChangeSet) + 'static,
    {
        let id = self.listen(std::iter::empty(), callback);
        self.everything.insert(id);
        id
    }

    /// Binds an additional token to an existing listener.
    ///
    /// Returns false if the listener is unknown or already watches the token.
    pub fn add_token(&mut self, id: ListenerId, token: QueryToken) -> bool {
        let Some(entry) = self.listeners.get_mut(&id) else {
            return false;
        };
        if !entry.tokens.insert(token.clone()) {
            return false;
        }
        self.by_token.entry(token).or_default().insert(id);
        true
    }

    /// Removes a listener by ID.
    ///
    /// Returns true if the listener was found and removed.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let Some(entry) = self.listeners.remove(&id) else {
            return false;
        };
        entry.listener.active.set(false);
        self.everything.remove(&id);
        for token in &entry.tokens {
            if let Some(ids) = self.by_token.get_mut(token) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_token.remove(token);
                }
            }
        }
        true
    }

    /// Returns true if any listener watches the token.
    pub fn is_watched(&self, token: &QueryToken) -> bool {
        !self.everything.is_empty() || self.by_token.contains_key(token)
    }

    /// Returns the tokens a listener watches.
    pub fn tokens_of(&self, id: ListenerId) -> Option<impl Iterator<Item = &QueryToken>> {
        self.listeners.get(&id).map(|e| e.tokens.iter())
    }

    /// Builds the notification batch for a set of changed tokens.
    ///
    /// Each affected listener appears once, with only its own changed tokens,
    /// in registration order.
    pub fn collect<'a, I>(&self, changed: I, origin: ChangeOrigin) -> Notifications
    where
        I: IntoIterator<Item = &'a QueryToken>,
    {
        let mut per_listener: BTreeMap<ListenerId, ChangeSet> = BTreeMap::new();
        for token in changed {
            let ids = self.by_token.get(token).into_iter().flatten();
            for id in ids.chain(&self.everything) {
                per_listener
                    .entry(*id)
                    .or_insert_with(|| ChangeSet::new(origin))
                    .insert(token.clone());
            }
        }

        let pending = per_listener
            .into_iter()
            .filter_map(|(id, changes)| {
                self.listeners
                    .get(&id)
                    .map(|entry| (entry.listener.clone(), changes))
            })
            .collect();
        Notifications { pending }
    }

    /// Returns the number of listeners.
    #[inline]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Returns true if there are no listeners.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Removes every listener.
    pub fn clear(&mut self) {
        for entry in self.listeners.values() {
            entry.listener.active.set(false);
        }
        self.listeners.clear();
        self.by_token.clear();
        self.everything.clear();
    }
}

/// A batch of listener invocations, collected inside a critical section and
/// fired after it.
#[derive(Default)]
#[must_use = "notifications do nothing until fired"]
pub struct Notifications {
    pending: Vec<(Rc<Listener>, ChangeSet)>,
}

impl Notifications {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no listener is due.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns the number of listener invocations in this batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Appends another batch.
    ///
    /// A listener present in both batches is invoked once, with the union of
    /// its changed tokens.
    pub fn merge(&mut self, other: Notifications) {
        for (listener, changes) in other.pending {
            match self
                .pending
                .iter_mut()
                .find(|(existing, _)| existing.id() == listener.id())
            {
                Some((_, existing)) => existing.merge(changes),
                None => self.pending.push((listener, changes)),
            }
        }
    }

    /// Invokes every listener in the batch.
    ///
    /// Listeners removed after the batch was collected are skipped.
    pub fn fire(self) {
        for (listener, changes) in self.pending {
            listener.notify(&changes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tidal_core::{QueryRequest, Timestamp, Value, ValueObject};

    fn token(id: i64) -> QueryToken {
        let mut args = ValueObject::new();
        args.insert("id", Value::Int64(id));
        QueryRequest::new("items:get", Value::Object(args))
            .unwrap()
            .token()
    }

    const ORIGIN: ChangeOrigin = ChangeOrigin::Transition(Timestamp(1));

    #[test]
    fn test_listen_assigns_ids() {
        let mut manager = ListenerManager::new();

        let id1 = manager.listen([token(1)], |_| {});
        let id2 = manager.listen([token(1)], |_| {});

        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert_eq!(manager.len(), 2);
        assert!(manager.is_watched(&token(1)));
    }

    #[test]
    fn test_remove() {
        let mut manager = ListenerManager::new();

        let id = manager.listen([token(1)], |_| {});
        assert!(manager.remove(id));
        assert!(!manager.is_watched(&token(1)));
        assert!(!manager.remove(id)); // Already removed
    }

    #[test]
    fn test_collect_once_per_listener() {
        let mut manager = ListenerManager::new();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        manager.listen([token(1), token(2)], move |changes| {
            seen_clone.borrow_mut().push(changes.len());
        });

        let changed = [token(1), token(2), token(3)];
        let batch = manager.collect(&changed, ORIGIN);
        assert_eq!(batch.len(), 1);
        batch.fire();

        assert_eq!(*seen.borrow(), vec![2]);
    }

    #[test]
    fn test_listen_all_sees_every_token() {
        let mut manager = ListenerManager::new();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        let id = manager.listen_all(move |changes| {
            seen_clone.borrow_mut().push(changes.len());
        });
        assert!(manager.is_watched(&token(7)));

        manager.collect(&[token(1), token(2)], ORIGIN).fire();
        assert_eq!(*seen.borrow(), vec![2]);

        assert!(manager.remove(id));
        assert!(manager.collect(&[token(1)], ORIGIN).is_empty());
        assert!(!manager.is_watched(&token(7)));
    }

    #[test]
    fn test_collect_only_own_tokens() {
        let mut manager = ListenerManager::new();

        let got = Rc::new(RefCell::new(None));
        let got_clone = got.clone();
        manager.listen([token(2)], move |changes| {
            *got_clone.borrow_mut() = Some(changes.clone());
        });

        manager.collect(&[token(1), token(2)], ORIGIN).fire();

        let changes = got.borrow().clone().unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes.contains(&token(2)));
        assert_eq!(changes.origin(), ORIGIN);
    }

    #[test]
    fn test_removed_listener_skipped_after_collect() {
        let mut manager = ListenerManager::new();

        let count = Rc::new(RefCell::new(0));
        let count_clone = count.clone();
        let id = manager.listen([token(1)], move |_| {
            *count_clone.borrow_mut() += 1;
        });

        let batch = manager.collect(&[token(1)], ORIGIN);
        manager.remove(id);
        batch.fire();

        assert_eq!(*count.borrow(), 0);
    }

    #[test]
    fn test_add_token() {
        let mut manager = ListenerManager::new();

        let count = Rc::new(RefCell::new(0));
        let count_clone = count.clone();
        let id = manager.listen([token(1)], move |_| {
            *count_clone.borrow_mut() += 1;
        });

        assert!(manager.add_token(id, token(2)));
        assert!(!manager.add_token(id, token(2)));
        assert!(!manager.add_token(99, token(2)));

        manager.collect(&[token(2)], ORIGIN).fire();
        assert_eq!(*count.borrow(), 1);
        assert_eq!(manager.tokens_of(id).unwrap().count(), 2);
    }

    #[test]
    fn test_merge_notifications() {
        let mut manager = ListenerManager::new();

        let sizes = Rc::new(RefCell::new(Vec::new()));
        let sizes_clone = sizes.clone();
        manager.listen([token(1), token(2)], move |changes| {
            sizes_clone.borrow_mut().push(changes.len());
        });

        let mut batch = manager.collect(&[token(1)], ORIGIN);
        batch.merge(manager.collect(&[token(2)], ORIGIN));
        assert_eq!(batch.len(), 1);
        batch.fire();

        assert_eq!(*sizes.borrow(), vec![2]);
    }

    #[test]
    fn test_clear() {
        let mut manager = ListenerManager::new();

        manager.listen([token(1)], |_| {});
        manager.listen([token(2)], |_| {});

        assert_eq!(manager.len(), 2);
        manager.clear();
        assert!(manager.is_empty());
        assert!(manager.collect(&[token(1)], ORIGIN).is_empty());
    }
}
