//! Tidal Reactive - Result store, optimistic updates and transition dispatch.
//!
//! This crate holds the client engine's synchronous core. Nothing in here
//! performs I/O or awaits; every operation runs to completion against
//! borrowed state and hands back a batch of listener notifications for the
//! caller to fire.
//!
//! # Core Concepts
//!
//! - `LocalResultStore`: Latest confirmed result per query token
//! - `OptimisticUpdateQueue`: Speculative patches layered over the store, in mutation order
//! - `Transition`: An atomic batch of confirmed results from the backend
//! - `TransitionDispatcher`: Applies transitions, settles patches, decides who to notify
//! - `ListenerManager`: Callbacks bound to tokens
//!
//! # Example
//!
//! ```
//! use tidal_core::{Ordinal, QueryRequest, Timestamp, Value};
//! use tidal_reactive::{
//!     update_fn, LocalResultStore, OptimisticUpdateQueue, Transition, TransitionDispatcher,
//! };
//!
//! let query = QueryRequest::new("counter:get", Value::Object(Default::default())).unwrap();
//! let token = query.token();
//!
//! let mut store = LocalResultStore::new();
//! let mut queue = OptimisticUpdateQueue::new();
//! let mut dispatcher = TransitionDispatcher::default();
//! store.insert_query(token.clone(), query);
//!
//! let applied = dispatcher.apply_transition(
//!     &mut store,
//!     &mut queue,
//!     Transition::new(Timestamp(1)).updated(token.clone(), 5i64),
//! );
//! applied.notifications.fire();
//!
//! let bump = update_fn(|view| {
//!     view.set("counter:get", Value::Object(Default::default()), Value::Int64(6))?;
//!     Ok(())
//! });
//! dispatcher.enqueue(&store, &mut queue, Ordinal(1), bump).unwrap().fire();
//!
//! let composed = queue.composed(&store, &token).and_then(|r| r.value()).cloned();
//! assert_eq!(composed, Some(Value::Int64(6)));
//! ```

pub mod change_set;
pub mod listener;
pub mod notify;
pub mod optimistic;
pub mod store;
pub mod transition;

pub use change_set::{ChangeOrigin, ChangeSet};
pub use listener::{ChangeCallback, Listener, ListenerId, ListenerManager, Notifications};
pub use notify::{Applied, SettlementPolicy, TransitionDispatcher};
pub use optimistic::{
    update_fn, ComposedSnapshot, LocalQuery, OptimisticLocalStore, OptimisticUpdateQueue,
    Settlement, UpdateFn,
};
pub use store::{LocalResultStore, QueryResult, StoredQuery};
pub use transition::{QueryModification, Transition};
