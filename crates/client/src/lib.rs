//! Tidal Client - Reactive subscriptions and optimistic mutations.
//!
//! This crate ties the result store, the optimistic update queue and the
//! transition dispatcher from `tidal-reactive` to a backend connection.
//!
//! # Core Concepts
//!
//! - `Client`: Owns one connection's local state and its backend exchanges
//! - `Transport`: The seam to the network; carries subscribe, unsubscribe and mutate
//! - `SubscriptionRegistry`: Reference-counted subscriptions, deduplicated by token
//! - `MutationCall`: A mutation in flight, optionally with an optimistic update
//! - `PaginatedQuery`: A chain of page subscriptions stitched by cursors
//! - `Prewarm`: A subscription held for a short TTL ahead of use
//! - `QueryStream`: A subscription's values as a `Stream`
//!
//! # Example
//!
//! ```
//! use futures::executor::block_on;
//! use futures::future::{ready, FutureExt, LocalBoxFuture};
//! use tidal_client::{Client, MutationOptions, MutationRequest, MutationResponse, Transport};
//! use tidal_core::{Cursor, QueryRequest, QueryToken, Timestamp, TransportError, Value};
//! use tidal_reactive::Transition;
//!
//! struct Accepting;
//!
//! impl Transport for Accepting {
//!     fn subscribe(
//!         &self,
//!         _token: &QueryToken,
//!         _request: &QueryRequest,
//!         _cursor: Option<Cursor>,
//!     ) -> LocalBoxFuture<'static, Result<Option<Cursor>, TransportError>> {
//!         ready(Ok(None)).boxed_local()
//!     }
//!
//!     fn unsubscribe(&self, _token: &QueryToken) {}
//!
//!     fn mutate(
//!         &self,
//!         _request: MutationRequest,
//!     ) -> LocalBoxFuture<'static, Result<MutationResponse, TransportError>> {
//!         ready(Ok(MutationResponse::success(Value::Null, Timestamp(2)))).boxed_local()
//!     }
//! }
//!
//! let client = Client::new(Accepting);
//! let counter = client.subscribe("counter:get", Value::Object(Default::default())).unwrap();
//! client.deliver(Transition::new(Timestamp(1)).updated(counter.token().clone(), 5i64));
//!
//! let options = MutationOptions::new()
//!     .optimistic_update(|view| {
//!         let current = view.get("counter:get", Value::Object(Default::default()))?;
//!         let next = current.and_then(|v| v.as_i64()).unwrap_or(0) + 1;
//!         view.set("counter:get", Value::Object(Default::default()), Value::Int64(next))?;
//!         Ok(())
//!     })
//!     .unwrap();
//! let call = client.mutation("counter:increment", Value::Object(Default::default()), options);
//!
//! // The patch is visible before the backend answers.
//! assert_eq!(counter.peek().unwrap(), Some(Value::Int64(6)));
//!
//! block_on(call).unwrap();
//! client.deliver(Transition::new(Timestamp(2)).updated(counter.token().clone(), 6i64));
//! assert_eq!(client.pending_optimistic_updates(), 0);
//! ```

mod client;
pub mod config;
mod mutation;
mod pagination;
mod prewarm;
pub mod registry;
mod stream;
pub mod transport;

pub use client::{Client, ConnectionWatch, QueryWatch, SubscribeOptions, SubscriptionHandle, WatchHandle};
pub use config::{ClientConfig, DEFAULT_PAGE_SIZE, DEFAULT_PREWARM_TTL};
pub use mutation::{MutationCall, MutationOptions};
pub use pagination::{
    insert_at_top, update_paginated_items, PaginatedQuery, PaginatedView, PaginationOptions,
    PaginationStatus, PAGINATION_OPTS,
};
pub use prewarm::Prewarm;
pub use registry::{AckAction, Acquired, BackendState, Issue, Released, SubscriptionRegistry};
pub use stream::{QuerySetSnapshot, QuerySetStream, QueryStream};
pub use transport::{ConnectionState, MutationRequest, MutationResponse, Transport};
