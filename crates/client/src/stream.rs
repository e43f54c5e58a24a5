//! Result streams.
//!
//! [`QueryStream`] yields one subscription's composed value each time it
//! changes. [`QuerySetStream`] yields a snapshot of every watched query each
//! time any of them changes. Both coalesce: changes that land between two
//! polls are yielded once, as they stand at the later poll.

use crate::client::{Client, ClientInner, SubscriptionHandle, WatchHandle};
use futures::stream::{Stream, StreamExt};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};
use tidal_core::{Error, FunctionRef, QueryToken, Result, Value};

/// Set by a listener, taken by the stream it feeds.
struct Signal {
    raised: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl Signal {
    /// A raised signal, so the first poll reports the current state.
    fn raised() -> Rc<Self> {
        Rc::new(Self {
            raised: Cell::new(true),
            waker: RefCell::new(None),
        })
    }

    fn raise(&self) {
        self.raised.set(true);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }

    /// Lowers the signal if raised, otherwise parks the task on it.
    fn take(&self, cx: &Context<'_>) -> bool {
        if self.raised.replace(false) {
            return true;
        }
        *self.waker.borrow_mut() = Some(cx.waker().clone());
        false
    }
}

/// The values of one subscription, as they change.
///
/// Yields nothing while the query is loading. Ends when the client is
/// dropped. Dropping the stream unsubscribes.
pub struct QueryStream {
    subscription: SubscriptionHandle,
    _watch: Option<WatchHandle>,
    signal: Rc<Signal>,
}

impl QueryStream {
    #[inline]
    pub fn token(&self) -> &QueryToken {
        self.subscription.token()
    }
}

impl SubscriptionHandle {
    /// Turns the subscription into a stream of its composed values.
    ///
    /// A value already loaded is yielded first.
    pub fn into_stream(self) -> QueryStream {
        let signal = Signal::raised();
        let watch = self.client().map(|client| {
            let raised = signal.clone();
            client.watch([self.token().clone()], move |_| raised.raise())
        });
        QueryStream {
            subscription: self,
            _watch: watch,
            signal,
        }
    }
}

impl Stream for QueryStream {
    type Item = Result<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.subscription.inner() else {
            return Poll::Ready(None);
        };
        let _ = inner.poll_exchanges(cx);
        while this.signal.take(cx) {
            let current = inner.state.borrow().peek(this.subscription.token());
            match current {
                Ok(Some(value)) => return Poll::Ready(Some(Ok(value))),
                // Still loading.
                Ok(None) => continue,
                Err(error) => return Poll::Ready(Some(Err(error))),
            }
        }
        Poll::Pending
    }
}

/// The composed results of every watched query at one point in time.
///
/// Queries still loading are absent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuerySetSnapshot {
    results: BTreeMap<QueryToken, Result<Value>>,
}

impl QuerySetSnapshot {
    fn capture(inner: &ClientInner) -> Self {
        let state = inner.state.borrow();
        let mut results = BTreeMap::new();
        for token in state.registry.watched() {
            match state.peek(&token) {
                Ok(Some(value)) => {
                    results.insert(token, Ok(value));
                }
                Ok(None) => {}
                Err(error) => {
                    results.insert(token, Err(error));
                }
            }
        }
        Self { results }
    }

    pub fn get(&self, token: &QueryToken) -> Option<&Result<Value>> {
        self.results.get(token)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Results in token order.
    pub fn iter(&self) -> impl Iterator<Item = (&QueryToken, &Result<Value>)> {
        self.results.iter()
    }
}

/// Snapshots of the whole query set, as it changes.
///
/// The first poll yields the current snapshot. Ends when the client is
/// dropped.
pub struct QuerySetStream {
    client: Weak<ClientInner>,
    _watch: WatchHandle,
    signal: Rc<Signal>,
}

impl Stream for QuerySetStream {
    type Item = QuerySetSnapshot;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.client.upgrade() else {
            return Poll::Ready(None);
        };
        let _ = inner.poll_exchanges(cx);
        if this.signal.take(cx) {
            return Poll::Ready(Some(QuerySetSnapshot::capture(&inner)));
        }
        Poll::Pending
    }
}

impl Client {
    /// Runs a query once: subscribes, waits for its first result, and
    /// unsubscribes.
    ///
    /// A result already cached, confirmed or optimistic, is returned at once.
    pub async fn query(&self, function: impl Into<FunctionRef>, args: Value) -> Result<Value> {
        let mut results = self.subscribe(function, args)?.into_stream();
        results.next().await.unwrap_or(Err(Error::ClientGone))
    }

    /// Streams snapshots of every watched query.
    pub fn watch_all(&self) -> QuerySetStream {
        let signal = Signal::raised();
        let raised = signal.clone();
        let watch = self.watch_any(move |_| raised.raise());
        QuerySetStream {
            client: Rc::downgrade(&self.inner),
            _watch: watch,
            signal,
        }
    }
}
