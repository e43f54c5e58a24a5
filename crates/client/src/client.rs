//! The client.
//!
//! A [`Client`] owns the result store, the optimistic update queue, the
//! transition dispatcher and the subscription registry of one connection.
//! All of it lives behind a single `RefCell`: every public operation borrows
//! it for one synchronous critical section, releases it, and only then calls
//! the transport or fires listeners. Listeners can therefore call back into
//! the client freely.
//!
//! Backend exchanges (subscribe acknowledgements and mutation responses) are
//! collected in a `FuturesUnordered` owned by the client, next to background
//! timers. They make progress whenever the client is driven through
//! [`Client::flush_exchanges`] or [`Client::drive`], or while a
//! [`MutationCall`](crate::MutationCall) or a result stream is awaited. Every
//! task polling them is woken when any of them can progress.

use crate::config::ClientConfig;
use crate::registry::{AckAction, Acquired, Issue, Released, SubscriptionRegistry};
use crate::transport::{ConnectionState, Transport};
use futures::future::{FutureExt, LocalBoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::task::{waker, ArcWake};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::{poll_fn, Future};
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};
use tidal_core::{
    ArgLimits, ConfigError, Cursor, Error, FunctionRef, Ordinal, QueryRequest, QueryToken,
    Result, Timestamp, TransportError, Value,
};
use tidal_reactive::{
    ChangeSet, ListenerId, LocalResultStore, OptimisticUpdateQueue, QueryResult, Transition,
    TransitionDispatcher,
};
use tracing::{debug, info, warn};

type ConnectionCallback = Rc<dyn Fn(&ConnectionState)>;

/// Everything mutated inside a critical section.
pub(crate) struct ClientState {
    pub(crate) store: LocalResultStore,
    pub(crate) queue: OptimisticUpdateQueue,
    pub(crate) dispatcher: TransitionDispatcher,
    pub(crate) registry: SubscriptionRegistry,
    connection: ConnectionState,
    connection_watchers: BTreeMap<u64, ConnectionCallback>,
    next_connection_watcher: u64,
}

impl ClientState {
    fn new(config: &ClientConfig) -> Self {
        Self {
            store: LocalResultStore::new(),
            queue: OptimisticUpdateQueue::with_limits(config.arg_limits()),
            dispatcher: TransitionDispatcher::new(config.settlement_policy),
            registry: SubscriptionRegistry::new(),
            connection: ConnectionState::default(),
            connection_watchers: BTreeMap::new(),
            next_connection_watcher: 1,
        }
    }

    /// Returns the composed value of a token.
    pub(crate) fn peek(&self, token: &QueryToken) -> Result<Option<Value>> {
        match self.queue.composed(&self.store, token) {
            None => Ok(None),
            Some(QueryResult::Value(value)) => Ok(Some(value.clone())),
            Some(QueryResult::Error(error)) => Err(Error::Execution(error.clone())),
        }
    }

    /// Drops cached results nobody watches and no patch touches, and
    /// registry entries whose backend subscription is gone.
    pub(crate) fn purge_unwatched(&mut self) {
        for token in self.registry.unwatched() {
            if self.queue.touches(&token) {
                continue;
            }
            if self.store.remove(&token).is_some() {
                debug!(token = %token, "purged unwatched query");
            }
            self.registry.forget(&token);
        }
    }
}

/// Tasks polling the exchanges since the last wake-up.
#[derive(Default)]
struct Waiters {
    wakers: Mutex<Vec<Waker>>,
}

impl Waiters {
    fn register(&self, waker: &Waker) {
        let mut wakers = self.wakers.lock().unwrap_or_else(PoisonError::into_inner);
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }
}

impl ArcWake for Waiters {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let wakers = std::mem::take(&mut *arc_self.wakers.lock().unwrap_or_else(PoisonError::into_inner));
        for waker in wakers {
            waker.wake();
        }
    }
}

pub(crate) struct ClientInner {
    pub(crate) state: RefCell<ClientState>,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) config: ClientConfig,
    limits: ArgLimits,
    /// Tasks spawned since the last poll
    incoming: RefCell<Vec<LocalBoxFuture<'static, ()>>>,
    tasks: RefCell<FuturesUnordered<LocalBoxFuture<'static, ()>>>,
    /// Exchanges among `tasks`; timers are not counted
    in_flight: Rc<Cell<usize>>,
    waiters: Arc<Waiters>,
    /// Wakes every waiter; handed to `tasks` on each poll
    waker: Waker,
    next_ordinal: Cell<Ordinal>,
    next_session: Cell<u64>,
}

impl ClientInner {
    pub(crate) fn request(&self, function: impl Into<FunctionRef>, args: Value) -> Result<QueryRequest> {
        Ok(QueryRequest::with_limits(function, args, &self.limits)?)
    }

    pub(crate) fn next_ordinal(&self) -> Ordinal {
        let ordinal = self.next_ordinal.get();
        self.next_ordinal.set(ordinal.next());
        ordinal
    }

    pub(crate) fn next_session(&self) -> u64 {
        let session = self.next_session.get();
        self.next_session.set(session + 1);
        session
    }

    /// Runs a backend exchange.
    pub(crate) fn spawn(&self, exchange: impl Future<Output = ()> + 'static) {
        let in_flight = self.in_flight.clone();
        in_flight.set(in_flight.get() + 1);
        self.schedule(async move {
            exchange.await;
            in_flight.set(in_flight.get() - 1);
        });
    }

    /// Runs a background timer. Flushing does not wait for it.
    pub(crate) fn spawn_timer(&self, timer: impl Future<Output = ()> + 'static) {
        self.schedule(timer);
    }

    fn schedule(&self, task: impl Future<Output = ()> + 'static) {
        self.incoming.borrow_mut().push(task.boxed_local());
        self.waker.wake_by_ref();
    }

    /// Polls every exchange and timer. Ready once no exchange is left.
    ///
    /// The calling task is woken whenever any of them can progress, even if
    /// another task polls them in between.
    pub(crate) fn poll_exchanges(&self, cx: &mut Context<'_>) -> Poll<()> {
        self.waiters.register(cx.waker());
        let Ok(mut tasks) = self.tasks.try_borrow_mut() else {
            // Already being polled further up the stack.
            return Poll::Pending;
        };
        let mut shared = Context::from_waker(&self.waker);
        loop {
            tasks.extend(self.incoming.borrow_mut().drain(..));
            let polled = tasks.poll_next_unpin(&mut shared);
            if !self.incoming.borrow().is_empty() {
                continue;
            }
            match polled {
                Poll::Ready(Some(())) => continue,
                _ if self.in_flight.get() == 0 => return Poll::Ready(()),
                _ => return Poll::Pending,
            }
        }
    }

    /// Adds a watcher for a validated query and returns its token.
    pub(crate) fn acquire(self: &Rc<Self>, request: QueryRequest, cursor: Option<Cursor>) -> QueryToken {
        let token = request.token();
        let acquired = {
            let mut state = self.state.borrow_mut();
            let acquired = state.registry.acquire(&token, cursor);
            state.store.insert_query(token.clone(), request);
            acquired
        };
        match acquired {
            Acquired::Subscribe { issue, fresh } => {
                debug!(token = %token, fresh, cursor = ?issue.cursor, "subscribing");
                self.start_subscribe(issue);
            }
            Acquired::Revived => debug!(token = %token, "revived subscription"),
            Acquired::Deduplicated => debug!(token = %token, "deduplicated subscription"),
        }
        token
    }

    /// Removes a watcher.
    pub(crate) fn release(&self, token: &QueryToken) {
        let released = {
            let mut state = self.state.borrow_mut();
            let released = state.registry.release(token);
            if let Released::Last { .. } = released {
                state.purge_unwatched();
            }
            released
        };
        match released {
            Released::Last { teardown: true } => {
                debug!(token = %token, "tearing down subscription");
                self.transport.unsubscribe(token);
            }
            Released::Last { teardown: false } => {
                debug!(token = %token, "teardown deferred until subscribe completes");
            }
            Released::Remaining(watchers) => {
                debug!(token = %token, watchers, "released watcher");
            }
            Released::Unknown => {}
        }
    }

    fn start_subscribe(self: &Rc<Self>, issue: Issue) {
        let request = match self.state.borrow().store.get(&issue.token) {
            Some(query) => query.request().clone(),
            None => return,
        };
        let Issue {
            token,
            generation,
            cursor,
        } = issue;
        let ack = self.transport.subscribe(&token, &request, cursor);
        let client = Rc::downgrade(self);
        self.spawn(async move {
            let result = ack.await;
            if let Some(inner) = client.upgrade() {
                inner.on_subscribed(token, generation, result);
            }
        });
    }

    fn on_subscribed(
        &self,
        token: QueryToken,
        generation: u64,
        result: std::result::Result<Option<Cursor>, TransportError>,
    ) {
        if let Err(error) = &result {
            warn!(token = %token, error = %error, "subscribe failed");
        }
        let action = {
            let mut state = self.state.borrow_mut();
            let action = state
                .registry
                .acknowledge(&token, generation, result.map_err(|_| ()));
            if action == AckAction::Teardown {
                state.purge_unwatched();
            }
            action
        };
        match action {
            AckAction::Live => debug!(token = %token, "subscription live"),
            AckAction::Teardown => {
                debug!(token = %token, "tearing down subscription after acknowledgement");
                self.transport.unsubscribe(&token);
            }
            AckAction::Ignore => {}
        }
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) {
        self.state.borrow_mut().dispatcher.listeners_mut().remove(id);
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // Lets a pending `drive` observe that the client is gone.
        self.waker.wake_by_ref();
    }
}

/// Options for [`Client::subscribe_with`].
#[derive(Clone, Debug, Default)]
pub struct SubscribeOptions {
    /// Resumption cursor, used only if the query is not subscribed yet
    pub cursor: Option<Cursor>,
}

/// Client for a reactive query backend.
///
/// Cloning is cheap and yields another handle to the same client.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Rc<ClientInner>,
}

impl Client {
    /// Creates a client with the default configuration.
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::build(Box::new(transport), ClientConfig::default())
    }

    /// Creates a client with the given configuration.
    pub fn with_config(
        transport: impl Transport + 'static,
        config: ClientConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(Box::new(transport), config))
    }

    fn build(transport: Box<dyn Transport>, config: ClientConfig) -> Self {
        let waiters = Arc::new(Waiters::default());
        Self {
            inner: Rc::new(ClientInner {
                state: RefCell::new(ClientState::new(&config)),
                transport,
                limits: config.arg_limits(),
                config,
                incoming: RefCell::new(Vec::new()),
                tasks: RefCell::new(FuturesUnordered::new()),
                in_flight: Rc::new(Cell::new(0)),
                waker: waker(waiters.clone()),
                waiters,
                next_ordinal: Cell::new(Ordinal(1)),
                next_session: Cell::new(1),
            }),
        }
    }

    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Subscribes to a query.
    ///
    /// Malformed arguments fail here, before anything is sent. Subscribing
    /// to a query that is already subscribed shares its backend
    /// subscription.
    pub fn subscribe(&self, function: impl Into<FunctionRef>, args: Value) -> Result<SubscriptionHandle> {
        self.subscribe_with(function, args, SubscribeOptions::default())
    }

    /// Subscribes to a query with explicit options.
    pub fn subscribe_with(
        &self,
        function: impl Into<FunctionRef>,
        args: Value,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        let request = self.inner.request(function, args)?;
        Ok(self.subscribe_request(request, options))
    }

    pub(crate) fn subscribe_request(&self, request: QueryRequest, options: SubscribeOptions) -> SubscriptionHandle {
        let token = self.inner.acquire(request, options.cursor);
        SubscriptionHandle {
            client: Rc::downgrade(&self.inner),
            token,
            active: true,
        }
    }

    /// Returns the composed value of a query by token.
    ///
    /// `Ok(None)` means the query is unknown or still loading. A query
    /// whose result is an execution error returns that error.
    pub fn peek(&self, token: &QueryToken) -> Result<Option<Value>> {
        self.inner.state.borrow().peek(token)
    }

    /// Returns the composed value of a query, without subscribing to it.
    pub fn local_result(&self, function: impl Into<FunctionRef>, args: Value) -> Result<Option<Value>> {
        let token = self.inner.request(function, args)?.token();
        self.peek(&token)
    }

    /// Calls `on_change` whenever the composed value of any of `tokens`
    /// changes, at most once per change.
    pub fn watch<I, F>(&self, tokens: I, on_change: F) -> WatchHandle
    where
        I: IntoIterator<Item = QueryToken>,
        F: Fn(&ChangeSet) + 'static,
    {
        let id = self
            .inner
            .state
            .borrow_mut()
            .dispatcher
            .listeners_mut()
            .listen(tokens, on_change);
        WatchHandle {
            client: Rc::downgrade(&self.inner),
            id,
        }
    }

    /// Calls `on_change` whenever the composed value of any query changes.
    pub fn watch_any<F>(&self, on_change: F) -> WatchHandle
    where
        F: Fn(&ChangeSet) + 'static,
    {
        let id = self
            .inner
            .state
            .borrow_mut()
            .dispatcher
            .listeners_mut()
            .listen_all(on_change);
        WatchHandle {
            client: Rc::downgrade(&self.inner),
            id,
        }
    }

    /// Subscribes to a query and watches it.
    pub fn watch_query<F>(&self, function: impl Into<FunctionRef>, args: Value, on_change: F) -> Result<QueryWatch>
    where
        F: Fn(&ChangeSet) + 'static,
    {
        let subscription = self.subscribe(function, args)?;
        let watch = self.watch([subscription.token().clone()], on_change);
        Ok(QueryWatch {
            subscription,
            _watch: watch,
        })
    }

    /// Applies a transition pushed by the transport.
    pub fn deliver(&self, transition: Transition) {
        let notifications = {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            let applied = state
                .dispatcher
                .apply_transition(&mut state.store, &mut state.queue, transition);
            for (token, cursor) in applied.cursors {
                state.registry.set_cursor(&token, cursor);
            }
            if !applied.settled.is_empty() {
                state.purge_unwatched();
            }
            applied.notifications
        };
        notifications.fire();
    }

    /// Records a connection state change reported by the transport.
    ///
    /// Going from disconnected to connected re-issues every watched
    /// subscription from its stored cursor. Cached results are kept.
    pub fn set_connection_state(&self, new: ConnectionState) {
        let (issues, watchers) = {
            let mut state = self.inner.state.borrow_mut();
            let previous = std::mem::replace(&mut state.connection, new.clone());
            if previous == new {
                return;
            }
            let reconnected =
                matches!(previous, ConnectionState::Disconnected { .. }) && new.is_connected();
            let issues = if reconnected {
                let issues = state.registry.reissue_watched();
                state.purge_unwatched();
                issues
            } else {
                Vec::new()
            };
            let watchers: Vec<ConnectionCallback> =
                state.connection_watchers.values().cloned().collect();
            (issues, watchers)
        };

        match &new {
            ConnectionState::Disconnected { reason } => warn!(reason = %reason, "connection lost"),
            ConnectionState::Connected => info!(resubscribed = issues.len(), "connected"),
            ConnectionState::Connecting => debug!("connecting"),
        }
        for issue in issues {
            self.inner.start_subscribe(issue);
        }
        for watcher in watchers {
            watcher(&new);
        }
    }

    /// Returns the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.borrow().connection.clone()
    }

    /// Calls `on_change` on every connection state change.
    pub fn watch_connection<F>(&self, on_change: F) -> ConnectionWatch
    where
        F: Fn(&ConnectionState) + 'static,
    {
        let mut state = self.inner.state.borrow_mut();
        let id = state.next_connection_watcher;
        state.next_connection_watcher += 1;
        state.connection_watchers.insert(id, Rc::new(on_change));
        ConnectionWatch {
            client: Rc::downgrade(&self.inner),
            id,
        }
    }

    /// Returns the highest transition timestamp applied so far.
    pub fn max_observed_timestamp(&self) -> Option<Timestamp> {
        self.inner.state.borrow().dispatcher.max_observed_ts()
    }

    /// Returns the number of watchers of a token.
    pub fn subscriber_count(&self, token: &QueryToken) -> usize {
        self.inner.state.borrow().registry.refcount(token)
    }

    /// Returns the number of optimistic patches not yet retired.
    pub fn pending_optimistic_updates(&self) -> usize {
        self.inner.state.borrow().queue.len()
    }

    /// Drives backend exchanges until none is in flight.
    ///
    /// Timers, such as prewarm expiry, advance meanwhile but are not waited
    /// for.
    pub fn flush_exchanges(&self) -> impl Future<Output = ()> + '_ {
        poll_fn(move |cx| self.inner.poll_exchanges(cx))
    }

    /// Drives backend exchanges until the client is dropped.
    ///
    /// Meant to be spawned on a local executor next to the transport.
    pub fn drive(&self) -> impl Future<Output = ()> + 'static {
        let client = Rc::downgrade(&self.inner);
        poll_fn(move |cx| {
            let Some(inner) = client.upgrade() else {
                return Poll::Ready(());
            };
            let _ = inner.poll_exchanges(cx);
            Poll::Pending
        })
    }
}

/// A subscription to one query.
///
/// Dropping the handle unsubscribes.
pub struct SubscriptionHandle {
    client: Weak<ClientInner>,
    token: QueryToken,
    active: bool,
}

impl SubscriptionHandle {
    #[inline]
    pub fn token(&self) -> &QueryToken {
        &self.token
    }

    pub(crate) fn inner(&self) -> Option<Rc<ClientInner>> {
        self.client.upgrade()
    }

    pub(crate) fn client(&self) -> Option<Client> {
        self.inner().map(|inner| Client { inner })
    }

    /// Returns the query's composed value, as [`Client::peek`].
    pub fn peek(&self) -> Result<Option<Value>> {
        let inner = self.client.upgrade().ok_or(Error::ClientGone)?;
        let state = inner.state.borrow();
        state.peek(&self.token)
    }

    /// Unsubscribes. Calling it again, or dropping the handle afterwards,
    /// does nothing.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.client.upgrade() {
            inner.release(&self.token);
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("token", &self.token)
            .field("active", &self.active)
            .finish()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// A registered change listener. Dropping it stops notifications.
pub struct WatchHandle {
    client: Weak<ClientInner>,
    id: ListenerId,
}

impl WatchHandle {
    #[inline]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Stops notifications.
    pub fn unwatch(self) {}
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.client.upgrade() {
            inner.remove_listener(self.id);
        }
    }
}

/// A subscription together with a listener on it.
pub struct QueryWatch {
    subscription: SubscriptionHandle,
    _watch: WatchHandle,
}

impl QueryWatch {
    #[inline]
    pub fn token(&self) -> &QueryToken {
        self.subscription.token()
    }

    pub fn peek(&self) -> Result<Option<Value>> {
        self.subscription.peek()
    }
}

/// A registered connection listener. Dropping it stops notifications.
pub struct ConnectionWatch {
    client: Weak<ClientInner>,
    id: u64,
}

impl Drop for ConnectionWatch {
    fn drop(&mut self) {
        if let Some(inner) = self.client.upgrade() {
            inner.state.borrow_mut().connection_watchers.remove(&self.id);
        }
    }
}
