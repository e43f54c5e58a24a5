//! Mutations and their optimistic updates.

use crate::client::{Client, ClientInner};
use crate::transport::{MutationRequest, MutationResponse};
use futures::channel::oneshot;
use futures::future::{ready, FutureExt, Ready};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use tidal_core::{
    ConfigError, Error, FunctionRef, OptimisticUpdateError, Ordinal, Result, TransportError, Value,
};
use tidal_reactive::{update_fn, OptimisticLocalStore, UpdateFn};
use tracing::{debug, warn};

/// Options for [`Client::mutation`].
#[derive(Clone, Default)]
pub struct MutationOptions {
    optimistic_update: Option<UpdateFn>,
}

impl MutationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an optimistic update.
    ///
    /// The function runs against the composed view right away, and again
    /// whenever the patches below it change, until the mutation settles. It
    /// must be pure. A mutation takes at most one optimistic update.
    pub fn optimistic_update<F>(mut self, update: F) -> std::result::Result<Self, ConfigError>
    where
        F: Fn(&mut OptimisticLocalStore<'_>) -> std::result::Result<(), OptimisticUpdateError>
            + 'static,
    {
        if self.optimistic_update.is_some() {
            return Err(ConfigError::DuplicateOptimisticUpdate);
        }
        self.optimistic_update = Some(update_fn(update));
        Ok(self)
    }

    #[inline]
    pub fn has_optimistic_update(&self) -> bool {
        self.optimistic_update.is_some()
    }
}

impl fmt::Debug for MutationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("optimistic_update", &self.optimistic_update.is_some())
            .finish()
    }
}

enum CallState {
    Done(Ready<Result<Value>>),
    Waiting(oneshot::Receiver<Result<Value>>),
}

/// A mutation in flight.
///
/// Resolves to the mutation's return value. Awaiting it also drives the
/// client's other backend exchanges.
#[must_use = "a mutation's outcome is only observed by awaiting it"]
pub struct MutationCall {
    client: Weak<ClientInner>,
    ordinal: Option<Ordinal>,
    state: CallState,
}

impl MutationCall {
    fn done(client: Weak<ClientInner>, ordinal: Option<Ordinal>, result: Result<Value>) -> Self {
        Self {
            client,
            ordinal,
            state: CallState::Done(ready(result)),
        }
    }

    /// The mutation's ordinal, unless it failed validation.
    #[inline]
    pub fn ordinal(&self) -> Option<Ordinal> {
        self.ordinal
    }
}

impl Future for MutationCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let rx = match &mut this.state {
            CallState::Done(result) => return result.poll_unpin(cx),
            CallState::Waiting(rx) => rx,
        };
        if let Poll::Ready(result) = rx.poll_unpin(cx) {
            return Poll::Ready(result.unwrap_or(Err(Error::ClientGone)));
        }
        let Some(inner) = this.client.upgrade() else {
            return Poll::Ready(Err(Error::ClientGone));
        };
        let _ = inner.poll_exchanges(cx);
        drop(inner);
        rx.poll_unpin(cx)
            .map(|result| result.unwrap_or(Err(Error::ClientGone)))
    }
}

impl Client {
    /// Invokes a mutation.
    ///
    /// Arguments are validated first; a malformed call resolves to an error
    /// without reaching the transport. An attached optimistic update is
    /// applied before this returns, so watchers see its effect
    /// immediately. It is rolled back if the mutation fails, and retired
    /// once the mutation's commit is reflected in a transition.
    pub fn mutation(
        &self,
        function: impl Into<FunctionRef>,
        args: Value,
        options: MutationOptions,
    ) -> MutationCall {
        let client = Rc::downgrade(&self.inner);
        let request = match self.inner.request(function, args) {
            Ok(request) => request,
            Err(err) => return MutationCall::done(client, None, Err(err)),
        };
        let ordinal = self.inner.next_ordinal();

        if let Some(update) = options.optimistic_update {
            let enqueued = {
                let mut guard = self.inner.state.borrow_mut();
                let state = &mut *guard;
                state
                    .dispatcher
                    .enqueue(&state.store, &mut state.queue, ordinal, update)
            };
            match enqueued {
                Ok(notifications) => notifications.fire(),
                Err(err) => {
                    debug!(ordinal = %ordinal, error = %err, "optimistic update rejected");
                    return MutationCall::done(client, Some(ordinal), Err(err.into()));
                }
            }
        }

        debug!(ordinal = %ordinal, path = %request.path(), "sending mutation");
        let response = self.inner.transport.mutate(MutationRequest {
            path: request.path().clone(),
            args: request.args().clone(),
            ordinal,
        });

        let (tx, rx) = oneshot::channel();
        let exchange_client = client.clone();
        self.inner.spawn(async move {
            let response = response.await;
            let result = match exchange_client.upgrade() {
                Some(inner) => inner.on_mutation_response(ordinal, response),
                None => Err(Error::ClientGone),
            };
            let _ = tx.send(result);
        });

        MutationCall {
            client,
            ordinal: Some(ordinal),
            state: CallState::Waiting(rx),
        }
    }
}

impl ClientInner {
    fn on_mutation_response(
        &self,
        ordinal: Ordinal,
        response: std::result::Result<MutationResponse, TransportError>,
    ) -> Result<Value> {
        match response {
            Ok(MutationResponse {
                outcome: Ok(value),
                commit_ts,
            }) => {
                let notifications = {
                    let mut guard = self.state.borrow_mut();
                    let state = &mut *guard;
                    let notifications =
                        state
                            .dispatcher
                            .confirm(&state.store, &mut state.queue, ordinal, commit_ts);
                    state.purge_unwatched();
                    notifications
                };
                notifications.fire();
                Ok(value)
            }
            Ok(MutationResponse {
                outcome: Err(error),
                ..
            }) => {
                debug!(ordinal = %ordinal, error = %error, "mutation failed");
                self.roll_back(ordinal);
                Err(Error::Execution(error))
            }
            Err(error) => {
                warn!(ordinal = %ordinal, error = %error, "mutation lost");
                self.roll_back(ordinal);
                Err(Error::Transport(error))
            }
        }
    }

    fn roll_back(&self, ordinal: Ordinal) {
        let notifications = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let notifications = state
                .dispatcher
                .rollback(&state.store, &mut state.queue, ordinal);
            state.purge_unwatched();
            notifications
        };
        if let Some(notifications) = notifications {
            notifications.fire();
        }
    }
}
