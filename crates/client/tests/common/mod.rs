//! Shared fixtures for client integration tests.

#![allow(dead_code)]

use futures::channel::oneshot;
use futures::future::{ready, FutureExt, LocalBoxFuture};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tidal_client::{MutationRequest, MutationResponse, Transport};
use tidal_core::{Cursor, Ordinal, QueryRequest, QueryToken, TransportError, Value};

type AckSender = oneshot::Sender<Result<Option<Cursor>, TransportError>>;
type ResponseSender = oneshot::Sender<Result<MutationResponse, TransportError>>;

#[derive(Default)]
struct MockState {
    manual_acks: bool,
    subscribes: Vec<(QueryToken, QueryRequest, Option<Cursor>)>,
    unsubscribes: Vec<QueryToken>,
    pending_acks: Vec<(QueryToken, AckSender)>,
    mutations: Vec<MutationRequest>,
    pending_mutations: BTreeMap<Ordinal, ResponseSender>,
}

/// In-memory transport. Subscribes are acknowledged at once unless manual
/// acknowledgement is switched on; mutations wait for [`respond`].
///
/// [`respond`]: MockTransport::respond
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes stay pending until [`ack`](Self::ack) is called.
    pub fn manual_acks() -> Self {
        let transport = Self::default();
        transport.state.borrow_mut().manual_acks = true;
        transport
    }

    /// Every subscribe sent so far, in order.
    pub fn subscribes(&self) -> Vec<(QueryToken, Option<Cursor>)> {
        self.state
            .borrow()
            .subscribes
            .iter()
            .map(|(t, _, c)| (t.clone(), c.clone()))
            .collect()
    }

    /// The request of the most recent subscribe for `token`.
    pub fn request_of(&self, token: &QueryToken) -> Option<QueryRequest> {
        self.state
            .borrow()
            .subscribes
            .iter()
            .rev()
            .find(|(t, _, _)| t == token)
            .map(|(_, r, _)| r.clone())
    }

    pub fn subscribe_count(&self, token: &QueryToken) -> usize {
        self.state
            .borrow()
            .subscribes
            .iter()
            .filter(|(t, _, _)| t == token)
            .count()
    }

    pub fn unsubscribes(&self) -> Vec<QueryToken> {
        self.state.borrow().unsubscribes.clone()
    }

    /// Acknowledges the oldest pending subscribe for `token`.
    pub fn ack(&self, token: &QueryToken, result: Result<Option<Cursor>, TransportError>) {
        let sender = {
            let mut state = self.state.borrow_mut();
            let index = state
                .pending_acks
                .iter()
                .position(|(t, _)| t == token)
                .expect("no pending subscribe for token");
            state.pending_acks.remove(index).1
        };
        let _ = sender.send(result);
    }

    pub fn mutations(&self) -> Vec<MutationRequest> {
        self.state.borrow().mutations.clone()
    }

    /// Answers the mutation sent as `ordinal`.
    pub fn respond(&self, ordinal: Ordinal, response: Result<MutationResponse, TransportError>) {
        let sender = self
            .state
            .borrow_mut()
            .pending_mutations
            .remove(&ordinal)
            .expect("no pending mutation for ordinal");
        let _ = sender.send(response);
    }
}

impl Transport for MockTransport {
    fn subscribe(
        &self,
        token: &QueryToken,
        request: &QueryRequest,
        cursor: Option<Cursor>,
    ) -> LocalBoxFuture<'static, Result<Option<Cursor>, TransportError>> {
        let mut state = self.state.borrow_mut();
        state
            .subscribes
            .push((token.clone(), request.clone(), cursor.clone()));
        if !state.manual_acks {
            return ready(Ok(cursor)).boxed_local();
        }
        let (tx, rx) = oneshot::channel();
        state.pending_acks.push((token.clone(), tx));
        rx.map(|r| r.unwrap_or_else(|_| Err(TransportError::new("ack dropped"))))
            .boxed_local()
    }

    fn unsubscribe(&self, token: &QueryToken) {
        self.state.borrow_mut().unsubscribes.push(token.clone());
    }

    fn mutate(
        &self,
        request: MutationRequest,
    ) -> LocalBoxFuture<'static, Result<MutationResponse, TransportError>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.borrow_mut();
        state.pending_mutations.insert(request.ordinal, tx);
        state.mutations.push(request);
        rx.map(|r| r.unwrap_or_else(|_| Err(TransportError::new("response dropped"))))
            .boxed_local()
    }
}

/// Builds an argument object from JSON.
pub fn args(json: serde_json::Value) -> Value {
    Value::from(json)
}

pub fn empty() -> Value {
    Value::Object(Default::default())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
