//! The transport seam.
//!
//! The client never talks to the network itself. A [`Transport`] carries
//! subscribe, unsubscribe and mutate requests to the backend, and pushes
//! transitions and connection changes back through
//! [`Client::deliver`](crate::Client::deliver) and
//! [`Client::set_connection_state`](crate::Client::set_connection_state).

use futures::future::LocalBoxFuture;
use std::fmt;
use tidal_core::{
    Cursor, ExecutionError, FunctionPath, Ordinal, QueryRequest, QueryToken, Timestamp,
    TransportError, Value, ValueObject,
};

/// A mutation on its way to the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationRequest {
    pub path: FunctionPath,
    pub args: ValueObject,
    /// Client-side invocation order
    pub ordinal: Ordinal,
}

/// The backend's answer to a mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResponse {
    pub outcome: Result<Value, ExecutionError>,
    /// Timestamp the mutation committed at, if it committed
    pub commit_ts: Option<Timestamp>,
}

impl MutationResponse {
    /// A successful response.
    pub fn success(value: impl Into<Value>, commit_ts: Timestamp) -> Self {
        Self {
            outcome: Ok(value.into()),
            commit_ts: Some(commit_ts),
        }
    }

    /// A response for a mutation that raised.
    pub fn failure(error: ExecutionError) -> Self {
        Self {
            outcome: Err(error),
            commit_ts: None,
        }
    }
}

/// Connection to the backend.
///
/// Futures returned here are the client's only suspension points.
pub trait Transport {
    /// Starts a backend subscription for `token`, resuming from `cursor`
    /// when given. Resolves once the backend acknowledged it, with the
    /// subscription's resumption cursor if the backend issued one.
    fn subscribe(
        &self,
        token: &QueryToken,
        request: &QueryRequest,
        cursor: Option<Cursor>,
    ) -> LocalBoxFuture<'static, Result<Option<Cursor>, TransportError>>;

    /// Tears down the backend subscription for `token`.
    fn unsubscribe(&self, token: &QueryToken);

    /// Sends a mutation.
    fn mutate(
        &self,
        request: MutationRequest,
    ) -> LocalBoxFuture<'static, Result<MutationResponse, TransportError>>;
}

/// State of the connection to the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Connected,
    Disconnected {
        reason: String,
    },
}

impl ConnectionState {
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Disconnected { reason } => write!(f, "disconnected: {reason}"),
        }
    }
}
