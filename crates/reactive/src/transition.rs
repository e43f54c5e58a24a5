//! Backend transitions.
//!
//! A transition is one atomic batch of confirmed query results. It is applied
//! as a whole or not at all, and always in delivery order.

use tidal_core::{Cursor, ExecutionError, QueryToken, Timestamp, Value};

/// One query's change within a transition.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryModification {
    /// The query produced a new value.
    Updated {
        token: QueryToken,
        value: Value,
        cursor: Option<Cursor>,
    },
    /// The query raised.
    Failed {
        token: QueryToken,
        error: ExecutionError,
        cursor: Option<Cursor>,
    },
    /// The backend stopped serving the query. Its result becomes unknown.
    Removed { token: QueryToken },
}

impl QueryModification {
    /// Returns the token this modification applies to.
    pub fn token(&self) -> &QueryToken {
        match self {
            QueryModification::Updated { token, .. }
            | QueryModification::Failed { token, .. }
            | QueryModification::Removed { token } => token,
        }
    }

    /// Returns the resumption cursor carried by this modification.
    pub fn cursor(&self) -> Option<&Cursor> {
        match self {
            QueryModification::Updated { cursor, .. } | QueryModification::Failed { cursor, .. } => {
                cursor.as_ref()
            }
            QueryModification::Removed { .. } => None,
        }
    }
}

/// An atomic batch of modifications.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    /// Timestamp the batch builds on, if the backend reported one
    pub start_ts: Option<Timestamp>,
    /// Timestamp the batch brings the client to
    pub end_ts: Timestamp,
    pub modifications: Vec<QueryModification>,
}

impl Transition {
    /// Creates an empty transition ending at `end_ts`.
    pub fn new(end_ts: Timestamp) -> Self {
        Self {
            start_ts: None,
            end_ts,
            modifications: Vec::new(),
        }
    }

    /// Sets the start timestamp.
    pub fn starting_at(mut self, start_ts: Timestamp) -> Self {
        self.start_ts = Some(start_ts);
        self
    }

    /// Adds a new value for a query.
    pub fn updated(mut self, token: QueryToken, value: impl Into<Value>) -> Self {
        self.modifications.push(QueryModification::Updated {
            token,
            value: value.into(),
            cursor: None,
        });
        self
    }

    /// Adds a new value for a query, with a resumption cursor.
    pub fn updated_at(mut self, token: QueryToken, value: impl Into<Value>, cursor: Cursor) -> Self {
        self.modifications.push(QueryModification::Updated {
            token,
            value: value.into(),
            cursor: Some(cursor),
        });
        self
    }

    /// Adds an execution error for a query.
    pub fn failed(mut self, token: QueryToken, error: ExecutionError) -> Self {
        self.modifications.push(QueryModification::Failed {
            token,
            error,
            cursor: None,
        });
        self
    }

    /// Marks a query as no longer served.
    pub fn removed(mut self, token: QueryToken) -> Self {
        self.modifications
            .push(QueryModification::Removed { token });
        self
    }

    /// Iterates over the tokens this transition modifies, duplicates included.
    pub fn tokens(&self) -> impl Iterator<Item = &QueryToken> {
        self.modifications.iter().map(QueryModification::token)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.modifications.is_empty()
    }
}
