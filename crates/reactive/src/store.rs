//! Confirmed query results.
//!
//! The `LocalResultStore` holds, per known query token, the request that
//! produced it and the latest result the backend confirmed. A token is known
//! from the moment it is subscribed until its entry is purged; a known token
//! with no result is still loading.

use hashbrown::HashMap;
use tidal_core::{ExecutionError, FunctionPath, QueryRequest, QueryToken, Value};

/// The outcome of running a query.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryResult {
    Value(Value),
    Error(ExecutionError),
}

impl QueryResult {
    /// Borrows the result as a `Result`.
    pub fn as_result(&self) -> Result<&Value, &ExecutionError> {
        match self {
            QueryResult::Value(v) => Ok(v),
            QueryResult::Error(e) => Err(e),
        }
    }

    /// Returns the value, or `None` for an error.
    pub fn value(&self) -> Option<&Value> {
        self.as_result().ok()
    }
}

impl From<Value> for QueryResult {
    fn from(value: Value) -> Self {
        QueryResult::Value(value)
    }
}

impl From<ExecutionError> for QueryResult {
    fn from(error: ExecutionError) -> Self {
        QueryResult::Error(error)
    }
}

/// A known query and its confirmed result.
#[derive(Clone, Debug)]
pub struct StoredQuery {
    request: QueryRequest,
    result: Option<QueryResult>,
}

impl StoredQuery {
    #[inline]
    pub fn request(&self) -> &QueryRequest {
        &self.request
    }

    /// The confirmed result, or `None` while loading.
    #[inline]
    pub fn result(&self) -> Option<&QueryResult> {
        self.result.as_ref()
    }
}

/// Latest confirmed result per query token.
#[derive(Default)]
pub struct LocalResultStore {
    queries: HashMap<QueryToken, StoredQuery>,
}

impl LocalResultStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a token known, in the loading state.
    ///
    /// Returns false, leaving the entry untouched, if the token was known.
    pub fn insert_query(&mut self, token: QueryToken, request: QueryRequest) -> bool {
        if self.queries.contains_key(&token) {
            return false;
        }
        self.queries.insert(
            token,
            StoredQuery {
                request,
                result: None,
            },
        );
        true
    }

    /// Forgets a token.
    pub fn remove(&mut self, token: &QueryToken) -> Option<StoredQuery> {
        self.queries.remove(token)
    }

    /// Replaces the confirmed result of a known token.
    ///
    /// Returns false, storing nothing, if the token is unknown.
    pub fn set_result(&mut self, token: &QueryToken, result: Option<QueryResult>) -> bool {
        match self.queries.get_mut(token) {
            Some(query) => {
                query.result = result;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, token: &QueryToken) -> Option<&StoredQuery> {
        self.queries.get(token)
    }

    /// Returns the confirmed result of a token, if known and loaded.
    pub fn result(&self, token: &QueryToken) -> Option<&QueryResult> {
        self.queries.get(token).and_then(StoredQuery::result)
    }

    #[inline]
    pub fn contains(&self, token: &QueryToken) -> bool {
        self.queries.contains_key(token)
    }

    /// Returns every known token of the given function, in token order.
    pub fn tokens_for(&self, path: &FunctionPath) -> Vec<QueryToken> {
        let mut tokens: Vec<QueryToken> = self
            .queries
            .iter()
            .filter(|(_, query)| query.request.path() == path)
            .map(|(token, _)| token.clone())
            .collect();
        tokens.sort();
        tokens
    }

    /// Iterates over the known tokens, in no particular order.
    pub fn tokens(&self) -> impl Iterator<Item = &QueryToken> {
        self.queries.keys()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}
