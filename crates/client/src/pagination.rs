//! Paginated queries.
//!
//! A paginated query is a chain of ordinary subscriptions, one per page.
//! Each page is the base query with a `paginationOpts` argument added:
//!
//! ```text
//! { numItems: <page size>, cursor: <start cursor or null>, id: <session id> }
//! ```
//!
//! The backend answers every page with an object of the form
//! `{ page: [...], isDone: bool, continueCursor: string }`. Page `k + 1`
//! starts at page `k`'s `continueCursor`; since the backend pins a page's
//! end once it has been served, adjacent pages never overlap or leave gaps.

use crate::client::{Client, ClientInner, SubscribeOptions, SubscriptionHandle};
use std::rc::{Rc, Weak};
use tidal_core::{
    ArgumentError, Cursor, Error, ExecutionError, FunctionPath, FunctionRef, OptimisticUpdateError,
    QueryRequest, QueryToken, Result, Value, ValueObject,
};
use tidal_reactive::{ListenerId, OptimisticLocalStore};
use tracing::debug;

/// Argument carrying page options.
pub const PAGINATION_OPTS: &str = "paginationOpts";

/// Options for [`Client::paginate`].
#[derive(Clone, Debug, Default)]
pub struct PaginationOptions {
    /// Size of the first page; the configured default when `None`
    pub initial_num_items: Option<usize>,
}

/// Load state of a paginated query.
#[derive(Clone, Debug, PartialEq)]
pub enum PaginationStatus {
    /// The last page has not delivered its first result yet.
    Loading,
    /// More items can be loaded.
    HasMore,
    /// The last page reached the end.
    Exhausted,
    /// A page failed, or returned something that is not a page.
    Error(Error),
}

/// Items loaded so far.
#[derive(Clone, Debug, PartialEq)]
pub struct PaginatedView {
    pub items: Vec<Value>,
    pub status: PaginationStatus,
}

struct Page<'a> {
    items: &'a [Value],
    is_done: bool,
    continue_cursor: Cursor,
}

fn parse_page(value: &Value) -> std::result::Result<Page<'_>, String> {
    let object = value
        .as_object()
        .ok_or_else(|| format!("expected an object, got {}", value.type_name()))?;
    let items = object
        .get("page")
        .and_then(Value::as_array)
        .ok_or("missing page array")?;
    let is_done = object
        .get("isDone")
        .and_then(Value::as_bool)
        .ok_or("missing isDone flag")?;
    let continue_cursor = object
        .get("continueCursor")
        .and_then(Value::as_str)
        .ok_or("missing continueCursor")?;
    Ok(Page {
        items,
        is_done,
        continue_cursor: Cursor::new(continue_cursor),
    })
}

fn malformed(reason: String) -> Error {
    Error::Execution(ExecutionError::with_data(
        "malformed page result",
        Value::String(reason),
    ))
}

/// State shared between a paginated query and its listeners.
struct Session {
    client: Weak<ClientInner>,
    path: FunctionPath,
    args: ValueObject,
    id: u64,
    tokens: std::cell::RefCell<Vec<QueryToken>>,
}

impl Session {
    fn page_request(&self, inner: &ClientInner, cursor: Option<&Cursor>, num_items: usize) -> Result<QueryRequest> {
        let mut opts = ValueObject::with_capacity(3);
        opts.insert("numItems", Value::Int64(num_items as i64));
        opts.insert(
            "cursor",
            cursor.map_or(Value::Null, |c| Value::String(c.as_str().to_string())),
        );
        opts.insert("id", Value::Int64(self.id as i64));

        let mut args = self.args.clone();
        args.insert(PAGINATION_OPTS, Value::Object(opts));
        inner.request(self.path.clone(), Value::Object(args))
    }

    fn view(&self) -> Result<PaginatedView> {
        let inner = self.client.upgrade().ok_or(Error::ClientGone)?;
        let state = inner.state.borrow();
        let tokens = self.tokens.borrow();

        let mut items = Vec::new();
        let mut error = None;
        let mut loading = false;
        let mut last_done = false;
        let mut complete = true;
        for (i, token) in tokens.iter().enumerate() {
            match state.peek(token) {
                Ok(Some(value)) => match parse_page(&value) {
                    Ok(page) => {
                        if complete {
                            items.extend(page.items.iter().cloned());
                        }
                        if i + 1 == tokens.len() {
                            last_done = page.is_done;
                        }
                    }
                    Err(reason) => {
                        error = Some(malformed(reason));
                        complete = false;
                    }
                },
                Ok(None) => {
                    // An earlier page without a result only cuts the items short.
                    loading = i + 1 == tokens.len();
                    complete = false;
                }
                Err(err) => {
                    error = Some(err);
                    complete = false;
                }
            }
        }

        let status = match error {
            Some(err) => PaginationStatus::Error(err),
            None if loading => PaginationStatus::Loading,
            None if last_done => PaginationStatus::Exhausted,
            None => PaginationStatus::HasMore,
        };
        Ok(PaginatedView { items, status })
    }
}

/// A paginated query.
///
/// Dropping it unsubscribes every page and removes its listeners.
pub struct PaginatedQuery {
    session: Rc<Session>,
    pages: Vec<SubscriptionHandle>,
    listeners: Vec<ListenerId>,
}

impl Client {
    /// Starts a paginated query by loading its first page.
    ///
    /// `args` must not contain `paginationOpts` itself.
    pub fn paginate(
        &self,
        function: impl Into<FunctionRef>,
        args: Value,
        options: PaginationOptions,
    ) -> Result<PaginatedQuery> {
        let base = self.inner.request(function, args)?;
        if base.args().contains_key(PAGINATION_OPTS) {
            return Err(ArgumentError::InvalidFieldName {
                path: "args".to_string(),
                name: PAGINATION_OPTS.to_string(),
                reason: "reserved for pagination",
            }
            .into());
        }
        let num_items = options
            .initial_num_items
            .unwrap_or(self.inner.config.default_page_size);
        if num_items == 0 {
            return Err(ArgumentError::InvalidPageSize { requested: 0 }.into());
        }

        let session = Rc::new(Session {
            client: Rc::downgrade(&self.inner),
            path: base.path().clone(),
            args: base.args().clone(),
            id: self.inner.next_session(),
            tokens: Default::default(),
        });
        let request = session.page_request(&self.inner, None, num_items)?;
        let page = self.subscribe_request(request, SubscribeOptions::default());
        session.tokens.borrow_mut().push(page.token().clone());
        debug!(session = session.id, path = %session.path, num_items, "started paginated query");

        Ok(PaginatedQuery {
            session,
            pages: vec![page],
            listeners: Vec::new(),
        })
    }
}

impl PaginatedQuery {
    /// Session id sent with every page.
    #[inline]
    pub fn session_id(&self) -> u64 {
        self.session.id
    }

    /// Number of pages requested so far.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Tokens of the page subscriptions, in page order.
    pub fn tokens(&self) -> Vec<QueryToken> {
        self.session.tokens.borrow().clone()
    }

    /// Returns the items loaded so far and the load state.
    ///
    /// Items stop at the first page that has not loaded.
    pub fn current(&self) -> Result<PaginatedView> {
        self.session.view()
    }

    /// Requests the next `num_items` items.
    ///
    /// Returns `Ok(false)` without doing anything unless the last page has
    /// loaded and more items exist.
    pub fn load_more(&mut self, num_items: usize) -> Result<bool> {
        if num_items == 0 {
            return Err(ArgumentError::InvalidPageSize { requested: 0 }.into());
        }
        let inner = self.session.client.upgrade().ok_or(Error::ClientGone)?;
        let Some(last) = self.pages.last() else {
            return Ok(false);
        };
        let cursor = match inner.state.borrow().peek(last.token()) {
            Ok(Some(value)) => match parse_page(&value) {
                Ok(page) if !page.is_done => page.continue_cursor,
                _ => return Ok(false),
            },
            _ => return Ok(false),
        };

        let request = self.session.page_request(&inner, Some(&cursor), num_items)?;
        let page = Client { inner: inner.clone() }.subscribe_request(request, SubscribeOptions::default());
        let token = page.token().clone();
        {
            let mut state = inner.state.borrow_mut();
            for id in &self.listeners {
                state.dispatcher.listeners_mut().add_token(*id, token.clone());
            }
        }
        self.session.tokens.borrow_mut().push(token);
        self.pages.push(page);
        debug!(session = self.session.id, pages = self.pages.len(), cursor = %cursor, "loading more");
        Ok(true)
    }

    /// Calls `on_update` with the current view whenever any page changes.
    ///
    /// The listener lives as long as this query.
    pub fn on_update<F>(&mut self, on_update: F) -> Result<ListenerId>
    where
        F: Fn(&PaginatedView) + 'static,
    {
        let inner = self.session.client.upgrade().ok_or(Error::ClientGone)?;
        let session = Rc::downgrade(&self.session);
        let tokens = self.tokens();
        let id = inner
            .state
            .borrow_mut()
            .dispatcher
            .listeners_mut()
            .listen(tokens, move |_| {
                if let Some(Ok(view)) = session.upgrade().map(|s| s.view()) {
                    on_update(&view);
                }
            });
        self.listeners.push(id);
        Ok(id)
    }
}

impl Drop for PaginatedQuery {
    fn drop(&mut self) {
        if let Some(inner) = self.session.client.upgrade() {
            for id in self.listeners.drain(..) {
                inner.remove_listener(id);
            }
        }
    }
}

fn object_args(args: Value) -> std::result::Result<ValueObject, OptimisticUpdateError> {
    match args {
        Value::Object(args) => Ok(args),
        other => Err(ArgumentError::NotAnObject {
            got: other.type_name(),
        }
        .into()),
    }
}

/// True if `page_args` are `args` plus page options.
fn is_page_of(page_args: &ValueObject, args: &ValueObject) -> bool {
    page_args.len() == args.len() + 1
        && page_args.contains_key(PAGINATION_OPTS)
        && args.iter().all(|(k, v)| page_args.get(k) == Some(v))
}

/// Rewrites every loaded item of every page of a paginated query.
///
/// For use inside optimistic updates.
pub fn update_paginated_items<F>(
    view: &mut OptimisticLocalStore<'_>,
    function: impl Into<FunctionRef>,
    args: Value,
    update: F,
) -> std::result::Result<(), OptimisticUpdateError>
where
    F: Fn(&Value) -> Value,
{
    let args = object_args(args)?;
    for query in view.get_all(function)? {
        if !is_page_of(&query.args, &args) {
            continue;
        }
        let Some(mut result) = query.value else {
            continue;
        };
        let Some(Value::Array(items)) = result.as_object_mut().and_then(|o| o.get_mut("page")) else {
            continue;
        };
        for item in items.iter_mut() {
            *item = update(item);
        }
        view.set_token(&query.token, Some(result));
    }
    Ok(())
}

/// Prepends `item` to the first page of a paginated query.
///
/// For use inside optimistic updates.
pub fn insert_at_top(
    view: &mut OptimisticLocalStore<'_>,
    function: impl Into<FunctionRef>,
    args: Value,
    item: Value,
) -> std::result::Result<(), OptimisticUpdateError> {
    let args = object_args(args)?;
    for query in view.get_all(function)? {
        if !is_page_of(&query.args, &args) {
            continue;
        }
        let first = query
            .args
            .get(PAGINATION_OPTS)
            .and_then(|opts| opts.get("cursor"))
            .is_some_and(Value::is_null);
        if !first {
            continue;
        }
        let Some(mut result) = query.value else {
            continue;
        };
        if let Some(Value::Array(items)) = result.as_object_mut().and_then(|o| o.get_mut("page")) {
            items.insert(0, item.clone());
            view.set_token(&query.token, Some(result));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_page() {
        let value = Value::from(json!({"page": [1, 2], "isDone": false, "continueCursor": "c2"}));
        let page = parse_page(&value).unwrap();
        assert_eq!(page.items, &[Value::Int64(1), Value::Int64(2)]);
        assert!(!page.is_done);
        assert_eq!(page.continue_cursor, Cursor::new("c2"));
    }

    #[test]
    fn test_parse_page_rejects_malformed() {
        assert!(parse_page(&Value::Int64(3)).is_err());
        assert!(parse_page(&Value::from(json!({"page": [], "isDone": true}))).is_err());
        assert!(parse_page(&Value::from(json!({"page": 1, "isDone": true, "continueCursor": ""}))).is_err());
    }

    #[test]
    fn test_is_page_of() {
        let base = ValueObject::from_iter([("channel", Value::from("a"))]);
        let mut page = base.clone();
        page.insert(PAGINATION_OPTS, Value::Object(ValueObject::new()));
        assert!(is_page_of(&page, &base));

        let other = ValueObject::from_iter([("channel", Value::from("b"))]);
        assert!(!is_page_of(&page, &other));
        assert!(!is_page_of(&base, &base));
    }
}
