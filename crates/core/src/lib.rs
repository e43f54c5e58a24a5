//! Tidal Core - Values, function references and query identity.
//!
//! This crate provides the foundational types shared by the Tidal client
//! engine:
//!
//! - `Value`: Values exchanged with the backend, with canonical text
//! - `FunctionPath` / `FunctionRef`: Canonical `module:function` references
//! - `QueryRequest` / `QueryToken`: Validated queries and their identity
//! - `Timestamp`, `Cursor`, `Ordinal`: Small identifier types
//! - `Error`: Error taxonomy for engine operations
//!
//! # Example
//!
//! ```rust
//! use tidal_core::{QueryRequest, Value};
//! use serde_json::json;
//!
//! let a = QueryRequest::new("messages:list", Value::from(json!({"channel": "x", "limit": 10})))
//!     .unwrap();
//! let b = QueryRequest::new("messages.js:list", Value::from(json!({"limit": 10, "channel": "x"})))
//!     .unwrap();
//!
//! assert_eq!(a.token(), b.token());
//! ```

mod error;
mod function;
mod token;
mod types;
mod value;

pub use error::{
    ArgumentError, ConfigError, Error, ExecutionError, OptimisticUpdateError, Result,
    TransportError,
};
pub use function::{FunctionPath, FunctionRef};
pub use token::{validate_args, ArgLimits, QueryRequest, QueryToken, MAX_NESTING, MAX_OBJECT_FIELDS};
pub use types::{Cursor, Ordinal, Timestamp};
pub use value::{Value, ValueObject};
