//! Error types for Tidal.

use crate::value::Value;
use thiserror::Error;

/// Result type alias for Tidal operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Malformed arguments or function paths.
///
/// Always raised synchronously, before any request reaches the transport.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ArgumentError {
    #[error("arguments must be an object, got {got}")]
    NotAnObject { got: &'static str },
    #[error("non-finite float at {path}")]
    NonFiniteFloat { path: String },
    #[error("invalid field name {name:?} at {path}: {reason}")]
    InvalidFieldName {
        path: String,
        name: String,
        reason: &'static str,
    },
    #[error("value at {path} is nested deeper than {max} levels")]
    TooNested { path: String, max: usize },
    #[error("object at {path} has {count} fields (maximum {max})")]
    TooManyFields {
        path: String,
        count: usize,
        max: usize,
    },
    #[error("invalid function path {path:?}: {reason}")]
    InvalidFunctionPath { path: String, reason: &'static str },
    #[error("page size must be positive, got {requested}")]
    InvalidPageSize { requested: usize },
}

/// The backend ran the function and it raised.
///
/// Stored as a query's result and re-raised to every reader until a
/// non-error result for the same query arrives.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
    /// Structured payload attached by application code, if any.
    pub data: Option<Value>,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Connection-level failure reported by the transport.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("transport error: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An optimistic update function failed. Its patch was discarded.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("optimistic update failed: {message}")]
pub struct OptimisticUpdateError {
    pub message: String,
}

impl OptimisticUpdateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<ArgumentError> for OptimisticUpdateError {
    fn from(err: ArgumentError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<&str> for OptimisticUpdateError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for OptimisticUpdateError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Invalid configuration, detected at the call site.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("an optimistic update is already attached to this mutation")]
    DuplicateOptimisticUpdate,
    #[error("invalid config field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Umbrella error for Tidal operations.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum Error {
    #[error(transparent)]
    Argument(#[from] ArgumentError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    OptimisticUpdate(#[from] OptimisticUpdateError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A handle outlived the client that created it.
    #[error("client has been dropped")]
    ClientGone,
}

impl Error {
    /// Returns the execution error, if this is one.
    pub fn as_execution(&self) -> Option<&ExecutionError> {
        match self {
            Error::Execution(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::from(ArgumentError::NotAnObject { got: "array" });
        assert!(err.to_string().contains("must be an object"));

        let err = Error::from(ExecutionError::new("boom"));
        assert_eq!(err.to_string(), "boom");

        let err = Error::from(TransportError::new("closed"));
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn test_execution_error_data() {
        let err = ExecutionError::with_data("bad", Value::Int64(7));
        assert_eq!(err.data, Some(Value::Int64(7)));
        assert_eq!(Error::Execution(err.clone()).as_execution(), Some(&err));
    }

    #[test]
    fn test_optimistic_error_from_argument() {
        let err: OptimisticUpdateError = ArgumentError::InvalidPageSize { requested: 0 }.into();
        assert!(err.message.contains("page size"));
    }
}
