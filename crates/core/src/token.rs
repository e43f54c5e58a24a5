//! Query identity.
//!
//! A query is a function path plus an argument object. Its [`QueryToken`] is
//! the canonical text of both, so structurally equal arguments always map to
//! the same token regardless of field insertion order.

use crate::error::ArgumentError;
use crate::function::{FunctionPath, FunctionRef};
use crate::value::{Value, ValueObject};
use core::fmt;
use std::sync::Arc;

/// Maximum nesting depth of an argument value.
pub const MAX_NESTING: usize = 64;

/// Maximum number of fields in a single argument object.
pub const MAX_OBJECT_FIELDS: usize = 1024;

/// Limits enforced by [`validate_args`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArgLimits {
    pub max_depth: usize,
    pub max_fields: usize,
}

impl Default for ArgLimits {
    fn default() -> Self {
        Self {
            max_depth: MAX_NESTING,
            max_fields: MAX_OBJECT_FIELDS,
        }
    }
}

/// Checks that `args` is a well-formed argument object and returns it.
///
/// Rejected: non-object arguments, non-finite floats, empty field names,
/// field names starting with `$` or containing non-ASCII characters, and
/// values beyond the nesting or field-count limits.
pub fn validate_args(args: Value, limits: &ArgLimits) -> Result<ValueObject, ArgumentError> {
    match args {
        Value::Object(object) => {
            let mut path = String::from("args");
            validate_object(&object, &mut path, 1, limits)?;
            Ok(object)
        }
        other => Err(ArgumentError::NotAnObject {
            got: other.type_name(),
        }),
    }
}

fn validate_value(
    value: &Value,
    path: &mut String,
    depth: usize,
    limits: &ArgLimits,
) -> Result<(), ArgumentError> {
    match value {
        Value::Float64(f) if !f.is_finite() => Err(ArgumentError::NonFiniteFloat {
            path: path.clone(),
        }),
        Value::Array(items) => {
            check_depth(path, depth, limits)?;
            for (i, item) in items.iter().enumerate() {
                let len = path.len();
                path.push_str(&format!("[{i}]"));
                validate_value(item, path, depth + 1, limits)?;
                path.truncate(len);
            }
            Ok(())
        }
        Value::Object(object) => validate_object(object, path, depth, limits),
        _ => Ok(()),
    }
}

fn validate_object(
    object: &ValueObject,
    path: &mut String,
    depth: usize,
    limits: &ArgLimits,
) -> Result<(), ArgumentError> {
    check_depth(path, depth, limits)?;
    if object.len() > limits.max_fields {
        return Err(ArgumentError::TooManyFields {
            path: path.clone(),
            count: object.len(),
            max: limits.max_fields,
        });
    }
    for (name, value) in object.iter() {
        check_field_name(path, name)?;
        let len = path.len();
        path.push('.');
        path.push_str(name);
        validate_value(value, path, depth + 1, limits)?;
        path.truncate(len);
    }
    Ok(())
}

fn check_depth(path: &str, depth: usize, limits: &ArgLimits) -> Result<(), ArgumentError> {
    if depth > limits.max_depth {
        return Err(ArgumentError::TooNested {
            path: path.to_string(),
            max: limits.max_depth,
        });
    }
    Ok(())
}

fn check_field_name(path: &str, name: &str) -> Result<(), ArgumentError> {
    let reason = if name.is_empty() {
        "field names must be non-empty"
    } else if name.starts_with('$') {
        "field names must not start with '$'"
    } else if !name.is_ascii() {
        "field names must be ASCII"
    } else if name.chars().any(|c| c.is_ascii_control()) {
        "field names must not contain control characters"
    } else {
        return Ok(());
    };
    Err(ArgumentError::InvalidFieldName {
        path: path.to_string(),
        name: name.to_string(),
        reason,
    })
}

/// A validated query: function path and argument object.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryRequest {
    path: FunctionPath,
    args: ValueObject,
}

impl QueryRequest {
    /// Validates a query with the default argument limits.
    pub fn new(function: impl Into<FunctionRef>, args: Value) -> Result<Self, ArgumentError> {
        Self::with_limits(function, args, &ArgLimits::default())
    }

    /// Validates a query with explicit argument limits.
    pub fn with_limits(
        function: impl Into<FunctionRef>,
        args: Value,
        limits: &ArgLimits,
    ) -> Result<Self, ArgumentError> {
        let path = function.into().resolve()?;
        let args = validate_args(args, limits)?;
        Ok(Self { path, args })
    }

    #[inline]
    pub fn path(&self) -> &FunctionPath {
        &self.path
    }

    #[inline]
    pub fn args(&self) -> &ValueObject {
        &self.args
    }

    /// Computes this query's token.
    pub fn token(&self) -> QueryToken {
        let mut text = String::from("{\"args\":");
        Value::Object(self.args.clone()).write_canonical(&mut text);
        text.push_str(",\"udfPath\":\"");
        text.push_str(&self.path.to_string());
        text.push_str("\"}");
        QueryToken(Arc::from(text))
    }
}

/// Canonical identity of a query.
///
/// Two queries share a token iff their function paths are equal and their
/// arguments are structurally equal. Cloning is cheap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryToken(Arc<str>);

impl QueryToken {
    /// Returns the canonical text.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for QueryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryToken({})", self.0)
    }
}

impl fmt::Display for QueryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
