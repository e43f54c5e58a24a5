//! Function references.
//!
//! Backend functions are addressed by a `module:function` path. References
//! come from a statically declared table (see [`functions!`](crate::functions))
//! or, for genuinely dynamic lookups, from a validated runtime path.

use crate::error::ArgumentError;
use core::fmt;
use core::str::FromStr;

const DEFAULT_EXPORT: &str = "default";

/// A canonical `module:function` path.
///
/// Canonicalization: a path without `:function` names the module's default
/// export, and a trailing `.js` on the module is dropped. `messages` and
/// `messages.js:default` are the same function.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionPath {
    module: String,
    function: String,
}

impl FunctionPath {
    /// Parses and canonicalizes a function path.
    pub fn parse(path: &str) -> Result<Self, ArgumentError> {
        let invalid = |reason| ArgumentError::InvalidFunctionPath {
            path: path.to_string(),
            reason,
        };

        let mut pieces = path.split(':');
        let module = pieces.next().unwrap_or_default();
        let function = pieces.next().unwrap_or(DEFAULT_EXPORT);
        if pieces.next().is_some() {
            return Err(invalid("more than one ':' separator"));
        }

        let module = module.strip_suffix(".js").unwrap_or(module);
        if module.is_empty() {
            return Err(invalid("empty module path"));
        }
        if module.split('/').any(str::is_empty) {
            return Err(invalid("empty module path segment"));
        }
        if !is_identifier(function) {
            return Err(invalid("function name must be an identifier"));
        }

        Ok(Self {
            module: module.to_string(),
            function: function.to_string(),
        })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn function(&self) -> &str {
        &self.function
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl fmt::Display for FunctionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.function)
    }
}

impl FromStr for FunctionPath {
    type Err = ArgumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FunctionPath::parse(s)
    }
}

/// A reference to a backend function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FunctionRef {
    /// An entry of a statically declared reference table.
    Static(&'static str),
    /// A path resolved at runtime.
    Dynamic(FunctionPath),
}

impl FunctionRef {
    /// Builds a dynamic reference, validating the path up front.
    pub fn dynamic(path: &str) -> Result<Self, ArgumentError> {
        FunctionPath::parse(path).map(FunctionRef::Dynamic)
    }

    /// Resolves this reference to its canonical path.
    pub fn resolve(&self) -> Result<FunctionPath, ArgumentError> {
        match self {
            FunctionRef::Static(path) => FunctionPath::parse(path),
            FunctionRef::Dynamic(path) => Ok(path.clone()),
        }
    }
}

impl From<&'static str> for FunctionRef {
    fn from(path: &'static str) -> Self {
        FunctionRef::Static(path)
    }
}

impl From<FunctionPath> for FunctionRef {
    fn from(path: FunctionPath) -> Self {
        FunctionRef::Dynamic(path)
    }
}

impl From<&FunctionPath> for FunctionRef {
    fn from(path: &FunctionPath) -> Self {
        FunctionRef::Dynamic(path.clone())
    }
}

/// Declares a static table of function references.
///
/// ```
/// tidal_core::functions! {
///     pub mod api {
///         LIST_MESSAGES => "messages:list",
///         SEND_MESSAGE => "messages:send",
///     }
/// }
///
/// assert_eq!(api::LIST_MESSAGES.resolve().unwrap().to_string(), "messages:list");
/// ```
#[macro_export]
macro_rules! functions {
    ($(
        $(#[$meta:meta])*
        $vis:vis mod $module:ident {
            $( $(#[$item_meta:meta])* $name:ident => $path:literal ),* $(,)?
        }
    )*) => {
        $(
            $(#[$meta])*
            $vis mod $module {
                $(
                    $(#[$item_meta])*
                    pub const $name: $crate::FunctionRef = $crate::FunctionRef::Static($path);
                )*
            }
        )*
    };
}
