//! Structured errors that cross the boundary.
//!
//! An [`ErrorValue`] keeps the parts a receiver needs to rebuild a typed error:
//! its kind, message, stack text, which side raised it, and an optional cause
//! that may itself be any value (usually another error).

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::value::Value;

/// The fixed set of error constructors a receiver knows how to rebuild.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Error,
    RangeError,
    ReferenceError,
    SyntaxError,
    TypeError,
    UriError,
    EvalError,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::RangeError => "RangeError",
            Self::ReferenceError => "ReferenceError",
            Self::SyntaxError => "SyntaxError",
            Self::TypeError => "TypeError",
            Self::UriError => "URIError",
            Self::EvalError => "EvalError",
        }
    }

    /// Matches a constructor name, falling back to the generic kind.
    pub fn from_name(name: &str) -> Self {
        match name {
            "RangeError" => Self::RangeError,
            "ReferenceError" => Self::ReferenceError,
            "SyntaxError" => Self::SyntaxError,
            "TypeError" => Self::TypeError,
            "URIError" => Self::UriError,
            "EvalError" => Self::EvalError,
            _ => Self::Error,
        }
    }
}

/// Which side of the boundary raised an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Host,
    Guest,
}

/// A structured error value.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorValue {
    pub kind: ErrorKind,
    pub message: String,
    pub stack: Option<String>,
    pub origin: Origin,
    pub cause: Option<Box<Value>>,
}

impl ErrorValue {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
            origin: Origin::Host,
            cause: None,
        }
    }

    /// A generic `Error`.
    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Error, message)
    }

    pub fn with_cause(mut self, cause: impl Into<Value>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// The cause, if it is itself an error.
    pub fn cause_error(&self) -> Option<&ErrorValue> {
        self.cause.as_deref().and_then(Value::as_error)
    }

    /// Iterates this error followed by every error in its cause chain.
    pub fn chain(&self) -> impl Iterator<Item = &ErrorValue> {
        std::iter::successors(Some(self), |e| e.cause_error())
    }

    /// Converts any Rust error into an `ErrorValue`, folding its `source()`
    /// chain into `cause`. An `ErrorValue` found anywhere is kept as is.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        if let Some(value) = err.downcast_ref::<ErrorValue>() {
            return value.clone();
        }
        let mut out = Self::generic(err.to_string());
        if let Some(source) = err.source() {
            out.cause = Some(Box::new(Value::Error(Self::from_error(source))));
        }
        out
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.message)
    }
}

impl std::error::Error for ErrorValue {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause_error().map(|e| e as &(dyn std::error::Error + 'static))
    }
}
