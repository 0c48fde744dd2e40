//! Codec errors.

use std::fmt;

/// Failures while converting between [`crate::Value`] and [`crate::Envelope`].
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    /// The value is a live host object with no transport-safe form.
    Unclassifiable { type_name: String },
    /// NaN and infinities have no plain representation.
    NonFiniteNumber(f64),
    /// Nesting exceeded [`crate::MAX_DEPTH`].
    TooDeep { limit: usize },
    /// A buffer's byte count disagrees with its declared element count.
    BufferLength { subtype: String, expected: usize, found: usize },
    /// An image bitmap is not `width * height * 4` bytes long.
    ImageSize { width: u32, height: u32, found: usize },
    /// A plain (JSON) form was requested for a typed value.
    NotPlain { kind: &'static str },
    /// A mapping carries a different number of keys and members.
    ShapeMismatch { keys: usize, members: usize },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unclassifiable { type_name } => {
                write!(f, "value of type '{}' cannot cross the boundary by value", type_name)
            }
            Self::NonFiniteNumber(n) => write!(f, "non-finite number {} has no plain form", n),
            Self::TooDeep { limit } => write!(f, "value nesting exceeds {} levels", limit),
            Self::BufferLength { subtype, expected, found } => write!(
                f,
                "{} expects {} bytes, found {}",
                subtype, expected, found
            ),
            Self::ImageSize { width, height, found } => write!(
                f,
                "{}x{} bitmap expects {} bytes, found {}",
                width,
                height,
                (*width as usize) * (*height as usize) * 4,
                found
            ),
            Self::NotPlain { kind } => write!(f, "{} value has no plain form", kind),
            Self::ShapeMismatch { keys, members } => {
                write!(f, "mapping has {} keys but {} members", keys, members)
            }
        }
    }
}

impl std::error::Error for CodecError {}

pub type Result<T> = std::result::Result<T, CodecError>;
