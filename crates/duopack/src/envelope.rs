//! The transport-safe tagged form of a value.

use serde::Deserialize;
use serde::Serialize;

use crate::exception::Origin;
use crate::image::ImageRep;
use crate::value::HandleTarget;

/// How the members of a [`Envelope::Composite`] are laid out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    /// Members in order.
    Sequence,
    /// Members paired positionally with `keys`.
    Mapping { keys: Vec<String> },
}

/// A value encoded for the wire. Owns all of its data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// Plain data, already transport-safe.
    Raw { value: serde_json::Value },
    /// A binary buffer; `length` counts elements of `subtype`.
    Buffer { subtype: String, bytes: Vec<u8>, length: usize },
    /// An image bitmap set.
    Image { representations: Vec<ImageRep> },
    /// A structured error; `cause` may be any envelope.
    Error {
        name: String,
        message: String,
        stack: Option<String>,
        origin: Origin,
        cause: Option<Box<Envelope>>,
    },
    /// A reference into one of the host's handle tables.
    Handle { target: HandleTarget, id: u64 },
    /// A container whose members needed their own tags.
    Composite { shape: Shape, members: Vec<Envelope> },
}

impl Envelope {
    pub fn raw(value: serde_json::Value) -> Self {
        Self::Raw { value }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Raw { .. } => "raw",
            Self::Buffer { .. } => "buffer",
            Self::Image { .. } => "image",
            Self::Error { .. } => "error",
            Self::Handle { .. } => "handle",
            Self::Composite { .. } => "composite",
        }
    }
}
