//! # duopack
//!
//! The value codec for the host/guest boundary.
//!
//! A [`Value`] is what handlers and scripts work with. An [`Envelope`] is what
//! travels: a tagged, owned, transport-safe form that carries no reference into
//! either side's memory.
//!
//! ## Philosophy
//!
//! - **Plain data stays plain**: strings, numbers, booleans and containers of
//!   them pass through as a single `Raw` JSON value.
//! - **Typed data keeps its type**: buffers, images, errors and handles get
//!   their own tags so the receiving side rebuilds the same kind.
//! - **Nothing is dropped**: a value that cannot be classified is an error,
//!   never a silent `null`.

mod buffer;
mod codec;
mod envelope;
mod error;
mod exception;
mod image;
mod value;

pub use buffer::TypedBuffer;
pub use codec::decode;
pub use codec::decode_all;
pub use codec::decode_json;
pub use codec::encode;
pub use codec::encode_all;
pub use codec::encode_json;
pub use codec::MAX_DEPTH;
pub use envelope::Envelope;
pub use envelope::Shape;
pub use error::CodecError;
pub use error::Result;
pub use exception::ErrorKind;
pub use exception::ErrorValue;
pub use exception::Origin;
pub use image::Image;
pub use image::ImageRep;
pub use value::Handle;
pub use value::HandleTarget;
pub use value::Opaque;
pub use value::RemoteRef;
pub use value::Value;
