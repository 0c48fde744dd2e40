//! Conversion between [`Value`] and [`Envelope`].
//!
//! Both directions walk the tree recursively and refuse to go deeper than
//! [`MAX_DEPTH`]. A `Value` owns its children, so it cannot contain a cycle;
//! the depth limit is what bounds a hostile envelope on the way in.

use std::collections::BTreeMap;

use serde_json::Map as JsonMap;
use serde_json::Number;
use serde_json::Value as Json;

use crate::buffer::TypedBuffer;
use crate::envelope::Envelope;
use crate::envelope::Shape;
use crate::error::CodecError;
use crate::error::Result;
use crate::exception::ErrorKind;
use crate::exception::ErrorValue;
use crate::image::Image;
use crate::value::Handle;
use crate::value::RemoteRef;
use crate::value::Value;

/// Maximum nesting accepted in either direction.
pub const MAX_DEPTH: usize = 128;

/// Encodes a value for the wire.
pub fn encode(value: &Value) -> Result<Envelope> {
    encode_at(value, 0)
}

/// Encodes an argument list.
pub fn encode_all(values: &[Value]) -> Result<Vec<Envelope>> {
    values.iter().map(encode).collect()
}

/// Decodes an envelope back into a value. Buffers are fresh copies.
pub fn decode(envelope: &Envelope) -> Result<Value> {
    decode_at(envelope, 0)
}

/// Decodes an argument list.
pub fn decode_all(envelopes: &[Envelope]) -> Result<Vec<Value>> {
    envelopes.iter().map(decode).collect()
}

/// Converts a plain value to JSON. Typed values are rejected with
/// [`CodecError::NotPlain`].
pub fn encode_json(value: &Value) -> Result<Json> {
    match to_plain(value, 0)? {
        Some(json) => Ok(json),
        None => Err(CodecError::NotPlain { kind: first_typed_kind(value) }),
    }
}

/// Converts JSON to a value.
pub fn decode_json(json: &Json) -> Result<Value> {
    from_plain(json, 0)
}

fn check_depth(depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep { limit: MAX_DEPTH });
    }
    Ok(())
}

fn encode_at(value: &Value, depth: usize) -> Result<Envelope> {
    check_depth(depth)?;

    if let Some(json) = to_plain(value, depth)? {
        return Ok(Envelope::Raw { value: json });
    }

    let envelope = match value {
        Value::List(items) => Envelope::Composite {
            shape: Shape::Sequence,
            members: items
                .iter()
                .map(|item| encode_at(item, depth + 1))
                .collect::<Result<Vec<_>>>()?,
        },
        Value::Map(map) => {
            let mut keys = Vec::with_capacity(map.len());
            let mut members = Vec::with_capacity(map.len());
            for (key, item) in map {
                keys.push(key.clone());
                members.push(encode_at(item, depth + 1)?);
            }
            Envelope::Composite { shape: Shape::Mapping { keys }, members }
        }
        Value::Buffer(buffer) => Envelope::Buffer {
            subtype: buffer.subtype().to_string(),
            bytes: buffer.to_le_bytes(),
            length: buffer.len(),
        },
        Value::Image(image) => Envelope::Image {
            representations: image.representations().to_vec(),
        },
        Value::Error(error) => Envelope::Error {
            name: error.name().to_string(),
            message: error.message.clone(),
            stack: error.stack.clone(),
            origin: error.origin,
            cause: match &error.cause {
                Some(cause) => Some(Box::new(encode_at(cause, depth + 1)?)),
                None => None,
            },
        },
        Value::Remote(remote) => Envelope::Handle {
            target: remote.target,
            id: remote.handle.0,
        },
        Value::Opaque(opaque) => {
            return Err(CodecError::Unclassifiable {
                type_name: opaque.type_name().to_string(),
            });
        }
        // Scalars are always plain and were handled above.
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::Str(_) => {
            unreachable!("scalars always have a plain form")
        }
    };
    Ok(envelope)
}

fn decode_at(envelope: &Envelope, depth: usize) -> Result<Value> {
    check_depth(depth)?;

    let value = match envelope {
        Envelope::Raw { value } => from_plain(value, depth)?,
        Envelope::Buffer { subtype, bytes, length } => {
            Value::Buffer(TypedBuffer::from_le_bytes(subtype, bytes, *length)?)
        }
        Envelope::Image { representations } => {
            Value::Image(Image::from_representations(representations.clone())?)
        }
        Envelope::Error { name, message, stack, origin, cause } => {
            let cause = match cause {
                Some(cause) => Some(Box::new(decode_at(cause, depth + 1)?)),
                None => None,
            };
            Value::Error(ErrorValue {
                kind: ErrorKind::from_name(name),
                message: message.clone(),
                stack: stack.clone(),
                origin: *origin,
                cause,
            })
        }
        Envelope::Handle { target, id } => Value::Remote(RemoteRef {
            target: *target,
            handle: Handle(*id),
        }),
        Envelope::Composite { shape, members } => {
            if let Shape::Mapping { keys } = shape {
                if keys.len() != members.len() {
                    return Err(CodecError::ShapeMismatch {
                        keys: keys.len(),
                        members: members.len(),
                    });
                }
            }
            let decoded = members
                .iter()
                .map(|m| decode_at(m, depth + 1))
                .collect::<Result<Vec<_>>>()?;
            match shape {
                Shape::Sequence => Value::List(decoded),
                Shape::Mapping { keys } => {
                    Value::Map(keys.iter().cloned().zip(decoded).collect::<BTreeMap<_, _>>())
                }
            }
        }
    };
    Ok(value)
}

/// Returns the JSON form of `value` if it and all of its children are plain.
fn to_plain(value: &Value, depth: usize) -> Result<Option<Json>> {
    check_depth(depth)?;

    let json = match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Number(n) => match Number::from_f64(*n) {
            Some(num) => Json::Number(num),
            None => return Err(CodecError::NonFiniteNumber(*n)),
        },
        Value::Str(s) => Json::String(s.clone()),
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match to_plain(item, depth + 1)? {
                    Some(json) => out.push(json),
                    None => return Ok(None),
                }
            }
            Json::Array(out)
        }
        Value::Map(map) => {
            let mut out = JsonMap::new();
            for (key, item) in map {
                match to_plain(item, depth + 1)? {
                    Some(json) => {
                        out.insert(key.clone(), json);
                    }
                    None => return Ok(None),
                }
            }
            Json::Object(out)
        }
        Value::Buffer(_) | Value::Image(_) | Value::Error(_) | Value::Remote(_) | Value::Opaque(_) => {
            return Ok(None);
        }
    };
    Ok(Some(json))
}

fn from_plain(json: &Json, depth: usize) -> Result<Value> {
    check_depth(depth)?;

    let value = match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        // Every JSON number fits an f64, possibly with rounding of huge integers.
        Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        Json::String(s) => Value::Str(s.clone()),
        Json::Array(items) => Value::List(
            items
                .iter()
                .map(|item| from_plain(item, depth + 1))
                .collect::<Result<Vec<_>>>()?,
        ),
        Json::Object(map) => {
            let mut out = BTreeMap::new();
            for (key, item) in map {
                out.insert(key.clone(), from_plain(item, depth + 1)?);
            }
            Value::Map(out)
        }
    };
    Ok(value)
}

/// Finds the first non-plain value in a tree, for error messages.
fn first_typed_kind(value: &Value) -> &'static str {
    match value {
        Value::List(items) => items
            .iter()
            .map(first_typed_kind)
            .find(|k| *k != "plain")
            .unwrap_or("plain"),
        Value::Map(map) => map
            .values()
            .map(first_typed_kind)
            .find(|k| *k != "plain")
            .unwrap_or("plain"),
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::Str(_) => "plain",
        other => other.kind_name(),
    }
}
