//! Binary buffers and typed arrays.

use crate::error::CodecError;
use crate::error::Result;

/// A binary buffer tagged with its concrete array kind.
///
/// Multi-byte elements travel little-endian. The element count is carried next
/// to the bytes so a truncated payload is caught instead of silently shortened.
#[derive(Clone, Debug, PartialEq)]
pub enum TypedBuffer {
    /// A plain byte buffer; also the fallback for unknown subtypes.
    Buffer(Vec<u8>),
    ArrayBuffer(Vec<u8>),
    Int8(Vec<i8>),
    Uint8(Vec<u8>),
    Uint8Clamped(Vec<u8>),
    Int16(Vec<i16>),
    Uint16(Vec<u16>),
    Int32(Vec<i32>),
    Uint32(Vec<u32>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

impl TypedBuffer {
    /// The wire name of this buffer's concrete kind.
    pub fn subtype(&self) -> &'static str {
        match self {
            Self::Buffer(_) => "Buffer",
            Self::ArrayBuffer(_) => "ArrayBuffer",
            Self::Int8(_) => "Int8Array",
            Self::Uint8(_) => "Uint8Array",
            Self::Uint8Clamped(_) => "Uint8ClampedArray",
            Self::Int16(_) => "Int16Array",
            Self::Uint16(_) => "Uint16Array",
            Self::Int32(_) => "Int32Array",
            Self::Uint32(_) => "Uint32Array",
            Self::Float32(_) => "Float32Array",
            Self::Float64(_) => "Float64Array",
        }
    }

    /// Number of elements (not bytes).
    pub fn len(&self) -> usize {
        match self {
            Self::Buffer(v) | Self::ArrayBuffer(v) | Self::Uint8(v) | Self::Uint8Clamped(v) => v.len(),
            Self::Int8(v) => v.len(),
            Self::Int16(v) => v.len(),
            Self::Uint16(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::Uint32(v) => v.len(),
            Self::Float32(v) => v.len(),
            Self::Float64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes the elements little-endian.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Self::Buffer(v) | Self::ArrayBuffer(v) | Self::Uint8(v) | Self::Uint8Clamped(v) => v.clone(),
            Self::Int8(v) => pack(v, |x| x.to_le_bytes()),
            Self::Int16(v) => pack(v, |x| x.to_le_bytes()),
            Self::Uint16(v) => pack(v, |x| x.to_le_bytes()),
            Self::Int32(v) => pack(v, |x| x.to_le_bytes()),
            Self::Uint32(v) => pack(v, |x| x.to_le_bytes()),
            Self::Float32(v) => pack(v, |x| x.to_le_bytes()),
            Self::Float64(v) => pack(v, |x| x.to_le_bytes()),
        }
    }

    /// Rebuilds a buffer from its wire parts.
    ///
    /// An unrecognized `subtype` yields a plain [`TypedBuffer::Buffer`] holding
    /// the raw bytes.
    pub fn from_le_bytes(subtype: &str, bytes: &[u8], length: usize) -> Result<Self> {
        let Some(width) = element_width(subtype) else {
            return Ok(Self::Buffer(bytes.to_vec()));
        };

        let expected = length.checked_mul(width).unwrap_or(usize::MAX);
        if expected != bytes.len() {
            return Err(CodecError::BufferLength {
                subtype: subtype.to_string(),
                expected,
                found: bytes.len(),
            });
        }

        let buffer = match subtype {
            "Buffer" => Self::Buffer(bytes.to_vec()),
            "ArrayBuffer" => Self::ArrayBuffer(bytes.to_vec()),
            "Uint8Array" => Self::Uint8(bytes.to_vec()),
            "Uint8ClampedArray" => Self::Uint8Clamped(bytes.to_vec()),
            "Int8Array" => Self::Int8(unpack(bytes, i8::from_le_bytes)),
            "Int16Array" => Self::Int16(unpack(bytes, i16::from_le_bytes)),
            "Uint16Array" => Self::Uint16(unpack(bytes, u16::from_le_bytes)),
            "Int32Array" => Self::Int32(unpack(bytes, i32::from_le_bytes)),
            "Uint32Array" => Self::Uint32(unpack(bytes, u32::from_le_bytes)),
            "Float32Array" => Self::Float32(unpack(bytes, f32::from_le_bytes)),
            "Float64Array" => Self::Float64(unpack(bytes, f64::from_le_bytes)),
            _ => Self::Buffer(bytes.to_vec()),
        };
        Ok(buffer)
    }
}

/// Bytes per element for a known subtype.
fn element_width(subtype: &str) -> Option<usize> {
    match subtype {
        "Buffer" | "ArrayBuffer" | "Int8Array" | "Uint8Array" | "Uint8ClampedArray" => Some(1),
        "Int16Array" | "Uint16Array" => Some(2),
        "Int32Array" | "Uint32Array" | "Float32Array" => Some(4),
        "Float64Array" => Some(8),
        _ => None,
    }
}

fn pack<T, const N: usize>(items: &[T], f: impl Fn(&T) -> [u8; N]) -> Vec<u8> {
    let mut out = Vec::with_capacity(items.len() * N);
    for item in items {
        out.extend_from_slice(&f(item));
    }
    out
}

fn unpack<T, const N: usize>(bytes: &[u8], f: impl Fn([u8; N]) -> T) -> Vec<T> {
    bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut word = [0u8; N];
            word.copy_from_slice(chunk);
            f(word)
        })
        .collect()
}
