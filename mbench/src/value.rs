//! Typed values carried in command arguments, response payloads and records.
//!
//! Every multi-byte field is little-endian. Strings are a 4-byte length
//! followed by that many bytes of UTF-8.

use std::fmt::{self, Display};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ValueError {
    #[error("needed {needed} more bytes, only {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("{0} is not a valid bool encoding")]
    InvalidBool(u8),
    #[error("string length {0} is negative")]
    NegativeLength(i32),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Bool,
    Byte,
    Short,
    Int,
    Float,
    Long,
    Double,
    String,
}

impl ValueType {
    /// Encoded width, `None` for the length-prefixed string.
    #[must_use]
    pub const fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Bool | Self::Byte => Some(1),
            Self::Short => Some(2),
            Self::Int | Self::Float => Some(4),
            Self::Long | Self::Double => Some(8),
            Self::String => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TypedValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
}

// floats compare by bit pattern so that a decoded NaN equals the encoded one
impl PartialEq for TypedValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Byte(a), Self::Byte(b)) => a == b,
            (Self::Short(a), Self::Short(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(x) => write!(f, "{x}"),
            Self::Byte(x) => write!(f, "{x}"),
            Self::Short(x) => write!(f, "{x}"),
            Self::Int(x) => write!(f, "{x}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Long(x) => write!(f, "{x}"),
            Self::Double(x) => write!(f, "{x}"),
            Self::String(x) => write!(f, "{x:?}"),
        }
    }
}

impl TypedValue {
    #[must_use]
    pub const fn value_type(&self) -> ValueType {
        match self {
            Self::Bool(_) => ValueType::Bool,
            Self::Byte(_) => ValueType::Byte,
            Self::Short(_) => ValueType::Short,
            Self::Int(_) => ValueType::Int,
            Self::Float(_) => ValueType::Float,
            Self::Long(_) => ValueType::Long,
            Self::Double(_) => ValueType::Double,
            Self::String(_) => ValueType::String,
        }
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::String(s) => size_of::<i32>() + s.len(),
            other => other.value_type().fixed_width().unwrap_or_default(),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Bool(x) => out.push(u8::from(*x)),
            Self::Byte(x) => out.extend_from_slice(&x.to_le_bytes()),
            Self::Short(x) => out.extend_from_slice(&x.to_le_bytes()),
            Self::Int(x) => out.extend_from_slice(&x.to_le_bytes()),
            Self::Float(x) => out.extend_from_slice(&x.to_le_bytes()),
            Self::Long(x) => out.extend_from_slice(&x.to_le_bytes()),
            Self::Double(x) => out.extend_from_slice(&x.to_le_bytes()),
            Self::String(s) => encode_str(s, out),
        }
    }

    pub fn decode(value_type: ValueType, reader: &mut ByteReader<'_>) -> Result<Self, ValueError> {
        Ok(match value_type {
            ValueType::Bool => match reader.read_array::<1>()?[0] {
                0 => Self::Bool(false),
                1 => Self::Bool(true),
                other => return Err(ValueError::InvalidBool(other)),
            },
            ValueType::Byte => Self::Byte(i8::from_le_bytes(reader.read_array()?)),
            ValueType::Short => Self::Short(i16::from_le_bytes(reader.read_array()?)),
            ValueType::Int => Self::Int(reader.read_i32()?),
            ValueType::Float => Self::Float(f32::from_le_bytes(reader.read_array()?)),
            ValueType::Long => Self::Long(reader.read_i64()?),
            ValueType::Double => Self::Double(f64::from_le_bytes(reader.read_array()?)),
            ValueType::String => {
                let length = reader.read_i32()?;
                let length =
                    usize::try_from(length).map_err(|_| ValueError::NegativeLength(length))?;
                let bytes = reader.read_slice(length)?;

                Self::String(
                    std::str::from_utf8(bytes)
                        .map_err(|_| ValueError::InvalidUtf8)?
                        .to_owned(),
                )
            }
        })
    }
}

pub fn encode_str(s: &str, out: &mut Vec<u8>) {
    // lengths past i32::MAX cannot be framed, callers bound their strings well below that
    let length = i32::try_from(s.len()).unwrap_or(i32::MAX);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Cursor over a byte slice that never reads past its end.
#[derive(Debug)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], ValueError> {
        if len > self.remaining() {
            return Err(ValueError::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }

        let slice = &self.bytes[self.position..self.position + len];
        self.position += len;

        Ok(slice)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ValueError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.read_slice(N)?);

        Ok(array)
    }

    pub fn read_i32(&mut self) -> Result<i32, ValueError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, ValueError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }
}
