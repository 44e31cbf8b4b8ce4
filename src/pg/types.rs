//! PostgreSQL type encoding and decoding.
//!
//! Parameters are always sent in binary format; results are requested in
//! binary for the extended protocol and arrive as text for simple queries.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use crate::driver::{DriverError, DriverResult};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    /// Lets the server infer the parameter type.
    pub const UNSPECIFIED: Oid = Oid(0);

    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const JSONB: Oid = Oid(3802);

    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME
        )
    }
}

// ============================================================================
// Values
// ============================================================================

/// A positional parameter or a decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Json(String),
    /// Types without a dedicated variant keep their raw bytes.
    Raw { oid: Oid, data: Vec<u8> },
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Type sent in the Parse message for this value.
    pub fn type_oid(&self) -> Oid {
        match self {
            Value::Null => Oid::UNSPECIFIED,
            Value::Bool(_) => Oid::BOOL,
            Value::Int2(_) => Oid::INT2,
            Value::Int4(_) => Oid::INT4,
            Value::Int8(_) => Oid::INT8,
            Value::Float4(_) => Oid::FLOAT4,
            Value::Float8(_) => Oid::FLOAT8,
            Value::Text(_) => Oid::TEXT,
            Value::Bytea(_) => Oid::BYTEA,
            Value::Json(_) => Oid::JSONB,
            Value::Raw { oid, .. } => *oid,
        }
    }

    /// Binary wire representation. NULL encodes to nothing; the caller
    /// writes a -1 length instead.
    pub fn encode_binary(&self) -> Vec<u8> {
        match self {
            Value::Null => Vec::new(),
            Value::Bool(v) => vec![u8::from(*v)],
            Value::Int2(v) => v.to_be_bytes().to_vec(),
            Value::Int4(v) => v.to_be_bytes().to_vec(),
            Value::Int8(v) => v.to_be_bytes().to_vec(),
            Value::Float4(v) => v.to_be_bytes().to_vec(),
            Value::Float8(v) => v.to_be_bytes().to_vec(),
            Value::Text(v) => v.as_bytes().to_vec(),
            Value::Bytea(v) => v.clone(),
            Value::Json(v) => {
                // jsonb binary format version 1
                let mut out = Vec::with_capacity(v.len() + 1);
                out.push(1);
                out.extend_from_slice(v.as_bytes());
                out
            }
            Value::Raw { data, .. } => data.clone(),
        }
    }

    /// Decode a binary-format column.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> DriverResult<Self> {
        match oid {
            Oid::BOOL => match data.first() {
                Some(b) => Ok(Value::Bool(*b != 0)),
                None => Err(DriverError::Type("Empty data for BOOL".to_string())),
            },
            Oid::INT2 => Ok(Value::Int2(i16::from_be_bytes(fixed(oid, data)?))),
            Oid::INT4 => Ok(Value::Int4(i32::from_be_bytes(fixed(oid, data)?))),
            Oid::INT8 => Ok(Value::Int8(i64::from_be_bytes(fixed(oid, data)?))),
            Oid::FLOAT4 => Ok(Value::Float4(f32::from_be_bytes(fixed(oid, data)?))),
            Oid::FLOAT8 => Ok(Value::Float8(f64::from_be_bytes(fixed(oid, data)?))),
            Oid::BYTEA => Ok(Value::Bytea(data.to_vec())),
            Oid::JSON => utf8(oid, data).map(Value::Json),
            Oid::JSONB => utf8(oid, data.get(1..).unwrap_or_default()).map(Value::Json),
            _ if oid.is_text_like() => utf8(oid, data).map(Value::Text),
            _ => Ok(Value::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
    }

    /// Decode a text-format column (simple query protocol).
    pub fn decode_text(oid: Oid, data: &[u8]) -> DriverResult<Self> {
        let text = utf8(oid, data)?;

        let parsed = match oid {
            Oid::BOOL => Value::Bool(matches!(text.as_str(), "t" | "true" | "1")),
            Oid::INT2 => Value::Int2(parse(oid, &text)?),
            Oid::INT4 => Value::Int4(parse(oid, &text)?),
            Oid::INT8 => Value::Int8(parse(oid, &text)?),
            Oid::FLOAT4 => Value::Float4(parse(oid, &text)?),
            Oid::FLOAT8 => Value::Float8(parse(oid, &text)?),
            Oid::JSON | Oid::JSONB => Value::Json(text),
            _ => Value::Text(text),
        };

        Ok(parsed)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int2(v) => Some(i64::from(*v)),
            Value::Int4(v) => Some(i64::from(*v)),
            Value::Int8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Json(s) => Some(s),
            _ => None,
        }
    }
}

fn fixed<const N: usize>(oid: Oid, data: &[u8]) -> DriverResult<[u8; N]> {
    data.try_into().map_err(|_| {
        DriverError::Type(format!(
            "Invalid length {} for type {}, expected {}",
            data.len(),
            oid.0,
            N
        ))
    })
}

fn utf8(oid: Oid, data: &[u8]) -> DriverResult<String> {
    String::from_utf8(data.to_vec())
        .map_err(|e| DriverError::Type(format!("Invalid UTF-8 for type {}: {}", oid.0, e)))
}

fn parse<T: std::str::FromStr>(oid: Oid, text: &str) -> DriverResult<T>
where
    T::Err: std::fmt::Display,
{
    text.parse::<T>()
        .map_err(|e| DriverError::Type(format!("Invalid value {:?} for type {}: {}", text, oid.0, e)))
}

// ============================================================================
// Conversions
// ============================================================================

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    String => Text,
    Vec<u8> => Bytea,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
