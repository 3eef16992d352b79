//! Field-value codec: the serializer boundary consumed by backends.
//!
//! The contract is narrow: [`encode`] turns one field value into bytes plus a
//! [`TypeTag`]; [`decode`] reverses it given the field's declared
//! [`FieldKind`] (the object-store backend stores no tag -- the reading
//! process knows the schema). Text and integers ride as UTF-8 text, raw byte
//! sequences pass through, and everything else falls back to its JSON
//! encoding, which a decoder with matching schema knowledge can reverse.

use serde_json::Value;

use crate::component::FieldKind;
use crate::{Result, StoreError};

/// Media-type tag reported by [`encode`] for each produced byte payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    /// UTF-8 text payload.
    Text,
    /// Raw byte payload.
    Bytes,
}

impl TypeTag {
    /// Wire rendering of the tag.
    pub fn as_str(self) -> &'static str {
        match self {
            TypeTag::Text => "text/plain",
            TypeTag::Bytes => "application/octet-stream",
        }
    }
}

fn mismatch(kind: FieldKind, value: &Value) -> StoreError {
    StoreError::KindMismatch {
        kind,
        details: format!("value {value} does not fit"),
    }
}

/// Encode one field value to bytes plus its type tag.
///
/// `Null` encodes to an empty payload; backends normally skip writing null
/// fields entirely.
pub fn encode(kind: FieldKind, value: &Value) -> Result<(Vec<u8>, TypeTag)> {
    if value.is_null() {
        return Ok((Vec::new(), TypeTag::Bytes));
    }
    match kind {
        FieldKind::Integer => {
            let n = value.as_i64().ok_or_else(|| mismatch(kind, value))?;
            Ok((n.to_string().into_bytes(), TypeTag::Text))
        }
        FieldKind::Real => {
            let n = value.as_f64().ok_or_else(|| mismatch(kind, value))?;
            Ok((n.to_string().into_bytes(), TypeTag::Text))
        }
        FieldKind::Text => {
            let s = value.as_str().ok_or_else(|| mismatch(kind, value))?;
            Ok((s.as_bytes().to_vec(), TypeTag::Text))
        }
        FieldKind::Bytes => {
            let array = value.as_array().ok_or_else(|| mismatch(kind, value))?;
            let mut bytes = Vec::with_capacity(array.len());
            for item in array {
                let b = item
                    .as_u64()
                    .filter(|&b| b <= u8::MAX as u64)
                    .ok_or_else(|| mismatch(kind, value))?;
                bytes.push(b as u8);
            }
            Ok((bytes, TypeTag::Bytes))
        }
        FieldKind::Opaque => {
            let bytes = serde_json::to_vec(value).map_err(|e| StoreError::KindMismatch {
                kind,
                details: e.to_string(),
            })?;
            Ok((bytes, TypeTag::Bytes))
        }
    }
}

/// Decode one field value from bytes, driven by the declared field kind.
pub fn decode(kind: FieldKind, bytes: &[u8]) -> Result<Value> {
    let text_of = |bytes: &[u8]| -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| StoreError::KindMismatch {
            kind,
            details: e.to_string(),
        })
    };
    match kind {
        FieldKind::Integer => {
            let n: i64 = text_of(bytes)?
                .parse()
                .map_err(|e: std::num::ParseIntError| StoreError::KindMismatch {
                    kind,
                    details: e.to_string(),
                })?;
            Ok(Value::from(n))
        }
        FieldKind::Real => {
            let n: f64 = text_of(bytes)?
                .parse()
                .map_err(|e: std::num::ParseFloatError| StoreError::KindMismatch {
                    kind,
                    details: e.to_string(),
                })?;
            serde_json::Number::from_f64(n)
                .map(Value::Number)
                .ok_or_else(|| StoreError::KindMismatch {
                    kind,
                    details: format!("{n} is not a finite float"),
                })
        }
        FieldKind::Text => Ok(Value::String(text_of(bytes)?)),
        FieldKind::Bytes => Ok(Value::Array(
            bytes.iter().map(|&b| Value::from(b as u64)).collect(),
        )),
        FieldKind::Opaque => {
            serde_json::from_slice(bytes).map_err(|e| StoreError::KindMismatch {
                kind,
                details: e.to_string(),
            })
        }
    }
}
