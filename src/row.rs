//! Tagged row codec: a column vector encoded as count + per-column
//! `tag byte | payload`.
//!
//! Tags: `0 = nil`, `1 = bool`, `2 = i64`, `3 = f64`, `4 = string`,
//! `5 = bytes`. Both numeric tags decode into a single [`Value::Number`]
//! variant, matching the executor's single floating-point numeric
//! carrier (see Design Notes); the integer tag is still used on encode
//! whenever a number is integral, to preserve ordering and precision.

use crate::error::{Error, Result};

const TAG_NIL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_I64: u8 = 2;
const TAG_F64: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_BYTES: u8 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
}

/// Encodes `row` into `out`, appending rather than allocating a fresh
/// buffer so callers can reuse one across many rows.
pub fn marshal_row_into(row: &[Value], out: &mut Vec<u8>) {
    out.extend_from_slice(&(row.len() as u16).to_le_bytes());
    for value in row {
        match value {
            Value::Nil => out.push(TAG_NIL),
            Value::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(*b as u8);
            }
            Value::Number(n) => {
                if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n <= i64::MAX as f64 {
                    out.push(TAG_I64);
                    out.extend_from_slice(&(*n as i64).to_le_bytes());
                } else {
                    out.push(TAG_F64);
                    out.extend_from_slice(&n.to_le_bytes());
                }
            }
            Value::String(s) => {
                out.push(TAG_STRING);
                out.extend_from_slice(&(s.len() as u16).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                out.push(TAG_BYTES);
                out.extend_from_slice(&(b.len() as u16).to_le_bytes());
                out.extend_from_slice(b);
            }
        }
    }
}

pub fn marshal_row(row: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    marshal_row_into(row, &mut out);
    out
}

pub fn unmarshal_row(bytes: &[u8]) -> Result<Vec<Value>> {
    if bytes.len() < 2 {
        return Err(Error::Corrupted("truncated row column count"));
    }
    let count = u16::from_le_bytes(bytes[0..2].try_into().unwrap()) as usize;
    let mut pos = 2;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        if pos >= bytes.len() {
            return Err(Error::Corrupted("truncated row column"));
        }
        let tag = bytes[pos];
        pos += 1;
        let value = match tag {
            TAG_NIL => Value::Nil,
            TAG_BOOL => {
                if pos >= bytes.len() {
                    return Err(Error::Corrupted("truncated bool column"));
                }
                let b = bytes[pos] != 0;
                pos += 1;
                Value::Bool(b)
            }
            TAG_I64 => {
                if pos + 8 > bytes.len() {
                    return Err(Error::Corrupted("truncated i64 column"));
                }
                let n = i64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
                pos += 8;
                Value::Number(n as f64)
            }
            TAG_F64 => {
                if pos + 8 > bytes.len() {
                    return Err(Error::Corrupted("truncated f64 column"));
                }
                let n = f64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
                pos += 8;
                Value::Number(n)
            }
            TAG_STRING => {
                if pos + 2 > bytes.len() {
                    return Err(Error::Corrupted("truncated string length"));
                }
                let len = u16::from_le_bytes(bytes[pos..pos + 2].try_into().unwrap()) as usize;
                pos += 2;
                if pos + len > bytes.len() {
                    return Err(Error::Corrupted("truncated string column"));
                }
                let s = String::from_utf8(bytes[pos..pos + len].to_vec())
                    .map_err(|_| Error::Corrupted("non-utf8 string column"))?;
                pos += len;
                Value::String(s)
            }
            TAG_BYTES => {
                if pos + 2 > bytes.len() {
                    return Err(Error::Corrupted("truncated bytes length"));
                }
                let len = u16::from_le_bytes(bytes[pos..pos + 2].try_into().unwrap()) as usize;
                pos += 2;
                if pos + len > bytes.len() {
                    return Err(Error::Corrupted("truncated bytes column"));
                }
                let b = bytes[pos..pos + len].to_vec();
                pos += len;
                Value::Bytes(b)
            }
            _ => return Err(Error::Corrupted("unknown row column tag")),
        };
        out.push(value);
    }
    Ok(out)
}

/// Encodes a row's ordinal index as the 8-byte big-endian key its
/// B+Tree entry is stored under, so range scans return insertion order.
pub fn row_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}
