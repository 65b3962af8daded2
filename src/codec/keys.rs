//! Order-preserving key encoding.
//!
//! Keys are encoded so that plain lexicographic comparison of the encoded
//! bytes agrees with the logical lexicographic order of the key fields
//! under their sort directions. Each field begins with a presence byte
//! (missing sorts before present), followed by a memcmp-ordered payload:
//!
//! - integers: big-endian with the sign bit flipped
//! - floats: the IEEE total-order transform
//! - strings and binary: 0x00-escaped bytes with a 0x00 0x00 terminator,
//!   so a value sorts before every proper extension of itself
//! - structs: field images concatenated
//! - arrays: 0x01-prefixed elements with a 0x00 terminator
//!
//! A descending field is the bitwise inversion of its ascending image,
//! which reverses its ordering (and puts missing last).

use crate::codec::types::{EncodedKind, EncodedType, SortDirection};
use crate::codec::value::Value;
use crate::core::error::{ShuffleError, ShuffleResult};
use bytes::BytesMut;
use std::cmp::Ordering;

const PRESENT: u8 = 0x01;
const MISSING: u8 = 0x00;

/// The total order on encoded keys: plain byte comparison.
///
/// Reflexive, antisymmetric, transitive, and total; agrees with the
/// logical order by construction of the encoding.
pub fn key_order(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Encode one top-level key field, honoring its sort direction.
pub fn encode_key_field(
    value: &Value,
    typ: &EncodedType,
    direction: SortDirection,
    buf: &mut BytesMut,
) -> ShuffleResult<()> {
    let mut image = Vec::new();
    encode_ascending(value, typ, &mut image)?;
    match direction {
        SortDirection::Ascending => buf.extend_from_slice(&image),
        SortDirection::Descending => buf.extend(image.iter().map(|b| !b)),
    }
    Ok(())
}

/// Decode one top-level key field, honoring its sort direction.
pub fn decode_key_field(
    cur: &mut KeyCursor<'_>,
    typ: &EncodedType,
    direction: SortDirection,
) -> ShuffleResult<Value> {
    decode_ascending(cur, typ, direction == SortDirection::Descending)
}

fn encode_ascending(value: &Value, typ: &EncodedType, out: &mut Vec<u8>) -> ShuffleResult<()> {
    if value.is_missing() {
        out.push(MISSING);
        return Ok(());
    }
    out.push(PRESENT);
    match (&typ.kind, value) {
        (EncodedKind::Bool, Value::Bool(b)) => out.push(u8::from(*b)),
        (EncodedKind::Int32, Value::Int32(v)) => {
            out.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes());
        }
        (EncodedKind::Int64, Value::Int64(v)) => {
            out.extend_from_slice(&((*v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes());
        }
        (EncodedKind::Float64, Value::Float64(v)) => {
            let bits = v.to_bits();
            let ordered = if bits & 0x8000_0000_0000_0000 != 0 {
                !bits
            } else {
                bits ^ 0x8000_0000_0000_0000
            };
            out.extend_from_slice(&ordered.to_be_bytes());
        }
        (EncodedKind::Str, Value::Str(s)) => encode_escaped(s.as_bytes(), out),
        (EncodedKind::Binary, Value::Binary(b)) => encode_escaped(b, out),
        (EncodedKind::Struct(fields), Value::Struct(values)) => {
            if values.len() != fields.len() {
                return Err(ShuffleError::malformed_record(format!(
                    "key struct has {} values for {} fields",
                    values.len(),
                    fields.len()
                )));
            }
            for (value, field) in values.iter().zip(fields) {
                encode_ascending(value, &field.typ, out)?;
            }
        }
        (EncodedKind::Array(elem), Value::Array(values)) => {
            for value in values {
                out.push(0x01);
                encode_ascending(value, elem, out)?;
            }
            out.push(0x00);
        }
        (kind, value) => {
            return Err(ShuffleError::malformed_record(format!(
                "key value {value:?} does not fit encoded kind {kind:?}"
            )))
        }
    }
    Ok(())
}

/// Escape 0x00 as (0x00, 0xFF) and terminate with (0x00, 0x00); the
/// terminator sorts below any escaped content byte, so prefixes sort first.
fn encode_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xFF);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

fn decode_ascending(
    cur: &mut KeyCursor<'_>,
    typ: &EncodedType,
    inv: bool,
) -> ShuffleResult<Value> {
    match cur.take(inv)? {
        MISSING => return Ok(Value::Missing),
        PRESENT => {}
        other => {
            return Err(ShuffleError::malformed_record(format!(
                "invalid key presence byte {other:#04x}"
            )))
        }
    }
    Ok(match &typ.kind {
        EncodedKind::Bool => match cur.take(inv)? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => {
                return Err(ShuffleError::malformed_record(format!(
                    "invalid key bool byte {other}"
                )))
            }
        },
        EncodedKind::Int32 => {
            let raw = u32::from_be_bytes(cur.take_array::<4>(inv)?);
            Value::Int32((raw ^ 0x8000_0000) as i32)
        }
        EncodedKind::Int64 => {
            let raw = u64::from_be_bytes(cur.take_array::<8>(inv)?);
            Value::Int64((raw ^ 0x8000_0000_0000_0000) as i64)
        }
        EncodedKind::Float64 => {
            let ordered = u64::from_be_bytes(cur.take_array::<8>(inv)?);
            let bits = if ordered & 0x8000_0000_0000_0000 != 0 {
                ordered ^ 0x8000_0000_0000_0000
            } else {
                !ordered
            };
            Value::Float64(f64::from_bits(bits))
        }
        EncodedKind::Str => {
            let bytes = decode_escaped(cur, inv)?;
            Value::Str(
                String::from_utf8(bytes)
                    .map_err(|_| ShuffleError::malformed_record("key string is not valid UTF-8"))?,
            )
        }
        EncodedKind::Binary => Value::Binary(decode_escaped(cur, inv)?),
        EncodedKind::Struct(fields) => {
            let mut values = Vec::with_capacity(fields.len());
            for field in fields {
                values.push(decode_ascending(cur, &field.typ, inv)?);
            }
            Value::Struct(values)
        }
        EncodedKind::Array(elem) => {
            let mut values = Vec::new();
            loop {
                match cur.take(inv)? {
                    0x00 => break,
                    0x01 => values.push(decode_ascending(cur, elem, inv)?),
                    other => {
                        return Err(ShuffleError::malformed_record(format!(
                            "invalid key array flag {other:#04x}"
                        )))
                    }
                }
            }
            Value::Array(values)
        }
    })
}

fn decode_escaped(cur: &mut KeyCursor<'_>, inv: bool) -> ShuffleResult<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let b = cur.take(inv)?;
        if b != 0x00 {
            out.push(b);
            continue;
        }
        match cur.take(inv)? {
            0x00 => return Ok(out),
            0xFF => out.push(0x00),
            other => {
                return Err(ShuffleError::malformed_record(format!(
                    "invalid key escape byte {other:#04x}"
                )))
            }
        }
    }
}

/// Cursor over encoded key bytes with per-field byte inversion for
/// descending fields.
#[derive(Debug)]
pub struct KeyCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> KeyCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, inv: bool) -> ShuffleResult<u8> {
        let b = *self.data.get(self.pos).ok_or(ShuffleError::Truncated)?;
        self.pos += 1;
        Ok(if inv { !b } else { b })
    }

    fn take_array<const N: usize>(&mut self, inv: bool) -> ShuffleResult<[u8; N]> {
        let mut out = [0u8; N];
        for slot in &mut out {
            *slot = self.take(inv)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int32_type() -> EncodedType {
        EncodedType::required(EncodedKind::Int32)
    }

    fn str_type() -> EncodedType {
        EncodedType::required(EncodedKind::Str)
    }

    fn encode(value: &Value, typ: &EncodedType, direction: SortDirection) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_key_field(value, typ, direction, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_int32_order_spans_sign() {
        let typ = int32_type();
        let values = [i32::MIN, -7, -1, 0, 1, 42, i32::MAX];
        let encoded: Vec<Vec<u8>> = values
            .iter()
            .map(|v| encode(&Value::Int32(*v), &typ, SortDirection::Ascending))
            .collect();
        for pair in encoded.windows(2) {
            assert_eq!(key_order(&pair[0], &pair[1]), Ordering::Less);
        }
    }

    #[test]
    fn test_int32_descending_reverses() {
        let typ = int32_type();
        let a = encode(&Value::Int32(1), &typ, SortDirection::Descending);
        let b = encode(&Value::Int32(2), &typ, SortDirection::Descending);
        assert_eq!(key_order(&b, &a), Ordering::Less);
    }

    #[test]
    fn test_float_order() {
        let typ = EncodedType::required(EncodedKind::Float64);
        let values = [f64::NEG_INFINITY, -2.5, -0.0, 0.0, 1e-9, 3.5, f64::INFINITY];
        let encoded: Vec<Vec<u8>> = values
            .iter()
            .map(|v| encode(&Value::Float64(*v), &typ, SortDirection::Ascending))
            .collect();
        for pair in encoded.windows(2) {
            assert_ne!(key_order(&pair[0], &pair[1]), Ordering::Greater);
        }
    }

    #[test]
    fn test_string_prefix_sorts_first() {
        let typ = str_type();
        let a = encode(&Value::str("abc"), &typ, SortDirection::Ascending);
        let b = encode(&Value::str("abcd"), &typ, SortDirection::Ascending);
        assert_eq!(key_order(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_string_embedded_nul() {
        let typ = str_type();
        let plain = encode(&Value::str("ab"), &typ, SortDirection::Ascending);
        let with_nul = encode(&Value::str("ab\0"), &typ, SortDirection::Ascending);
        let longer = encode(&Value::str("ab\0c"), &typ, SortDirection::Ascending);
        assert_eq!(key_order(&plain, &with_nul), Ordering::Less);
        assert_eq!(key_order(&with_nul, &longer), Ordering::Less);
    }

    #[test]
    fn test_missing_sorts_first_ascending_last_descending() {
        let typ = EncodedType::optional(EncodedKind::Int32);
        let missing_asc = encode(&Value::Missing, &typ, SortDirection::Ascending);
        let present_asc = encode(&Value::Int32(i32::MIN), &typ, SortDirection::Ascending);
        assert_eq!(key_order(&missing_asc, &present_asc), Ordering::Less);

        let missing_desc = encode(&Value::Missing, &typ, SortDirection::Descending);
        let present_desc = encode(&Value::Int32(i32::MAX), &typ, SortDirection::Descending);
        assert_eq!(key_order(&present_desc, &missing_desc), Ordering::Less);
    }

    #[test]
    fn test_key_field_roundtrip() {
        for direction in [SortDirection::Ascending, SortDirection::Descending] {
            for value in [
                Value::Missing,
                Value::Int32(-123),
                Value::Int32(456),
            ] {
                let typ = EncodedType::optional(EncodedKind::Int32);
                let encoded = encode(&value, &typ, direction);
                let mut cur = KeyCursor::new(&encoded);
                let decoded = decode_key_field(&mut cur, &typ, direction).unwrap();
                assert_eq!(decoded, value);
                assert_eq!(cur.remaining(), 0);
            }
        }
    }

    #[test]
    fn test_string_roundtrip_with_nul() {
        let typ = str_type();
        for s in ["", "plain", "with\0nul", "\0\0"] {
            let encoded = encode(&Value::str(s), &typ, SortDirection::Descending);
            let mut cur = KeyCursor::new(&encoded);
            let decoded = decode_key_field(&mut cur, &typ, SortDirection::Descending).unwrap();
            assert_eq!(decoded, Value::str(s));
        }
    }
}
