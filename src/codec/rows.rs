//! Row encoding and decoding.
//!
//! Rows are encoded against their [`EncodedType`]: structs carry a missing
//! bitmap with one bit per optional field, scalars are fixed-width
//! big-endian, strings and binary are 4-byte length-prefixed, arrays are
//! count-prefixed with their own element bitmap. The layout is fully
//! determined by the descriptor, so `decode(encode(r)) == r`.

use crate::codec::keys;
use crate::codec::types::{
    DescriptorCursor, EncodedKind, EncodedType, ShuffleSchema, SortDirection,
};
use crate::codec::value::Value;
use crate::core::error::{ShuffleError, ShuffleResult};
use bytes::{BufMut, Bytes, BytesMut};

/// Encoder/decoder for one shuffle's rows and keys.
///
/// Constructed from a validated [`ShuffleSchema`]; the same codec instance
/// serves every connection of the shuffle.
#[derive(Debug, Clone)]
pub struct RowCodec {
    row_encoded: EncodedType,
    key_encoded: EncodedType,
    key_directions: Vec<SortDirection>,
    key_indices: Vec<usize>,
}

impl RowCodec {
    /// Build a codec from a schema, validating it first.
    pub fn new(schema: &ShuffleSchema) -> ShuffleResult<Self> {
        schema.validate()?;
        Ok(Self {
            row_encoded: schema.row_encoded.clone(),
            key_encoded: schema.key_encoded.clone(),
            key_directions: schema.key_fields.iter().map(|f| f.direction).collect(),
            key_indices: schema.key_indices(),
        })
    }

    /// Encode a row value to its byte image.
    pub fn encode_row(&self, row: &Value) -> ShuffleResult<Bytes> {
        let mut buf = BytesMut::new();
        encode_value(row, &self.row_encoded, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a row from its byte image.
    ///
    /// Trailing bytes after the row are a framing violation.
    pub fn decode_row(&self, bytes: &[u8]) -> ShuffleResult<Value> {
        let mut cur = DescriptorCursor::new(bytes);
        let value = decode_value(&mut cur, &self.row_encoded)?;
        if cur.remaining() != 0 {
            return Err(ShuffleError::malformed_record(format!(
                "{} trailing bytes after row",
                cur.remaining()
            )));
        }
        Ok(value)
    }

    /// Project the key fields out of a row and encode them in the
    /// order-preserving key layout.
    pub fn encode_key(&self, row: &Value) -> ShuffleResult<Bytes> {
        let fields = match row {
            Value::Struct(fields) => fields,
            _ => return Err(ShuffleError::malformed_record("row value is not a struct")),
        };
        let mut key_values = Vec::with_capacity(self.key_indices.len());
        for &idx in &self.key_indices {
            let value = fields.get(idx).ok_or_else(|| {
                ShuffleError::malformed_record(format!("row has no field index {idx}"))
            })?;
            key_values.push(value.clone());
        }
        self.encode_key_values(&key_values)
    }

    /// Encode already-projected key field values.
    pub fn encode_key_values(&self, values: &[Value]) -> ShuffleResult<Bytes> {
        let key_fields = self
            .key_encoded
            .struct_fields()
            .ok_or_else(|| ShuffleError::malformed_record("key encoded type is not a struct"))?;
        if values.len() != key_fields.len() {
            return Err(ShuffleError::malformed_record(format!(
                "expected {} key values, got {}",
                key_fields.len(),
                values.len()
            )));
        }
        let mut buf = BytesMut::new();
        for ((value, field), direction) in
            values.iter().zip(key_fields).zip(&self.key_directions)
        {
            keys::encode_key_field(value, &field.typ, *direction, &mut buf)?;
        }
        Ok(buf.freeze())
    }

    /// Decode an encoded key back into its field values.
    pub fn decode_key(&self, bytes: &[u8]) -> ShuffleResult<Value> {
        let key_fields = self
            .key_encoded
            .struct_fields()
            .ok_or_else(|| ShuffleError::malformed_record("key encoded type is not a struct"))?;
        let mut cur = keys::KeyCursor::new(bytes);
        let mut values = Vec::with_capacity(key_fields.len());
        for (field, direction) in key_fields.iter().zip(&self.key_directions) {
            values.push(keys::decode_key_field(&mut cur, &field.typ, *direction)?);
        }
        if cur.remaining() != 0 {
            return Err(ShuffleError::malformed_record(format!(
                "{} trailing bytes after key",
                cur.remaining()
            )));
        }
        Ok(Value::Struct(values))
    }
}

fn encode_value(value: &Value, typ: &EncodedType, buf: &mut BytesMut) -> ShuffleResult<()> {
    if value.is_missing() {
        // Presence is tracked by the enclosing bitmap; a bare missing value
        // can only appear under an optional descriptor.
        return Err(ShuffleError::malformed_record(
            "missing value outside an optional slot",
        ));
    }
    match (&typ.kind, value) {
        (EncodedKind::Bool, Value::Bool(b)) => buf.put_u8(u8::from(*b)),
        (EncodedKind::Int32, Value::Int32(v)) => buf.put_i32(*v),
        (EncodedKind::Int64, Value::Int64(v)) => buf.put_i64(*v),
        (EncodedKind::Float64, Value::Float64(v)) => buf.put_u64(v.to_bits()),
        (EncodedKind::Str, Value::Str(s)) => {
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        (EncodedKind::Binary, Value::Binary(b)) => {
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
        }
        (EncodedKind::Struct(fields), Value::Struct(values)) => {
            if values.len() != fields.len() {
                return Err(ShuffleError::malformed_record(format!(
                    "struct has {} values for {} fields",
                    values.len(),
                    fields.len()
                )));
            }
            encode_missing_bitmap(
                buf,
                fields.iter().map(|f| f.typ.required),
                values.iter().map(Value::is_missing),
            )?;
            for (value, field) in values.iter().zip(fields) {
                if !value.is_missing() {
                    encode_value(value, &field.typ, buf)?;
                }
            }
        }
        (EncodedKind::Array(elem), Value::Array(values)) => {
            buf.put_u32(values.len() as u32);
            encode_missing_bitmap(
                buf,
                values.iter().map(|_| elem.required),
                values.iter().map(Value::is_missing),
            )?;
            for value in values {
                if !value.is_missing() {
                    encode_value(value, elem, buf)?;
                }
            }
        }
        (kind, value) => {
            return Err(ShuffleError::malformed_record(format!(
                "value {value:?} does not fit encoded kind {kind:?}"
            )))
        }
    }
    Ok(())
}

/// Write the missing bitmap for a run of slots.
///
/// One bit per *optional* slot, set when the value is missing; required
/// slots consume no bit and must be present.
fn encode_missing_bitmap(
    buf: &mut BytesMut,
    required: impl Iterator<Item = bool>,
    missing: impl Iterator<Item = bool>,
) -> ShuffleResult<()> {
    let mut bits: Vec<bool> = Vec::new();
    for (req, miss) in required.zip(missing) {
        if req {
            if miss {
                return Err(ShuffleError::malformed_record(
                    "missing value in required slot",
                ));
            }
        } else {
            bits.push(miss);
        }
    }
    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (i, &bit) in chunk.iter().enumerate() {
            if bit {
                byte |= 1 << i;
            }
        }
        buf.put_u8(byte);
    }
    Ok(())
}

fn decode_value(cur: &mut DescriptorCursor<'_>, typ: &EncodedType) -> ShuffleResult<Value> {
    Ok(match &typ.kind {
        EncodedKind::Bool => match cur.take_u8()? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => {
                return Err(ShuffleError::malformed_record(format!(
                    "invalid bool byte {other}"
                )))
            }
        },
        EncodedKind::Int32 => {
            let b = cur.take_slice(4)?;
            Value::Int32(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        }
        EncodedKind::Int64 => {
            let b = cur.take_slice(8)?;
            Value::Int64(i64::from_be_bytes([
                b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            ]))
        }
        EncodedKind::Float64 => {
            let b = cur.take_slice(8)?;
            Value::Float64(f64::from_bits(u64::from_be_bytes([
                b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            ])))
        }
        EncodedKind::Str => {
            let len = cur.take_u32()? as usize;
            let bytes = cur.take_slice(len)?;
            Value::Str(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| ShuffleError::malformed_record("string is not valid UTF-8"))?,
            )
        }
        EncodedKind::Binary => {
            let len = cur.take_u32()? as usize;
            Value::Binary(cur.take_slice(len)?.to_vec())
        }
        EncodedKind::Struct(fields) => {
            let missing = decode_missing_bitmap(cur, fields.iter().map(|f| f.typ.required))?;
            let mut values = Vec::with_capacity(fields.len());
            for (field, miss) in fields.iter().zip(missing) {
                if miss {
                    values.push(Value::Missing);
                } else {
                    values.push(decode_value(cur, &field.typ)?);
                }
            }
            Value::Struct(values)
        }
        EncodedKind::Array(elem) => {
            let count = cur.take_u32()? as usize;
            let missing = decode_missing_bitmap(cur, (0..count).map(|_| elem.required))?;
            let mut values = Vec::with_capacity(count.min(64 * 1024));
            for miss in missing {
                if miss {
                    values.push(Value::Missing);
                } else {
                    values.push(decode_value(cur, elem)?);
                }
            }
            Value::Array(values)
        }
    })
}

/// Read the missing bitmap for a run of slots; required slots are always
/// present and consume no bit.
fn decode_missing_bitmap(
    cur: &mut DescriptorCursor<'_>,
    required: impl Iterator<Item = bool>,
) -> ShuffleResult<Vec<bool>> {
    let required: Vec<bool> = required.collect();
    let optional_count = required.iter().filter(|r| !**r).count();
    let bitmap = cur.take_slice(optional_count.div_ceil(8))?;
    let mut missing = Vec::with_capacity(required.len());
    let mut bit = 0usize;
    for req in required {
        if req {
            missing.push(false);
        } else {
            missing.push(bitmap[bit / 8] & (1 << (bit % 8)) != 0);
            bit += 1;
        }
    }
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::types::{EncodedField, Field, LogicalType, SortField};

    fn int_string_schema() -> ShuffleSchema {
        ShuffleSchema {
            row_type: LogicalType::Struct(vec![
                Field {
                    name: "a".to_string(),
                    typ: LogicalType::Int32,
                },
                Field {
                    name: "b".to_string(),
                    typ: LogicalType::Str,
                },
            ]),
            row_encoded: EncodedType::required(EncodedKind::Struct(vec![
                EncodedField {
                    name: "a".to_string(),
                    typ: EncodedType::required(EncodedKind::Int32),
                },
                EncodedField {
                    name: "b".to_string(),
                    typ: EncodedType::optional(EncodedKind::Str),
                },
            ])),
            key_fields: vec![SortField::ascending("a")],
            key_encoded: EncodedType::required(EncodedKind::Struct(vec![EncodedField {
                name: "a".to_string(),
                typ: EncodedType::required(EncodedKind::Int32),
            }])),
        }
    }

    #[test]
    fn test_row_roundtrip() {
        let codec = RowCodec::new(&int_string_schema()).unwrap();
        let row = Value::row(vec![Value::Int32(7), Value::str("hello")]);
        let encoded = codec.encode_row(&row).unwrap();
        assert_eq!(codec.decode_row(&encoded).unwrap(), row);
    }

    #[test]
    fn test_row_roundtrip_missing_optional() {
        let codec = RowCodec::new(&int_string_schema()).unwrap();
        let row = Value::row(vec![Value::Int32(7), Value::Missing]);
        let encoded = codec.encode_row(&row).unwrap();
        assert_eq!(codec.decode_row(&encoded).unwrap(), row);
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let codec = RowCodec::new(&int_string_schema()).unwrap();
        let row = Value::row(vec![Value::Missing, Value::str("x")]);
        assert!(matches!(
            codec.encode_row(&row),
            Err(ShuffleError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let codec = RowCodec::new(&int_string_schema()).unwrap();
        let row = Value::row(vec![Value::Int32(7), Value::str("hi")]);
        let mut encoded = codec.encode_row(&row).unwrap().to_vec();
        encoded.push(0xAB);
        assert!(matches!(
            codec.decode_row(&encoded),
            Err(ShuffleError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_truncated_row() {
        let codec = RowCodec::new(&int_string_schema()).unwrap();
        let row = Value::row(vec![Value::Int32(7), Value::str("hello")]);
        let encoded = codec.encode_row(&row).unwrap();
        assert!(matches!(
            codec.decode_row(&encoded[..encoded.len() - 2]),
            Err(ShuffleError::Truncated)
        ));
    }

    #[test]
    fn test_array_roundtrip() {
        let schema = ShuffleSchema {
            row_type: LogicalType::Struct(vec![
                Field {
                    name: "k".to_string(),
                    typ: LogicalType::Int64,
                },
                Field {
                    name: "vals".to_string(),
                    typ: LogicalType::Array(Box::new(LogicalType::Float64)),
                },
            ]),
            row_encoded: EncodedType::required(EncodedKind::Struct(vec![
                EncodedField {
                    name: "k".to_string(),
                    typ: EncodedType::required(EncodedKind::Int64),
                },
                EncodedField {
                    name: "vals".to_string(),
                    typ: EncodedType::required(EncodedKind::Array(Box::new(
                        EncodedType::optional(EncodedKind::Float64),
                    ))),
                },
            ])),
            key_fields: vec![SortField::ascending("k")],
            key_encoded: EncodedType::required(EncodedKind::Struct(vec![EncodedField {
                name: "k".to_string(),
                typ: EncodedType::required(EncodedKind::Int64),
            }])),
        };
        let codec = RowCodec::new(&schema).unwrap();
        let row = Value::row(vec![
            Value::Int64(-5),
            Value::Array(vec![Value::Float64(1.5), Value::Missing, Value::Float64(-0.25)]),
        ]);
        let encoded = codec.encode_row(&row).unwrap();
        assert_eq!(codec.decode_row(&encoded).unwrap(), row);
    }

    #[test]
    fn test_key_projection() {
        let codec = RowCodec::new(&int_string_schema()).unwrap();
        let low = codec
            .encode_key(&Value::row(vec![Value::Int32(1), Value::str("y")]))
            .unwrap();
        let high = codec
            .encode_key(&Value::row(vec![Value::Int32(2), Value::str("a")]))
            .unwrap();
        assert!(low < high);
        assert_eq!(
            codec.decode_key(&low).unwrap(),
            Value::Struct(vec![Value::Int32(1)])
        );
    }
}
