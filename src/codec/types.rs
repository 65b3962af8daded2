//! Type descriptors for shuffle rows and keys.
//!
//! A shuffle is typed at START time by four descriptors: the row logical
//! type, the row encoded type, the ordered key field list, and the key
//! encoded type. Logical types name what a value *is*; encoded types add
//! per-node requiredness, which decides whether a missing bitmap slot is
//! reserved for the value.
//!
//! Descriptors travel on the wire as self-describing tagged trees; all
//! counts and lengths are 4-byte big-endian, names are length-prefixed
//! UTF-8.

use crate::core::error::{ShuffleError, ShuffleResult};
use bytes::{BufMut, BytesMut};

/// Wire tags for descriptor nodes.
const TAG_BOOL: u8 = 1;
const TAG_INT32: u8 = 2;
const TAG_INT64: u8 = 3;
const TAG_FLOAT64: u8 = 4;
const TAG_STR: u8 = 5;
const TAG_BINARY: u8 = 6;
const TAG_STRUCT: u8 = 7;
const TAG_ARRAY: u8 = 8;

/// A named field of a struct type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub typ: LogicalType,
}

/// Logical (virtual) type of a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalType {
    Bool,
    Int32,
    Int64,
    Float64,
    Str,
    Binary,
    Struct(Vec<Field>),
    Array(Box<LogicalType>),
}

impl LogicalType {
    /// Look up a top-level struct field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        match self {
            LogicalType::Struct(fields) => fields.iter().find(|f| f.name == name),
            _ => None,
        }
    }

    /// Index of a top-level struct field by name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        match self {
            LogicalType::Struct(fields) => fields.iter().position(|f| f.name == name),
            _ => None,
        }
    }

    /// Serialize this descriptor to the wire representation.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            LogicalType::Bool => buf.put_u8(TAG_BOOL),
            LogicalType::Int32 => buf.put_u8(TAG_INT32),
            LogicalType::Int64 => buf.put_u8(TAG_INT64),
            LogicalType::Float64 => buf.put_u8(TAG_FLOAT64),
            LogicalType::Str => buf.put_u8(TAG_STR),
            LogicalType::Binary => buf.put_u8(TAG_BINARY),
            LogicalType::Struct(fields) => {
                buf.put_u8(TAG_STRUCT);
                buf.put_u32(fields.len() as u32);
                for field in fields {
                    put_name(buf, &field.name);
                    field.typ.encode(buf);
                }
            }
            LogicalType::Array(elem) => {
                buf.put_u8(TAG_ARRAY);
                elem.encode(buf);
            }
        }
    }

    /// Parse a descriptor from the wire representation.
    pub fn decode(cur: &mut DescriptorCursor<'_>) -> ShuffleResult<Self> {
        match cur.take_u8()? {
            TAG_BOOL => Ok(LogicalType::Bool),
            TAG_INT32 => Ok(LogicalType::Int32),
            TAG_INT64 => Ok(LogicalType::Int64),
            TAG_FLOAT64 => Ok(LogicalType::Float64),
            TAG_STR => Ok(LogicalType::Str),
            TAG_BINARY => Ok(LogicalType::Binary),
            TAG_STRUCT => {
                let count = cur.take_u32()? as usize;
                let mut fields = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let name = cur.take_name()?;
                    let typ = LogicalType::decode(cur)?;
                    fields.push(Field { name, typ });
                }
                Ok(LogicalType::Struct(fields))
            }
            TAG_ARRAY => Ok(LogicalType::Array(Box::new(LogicalType::decode(cur)?))),
            tag => Err(ShuffleError::malformed_record(format!(
                "unknown logical type tag {tag}"
            ))),
        }
    }
}

/// A named field of an encoded struct type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedField {
    pub name: String,
    pub typ: EncodedType,
}

/// Physical layout of an encoded value: its shape plus requiredness.
///
/// Optional (non-required) values occupy a slot in the enclosing missing
/// bitmap; required values never do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedType {
    pub required: bool,
    pub kind: EncodedKind,
}

/// Shape of an encoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedKind {
    Bool,
    Int32,
    Int64,
    Float64,
    Str,
    Binary,
    Struct(Vec<EncodedField>),
    Array(Box<EncodedType>),
}

impl EncodedType {
    /// A required value of the given shape.
    pub fn required(kind: EncodedKind) -> Self {
        Self {
            required: true,
            kind,
        }
    }

    /// An optional value of the given shape.
    pub fn optional(kind: EncodedKind) -> Self {
        Self {
            required: false,
            kind,
        }
    }

    /// Struct fields, if this is a struct.
    pub fn struct_fields(&self) -> Option<&[EncodedField]> {
        match &self.kind {
            EncodedKind::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    /// The logical type this layout encodes.
    pub fn logical(&self) -> LogicalType {
        match &self.kind {
            EncodedKind::Bool => LogicalType::Bool,
            EncodedKind::Int32 => LogicalType::Int32,
            EncodedKind::Int64 => LogicalType::Int64,
            EncodedKind::Float64 => LogicalType::Float64,
            EncodedKind::Str => LogicalType::Str,
            EncodedKind::Binary => LogicalType::Binary,
            EncodedKind::Struct(fields) => LogicalType::Struct(
                fields
                    .iter()
                    .map(|f| Field {
                        name: f.name.clone(),
                        typ: f.typ.logical(),
                    })
                    .collect(),
            ),
            EncodedKind::Array(elem) => LogicalType::Array(Box::new(elem.logical())),
        }
    }

    /// Serialize this descriptor to the wire representation.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(self.required));
        match &self.kind {
            EncodedKind::Bool => buf.put_u8(TAG_BOOL),
            EncodedKind::Int32 => buf.put_u8(TAG_INT32),
            EncodedKind::Int64 => buf.put_u8(TAG_INT64),
            EncodedKind::Float64 => buf.put_u8(TAG_FLOAT64),
            EncodedKind::Str => buf.put_u8(TAG_STR),
            EncodedKind::Binary => buf.put_u8(TAG_BINARY),
            EncodedKind::Struct(fields) => {
                buf.put_u8(TAG_STRUCT);
                buf.put_u32(fields.len() as u32);
                for field in fields {
                    put_name(buf, &field.name);
                    field.typ.encode(buf);
                }
            }
            EncodedKind::Array(elem) => {
                buf.put_u8(TAG_ARRAY);
                elem.encode(buf);
            }
        }
    }

    /// Parse a descriptor from the wire representation.
    pub fn decode(cur: &mut DescriptorCursor<'_>) -> ShuffleResult<Self> {
        let required = match cur.take_u8()? {
            0 => false,
            1 => true,
            other => {
                return Err(ShuffleError::malformed_record(format!(
                    "invalid requiredness byte {other}"
                )))
            }
        };
        let kind = match cur.take_u8()? {
            TAG_BOOL => EncodedKind::Bool,
            TAG_INT32 => EncodedKind::Int32,
            TAG_INT64 => EncodedKind::Int64,
            TAG_FLOAT64 => EncodedKind::Float64,
            TAG_STR => EncodedKind::Str,
            TAG_BINARY => EncodedKind::Binary,
            TAG_STRUCT => {
                let count = cur.take_u32()? as usize;
                let mut fields = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let name = cur.take_name()?;
                    let typ = EncodedType::decode(cur)?;
                    fields.push(EncodedField { name, typ });
                }
                EncodedKind::Struct(fields)
            }
            TAG_ARRAY => EncodedKind::Array(Box::new(EncodedType::decode(cur)?)),
            tag => {
                return Err(ShuffleError::malformed_record(format!(
                    "unknown encoded type tag {tag}"
                )))
            }
        };
        Ok(EncodedType { required, kind })
    }
}

/// Sort direction of one key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    /// Wire byte for this direction.
    pub fn as_byte(self) -> u8 {
        match self {
            SortDirection::Ascending => 0,
            SortDirection::Descending => 1,
        }
    }

    /// Parse a direction from its wire byte.
    pub fn from_byte(b: u8) -> ShuffleResult<Self> {
        match b {
            0 => Ok(SortDirection::Ascending),
            1 => Ok(SortDirection::Descending),
            other => Err(ShuffleError::malformed_record(format!(
                "invalid sort direction byte {other}"
            ))),
        }
    }
}

/// One entry of the ordered key field list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    pub name: String,
    pub direction: SortDirection,
}

impl SortField {
    pub fn ascending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// The full type description of a shuffle, fixed at START.
#[derive(Debug, Clone, PartialEq)]
pub struct ShuffleSchema {
    /// Logical row type; must be a struct.
    pub row_type: LogicalType,
    /// Physical layout of rows.
    pub row_encoded: EncodedType,
    /// Ordered key field list; defines the lexicographic sort order.
    pub key_fields: Vec<SortField>,
    /// Physical layout of keys; must be a struct over the key fields.
    pub key_encoded: EncodedType,
}

impl ShuffleSchema {
    /// Validate the schema's internal consistency.
    ///
    /// The key type must be a structural prefix of the row type in the
    /// field sense: every key field name must exist in the row type with
    /// the same logical element type, and the key encoded struct must list
    /// exactly the key fields in order.
    pub fn validate(&self) -> ShuffleResult<()> {
        let row_fields = match &self.row_type {
            LogicalType::Struct(fields) => fields,
            other => {
                return Err(ShuffleError::type_mismatch(format!(
                    "row type must be a struct, got {other:?}"
                )))
            }
        };
        if self.row_encoded.logical() != self.row_type {
            return Err(ShuffleError::type_mismatch(
                "row encoded type does not match row logical type",
            ));
        }
        if self.key_fields.is_empty() {
            return Err(ShuffleError::type_mismatch("key field list is empty"));
        }

        let key_struct = self.key_encoded.struct_fields().ok_or_else(|| {
            ShuffleError::type_mismatch("key encoded type must be a struct")
        })?;
        if key_struct.len() != self.key_fields.len() {
            return Err(ShuffleError::type_mismatch(format!(
                "key encoded type has {} fields, key list has {}",
                key_struct.len(),
                self.key_fields.len()
            )));
        }

        for (sort_field, key_field) in self.key_fields.iter().zip(key_struct) {
            if sort_field.name != key_field.name {
                return Err(ShuffleError::type_mismatch(format!(
                    "key encoded field '{}' does not match sort field '{}'",
                    key_field.name, sort_field.name
                )));
            }
            let row_field = row_fields
                .iter()
                .find(|f| f.name == sort_field.name)
                .ok_or_else(|| {
                    ShuffleError::type_mismatch(format!(
                        "key field '{}' not present in row type",
                        sort_field.name
                    ))
                })?;
            if key_field.typ.logical() != row_field.typ {
                return Err(ShuffleError::type_mismatch(format!(
                    "key field '{}' has type {:?}, row has {:?}",
                    sort_field.name,
                    key_field.typ.logical(),
                    row_field.typ
                )));
            }
        }
        Ok(())
    }

    /// For each key field, its index in the row struct.
    ///
    /// Only meaningful after `validate()` succeeded.
    pub fn key_indices(&self) -> Vec<usize> {
        self.key_fields
            .iter()
            .filter_map(|f| self.row_type.field_index(&f.name))
            .collect()
    }
}

/// Write a length-prefixed UTF-8 name.
fn put_name(buf: &mut BytesMut, name: &str) {
    buf.put_u32(name.len() as u32);
    buf.put_slice(name.as_bytes());
}

/// A bounds-checked cursor over in-memory descriptor bytes.
///
/// Running past the end yields `Truncated`, matching the stream-level
/// failure mode for short reads.
#[derive(Debug)]
pub struct DescriptorCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DescriptorCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take_u8(&mut self) -> ShuffleResult<u8> {
        let b = *self.data.get(self.pos).ok_or(ShuffleError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn take_u32(&mut self) -> ShuffleResult<u32> {
        let bytes = self.take_slice(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn take_slice(&mut self, len: usize) -> ShuffleResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(ShuffleError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_name(&mut self) -> ShuffleResult<String> {
        let len = self.take_u32()? as usize;
        let bytes = self.take_slice(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ShuffleError::malformed_record("field name is not valid UTF-8"))
    }
}
