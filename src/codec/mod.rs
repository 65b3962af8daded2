//! Typed record codec.
//!
//! Converts between typed row values and their byte images, and produces
//! the total order on encoded keys that the store sorts by.
//!
//! - [`types`] - logical/encoded type descriptors and the shuffle schema
//! - [`value`] - runtime value representation
//! - [`rows`] - row encode/decode and key projection
//! - [`keys`] - order-preserving key encoding and comparison

pub mod keys;
pub mod rows;
pub mod types;
pub mod value;

pub use keys::key_order;
pub use rows::RowCodec;
pub use types::{
    EncodedField, EncodedKind, EncodedType, Field, LogicalType, ShuffleSchema, SortDirection,
    SortField,
};
pub use value::Value;
