//! Wire protocol framing.
//!
//! Every request is one opcode byte, the 16-byte shuffle identifier (for
//! all opcodes except START and EOS), then the opcode payload. Multi-byte
//! integers are big-endian; strings and byte arrays carry a 4-byte length
//! prefix. PUT, GET, and PARTITION_BOUNDS payloads are streams of
//! (continue-flag, block) pairs terminated by a zero flag, so both sides
//! can process record by record without buffering whole batches.
//!
//! A PUT payload opens with a 16-byte batch token, minted by the client
//! and stable across retries of the same batch; the server uses it to
//! apply each batch exactly once even when the acknowledgement is lost.
//!
//! An empty key block in GET means the interval is unbounded on that side
//! (encoded keys are never empty).

use crate::codec::types::{DescriptorCursor, EncodedType, LogicalType, SortDirection, SortField};
use crate::codec::ShuffleSchema;
use crate::core::error::{ShuffleError, ShuffleResult};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length of the opaque shuffle identifier.
pub const SHUFFLE_ID_LEN: usize = 16;
/// Length of a transport session token.
pub const SESSION_TOKEN_LEN: usize = 32;
/// Length of the server-minted per-connection UUID.
pub const CONNECTION_UUID_LEN: usize = 16;
/// Length of the client-minted PUT batch token.
pub const BATCH_TOKEN_LEN: usize = 16;
/// Transport handshake success byte.
pub const HANDSHAKE_OK: u8 = 1;

/// Continue flag inside a record stream.
pub const STREAM_CONTINUE: u8 = 1;
/// Terminator flag inside a record stream.
pub const STREAM_END: u8 = 0;
/// Acknowledgement byte for PUT and STOP.
pub const ACK: u8 = 0;

/// Upper bound on any single length-prefixed block; larger lengths are a
/// framing violation rather than an allocation request.
pub const MAX_BLOCK_LEN: usize = 256 * 1024 * 1024;

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Start = 1,
    Put = 2,
    Get = 3,
    Stop = 4,
    PartitionBounds = 5,
    Eos = 255,
}

impl OpCode {
    /// Parse an opcode byte.
    pub fn from_byte(b: u8) -> ShuffleResult<Self> {
        match b {
            1 => Ok(OpCode::Start),
            2 => Ok(OpCode::Put),
            3 => Ok(OpCode::Get),
            4 => Ok(OpCode::Stop),
            5 => Ok(OpCode::PartitionBounds),
            255 => Ok(OpCode::Eos),
            other => Err(ShuffleError::malformed_request(format!(
                "unknown opcode {other}"
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether the 16-byte shuffle identifier follows the opcode.
    pub fn carries_identifier(self) -> bool {
        !matches!(self, OpCode::Start | OpCode::Eos)
    }
}

pub async fn read_u8<R: AsyncRead + Unpin>(r: &mut R) -> ShuffleResult<u8> {
    r.read_u8().await.map_err(ShuffleError::from_io)
}

pub async fn read_u32<R: AsyncRead + Unpin>(r: &mut R) -> ShuffleResult<u32> {
    r.read_u32().await.map_err(ShuffleError::from_io)
}

/// Read exactly `N` bytes.
pub async fn read_array<const N: usize, R: AsyncRead + Unpin>(
    r: &mut R,
) -> ShuffleResult<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).await.map_err(ShuffleError::from_io)?;
    Ok(buf)
}

/// Read a 4-byte length-prefixed block.
pub async fn read_block<R: AsyncRead + Unpin>(r: &mut R) -> ShuffleResult<Bytes> {
    let len = read_u32(r).await? as usize;
    if len > MAX_BLOCK_LEN {
        return Err(ShuffleError::malformed_request(format!(
            "block length {len} exceeds limit"
        )));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await.map_err(ShuffleError::from_io)?;
    Ok(Bytes::from(buf))
}

/// Read a length-prefixed UTF-8 string.
pub async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> ShuffleResult<String> {
    let bytes = read_block(r).await?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ShuffleError::malformed_request("string is not valid UTF-8"))
}

/// Write a 4-byte length-prefixed block.
pub async fn write_block<W: AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> ShuffleResult<()> {
    w.write_u32(bytes.len() as u32)
        .await
        .map_err(ShuffleError::from_io)?;
    w.write_all(bytes).await.map_err(ShuffleError::from_io)
}

/// Append a length-prefixed block to a buffer.
pub fn put_block(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Serialize the START payload: row type, row encoded type, key field
/// array, key encoded type. Each descriptor tree travels as one block.
pub fn put_schema(buf: &mut BytesMut, schema: &ShuffleSchema) {
    let mut tree = BytesMut::new();
    schema.row_type.encode(&mut tree);
    put_block(buf, &tree);

    tree.clear();
    schema.row_encoded.encode(&mut tree);
    put_block(buf, &tree);

    buf.put_u32(schema.key_fields.len() as u32);
    for field in &schema.key_fields {
        put_block(buf, field.name.as_bytes());
        buf.put_u8(field.direction.as_byte());
    }

    tree.clear();
    schema.key_encoded.encode(&mut tree);
    put_block(buf, &tree);
}

/// Parse the START payload from the stream.
pub async fn read_schema<R: AsyncRead + Unpin>(r: &mut R) -> ShuffleResult<ShuffleSchema> {
    let row_type = decode_tree(&read_block(r).await?, LogicalType::decode)?;
    let row_encoded = decode_tree(&read_block(r).await?, EncodedType::decode)?;

    let count = read_u32(r).await? as usize;
    if count > 1024 {
        return Err(ShuffleError::malformed_request(format!(
            "key field count {count} exceeds limit"
        )));
    }
    let mut key_fields = Vec::with_capacity(count);
    for _ in 0..count {
        let name = read_string(r).await?;
        let direction = SortDirection::from_byte(read_u8(r).await?)?;
        key_fields.push(SortField { name, direction });
    }

    let key_encoded = decode_tree(&read_block(r).await?, EncodedType::decode)?;

    Ok(ShuffleSchema {
        row_type,
        row_encoded,
        key_fields,
        key_encoded,
    })
}

/// Decode one descriptor tree from a block, requiring full consumption.
fn decode_tree<T>(
    block: &[u8],
    decode: impl Fn(&mut DescriptorCursor<'_>) -> ShuffleResult<T>,
) -> ShuffleResult<T> {
    let mut cur = DescriptorCursor::new(block);
    let tree = decode(&mut cur)?;
    if cur.remaining() != 0 {
        return Err(ShuffleError::malformed_record(
            "trailing bytes after type descriptor",
        ));
    }
    Ok(tree)
}
