//! Typed shuffle client.
//!
//! Exposes `start`, `put_row`/`end_put`, `get`, `partition_bounds`,
//! `stop`, and `close` over a single reconnectable connection. Rows are
//! encoded locally with the schema's codec, so type errors surface before
//! any bytes hit the wire.
//!
//! Failure handling is an explicit state machine, not exception flow:
//! every operation's error is classified transient or fatal. Transient
//! failures (disconnects, truncation, proxy declines) reopen the
//! transport, repeating the full handshake, and retry the whole
//! operation, unbounded, with bounded exponential backoff. START is the
//! one exception: a retried START would allocate a second shuffle
//! server-side, so its failure surfaces immediately.

pub mod retry;

use crate::codec::{RowCodec, ShuffleSchema, Value};
use crate::core::error::{ShuffleError, ShuffleResult};
use crate::registry::ShuffleId;
use crate::store::BatchToken;
use crate::transport::{open_connection, ConnectOptions, TransportStream};
use crate::wire::{self, OpCode, ACK, SHUFFLE_ID_LEN, STREAM_CONTINUE, STREAM_END};
use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use retry::BackoffPolicy;
use tokio::io::{AsyncWriteExt, BufStream};

/// Client construction parameters.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How to reach the service.
    pub connect: ConnectOptions,
    /// Reconnect backoff.
    pub backoff: BackoffPolicy,
}

impl ClientConfig {
    pub fn new(connect: ConnectOptions) -> Self {
        Self {
            connect,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A typed key interval for `get`.
///
/// Bound keys are given as one value per key field, in key-field order;
/// `None` leaves that side unbounded.
#[derive(Debug, Clone)]
pub struct KeyRange {
    pub start: Option<Vec<Value>>,
    pub start_inclusive: bool,
    pub end: Option<Vec<Value>>,
    pub end_inclusive: bool,
}

impl KeyRange {
    /// The range covering every key.
    pub fn all() -> Self {
        Self {
            start: None,
            start_inclusive: true,
            end: None,
            end_inclusive: true,
        }
    }

    pub fn new(
        start: Option<Vec<Value>>,
        start_inclusive: bool,
        end: Option<Vec<Value>>,
        end_inclusive: bool,
    ) -> Self {
        Self {
            start,
            start_inclusive,
            end,
            end_inclusive,
        }
    }
}

struct Connection {
    stream: BufStream<TransportStream>,
    uuid: uuid::Uuid,
}

struct Session {
    id: ShuffleId,
    codec: RowCodec,
}

/// Client for one shuffle session.
pub struct ShuffleClient {
    config: ClientConfig,
    conn: Option<Connection>,
    session: Option<Session>,
    pending: Vec<Bytes>,
    /// Token of the in-flight batch; stable across retries so the server
    /// applies the batch at most once, cleared on acknowledgement.
    batch_token: Option<BatchToken>,
}

impl ShuffleClient {
    /// Create a client; no connection is opened until the first operation.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            conn: None,
            session: None,
            pending: Vec::new(),
            batch_token: None,
        }
    }

    /// Allocate a shuffle with the given schema and remember its
    /// identifier for subsequent operations.
    ///
    /// Not retried: the server allocates on receipt, so a blind retry
    /// could leak a second shuffle. Failures surface to the caller.
    pub async fn start(&mut self, schema: ShuffleSchema) -> ShuffleResult<ShuffleId> {
        if self.session.is_some() {
            return Err(ShuffleError::config("client already has a started shuffle"));
        }
        let codec = RowCodec::new(&schema)?;

        let mut payload = BytesMut::new();
        payload.put_u8(OpCode::Start.as_byte());
        wire::put_schema(&mut payload, &schema);

        let result: ShuffleResult<ShuffleId> = async {
            let conn = self.ensure_connected().await?;
            conn.stream
                .write_all(&payload)
                .await
                .map_err(ShuffleError::from_io)?;
            conn.stream.flush().await.map_err(ShuffleError::from_io)?;
            let id_bytes = wire::read_array::<SHUFFLE_ID_LEN, _>(&mut conn.stream).await?;
            Ok(ShuffleId::from_bytes(id_bytes))
        }
        .await;

        match result {
            Ok(id) => {
                tracing::info!(shuffle = %id, "shuffle started");
                self.session = Some(Session { id, codec });
                Ok(id)
            }
            Err(error) => {
                self.drop_connection();
                Err(error)
            }
        }
    }

    /// Encode a row and buffer it for the next `end_put`.
    pub fn put_row(&mut self, row: &Value) -> ShuffleResult<()> {
        let session = self.session()?;
        let encoded = session.codec.encode_row(row)?;
        self.pending.push(encoded);
        Ok(())
    }

    /// Stream the buffered batch and wait for the acknowledgement.
    ///
    /// The batch is only considered durable once the server's single ack
    /// byte arrives; a transient failure resends the whole batch over a
    /// fresh connection. Every resend carries the same batch token, so a
    /// server that already committed the batch (the ack was lost in
    /// transit) ignores the duplicate instead of inserting it again.
    pub async fn end_put(&mut self) -> ShuffleResult<()> {
        let token = match self.batch_token {
            Some(token) => token,
            None => {
                let token = mint_batch_token();
                self.batch_token = Some(token);
                token
            }
        };
        let mut attempt = 0u32;
        loop {
            match self.try_end_put(token).await {
                Ok(()) => {
                    self.pending.clear();
                    self.batch_token = None;
                    return Ok(());
                }
                Err(error) => self.handle_op_error(error, &mut attempt, "PUT").await?,
            }
        }
    }

    /// Fetch every row whose key falls in the range, in key order.
    pub async fn get(&mut self, range: &KeyRange) -> ShuffleResult<Vec<Value>> {
        let (start, end) = self.encode_bounds(range)?;
        let mut attempt = 0u32;
        loop {
            match self
                .try_get(&start, range.start_inclusive, &end, range.end_inclusive)
                .await
            {
                Ok(rows) => return Ok(rows),
                Err(error) => self.handle_op_error(error, &mut attempt, "GET").await?,
            }
        }
    }

    /// Fetch n+1 partition boundary keys, decoded to key field values.
    pub async fn partition_bounds(&mut self, n: u32) -> ShuffleResult<Vec<Value>> {
        let mut attempt = 0u32;
        loop {
            match self.try_partition_bounds(n).await {
                Ok(bounds) => return Ok(bounds),
                Err(error) => {
                    self.handle_op_error(error, &mut attempt, "PARTITION_BOUNDS")
                        .await?
                }
            }
        }
    }

    /// Release the shuffle server-side.
    pub async fn stop(&mut self) -> ShuffleResult<()> {
        let mut attempt = 0u32;
        loop {
            match self.try_stop().await {
                Ok(()) => {
                    self.session = None;
                    self.pending.clear();
                    self.batch_token = None;
                    return Ok(());
                }
                Err(error) => self.handle_op_error(error, &mut attempt, "STOP").await?,
            }
        }
    }

    /// Send EOS and close the connection. Best effort: the session is
    /// over either way.
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let farewell: ShuffleResult<()> = async {
                conn.stream
                    .write_u8(OpCode::Eos.as_byte())
                    .await
                    .map_err(ShuffleError::from_io)?;
                conn.stream.flush().await.map_err(ShuffleError::from_io)?;
                let echo = wire::read_u8(&mut conn.stream).await?;
                if echo != OpCode::Eos.as_byte() {
                    return Err(ShuffleError::malformed_request(format!(
                        "unexpected EOS echo {echo}"
                    )));
                }
                conn.stream
                    .get_mut()
                    .shutdown()
                    .await
                    .map_err(ShuffleError::from_io)
            }
            .await;
            if let Err(error) = farewell {
                tracing::debug!(connection = %conn.uuid, %error, "EOS exchange failed");
            }
        }
    }

    /// The identifier of the started shuffle, if any.
    pub fn shuffle_id(&self) -> Option<ShuffleId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Rows buffered and not yet acknowledged.
    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    async fn try_end_put(&mut self, token: BatchToken) -> ShuffleResult<()> {
        let id = self.session()?.id;
        let batch = self.pending.clone();
        let conn = self.ensure_connected().await?;
        let stream = &mut conn.stream;

        stream
            .write_u8(OpCode::Put.as_byte())
            .await
            .map_err(ShuffleError::from_io)?;
        stream
            .write_all(id.as_bytes())
            .await
            .map_err(ShuffleError::from_io)?;
        stream
            .write_all(&token)
            .await
            .map_err(ShuffleError::from_io)?;
        for row in &batch {
            stream
                .write_u8(STREAM_CONTINUE)
                .await
                .map_err(ShuffleError::from_io)?;
            wire::write_block(stream, row).await?;
        }
        stream
            .write_u8(STREAM_END)
            .await
            .map_err(ShuffleError::from_io)?;
        stream.flush().await.map_err(ShuffleError::from_io)?;

        let ack = wire::read_u8(stream).await?;
        if ack != ACK {
            return Err(ShuffleError::malformed_request(format!(
                "unexpected PUT ack {ack}"
            )));
        }
        tracing::debug!(shuffle = %id, rows = batch.len(), "put acknowledged");
        Ok(())
    }

    async fn try_get(
        &mut self,
        start: &Bytes,
        start_inclusive: bool,
        end: &Bytes,
        end_inclusive: bool,
    ) -> ShuffleResult<Vec<Value>> {
        let id = self.session()?.id;
        let codec = self.session()?.codec.clone();
        let conn = self.ensure_connected().await?;
        let stream = &mut conn.stream;

        stream
            .write_u8(OpCode::Get.as_byte())
            .await
            .map_err(ShuffleError::from_io)?;
        stream
            .write_all(id.as_bytes())
            .await
            .map_err(ShuffleError::from_io)?;
        wire::write_block(stream, start).await?;
        stream
            .write_u8(u8::from(start_inclusive))
            .await
            .map_err(ShuffleError::from_io)?;
        wire::write_block(stream, end).await?;
        stream
            .write_u8(u8::from(end_inclusive))
            .await
            .map_err(ShuffleError::from_io)?;
        stream.flush().await.map_err(ShuffleError::from_io)?;

        let mut rows = Vec::new();
        loop {
            match wire::read_u8(stream).await? {
                STREAM_END => break,
                STREAM_CONTINUE => {
                    let block = wire::read_block(stream).await?;
                    rows.push(codec.decode_row(&block)?);
                }
                other => {
                    return Err(ShuffleError::malformed_request(format!(
                        "invalid continue flag {other}"
                    )))
                }
            }
        }
        tracing::debug!(shuffle = %id, rows = rows.len(), "range fetched");
        Ok(rows)
    }

    async fn try_partition_bounds(&mut self, n: u32) -> ShuffleResult<Vec<Value>> {
        let id = self.session()?.id;
        let codec = self.session()?.codec.clone();
        let conn = self.ensure_connected().await?;
        let stream = &mut conn.stream;

        stream
            .write_u8(OpCode::PartitionBounds.as_byte())
            .await
            .map_err(ShuffleError::from_io)?;
        stream
            .write_all(id.as_bytes())
            .await
            .map_err(ShuffleError::from_io)?;
        stream
            .write_u32(n)
            .await
            .map_err(ShuffleError::from_io)?;
        stream.flush().await.map_err(ShuffleError::from_io)?;

        let mut bounds = Vec::new();
        loop {
            match wire::read_u8(stream).await? {
                STREAM_END => break,
                STREAM_CONTINUE => {
                    let block = wire::read_block(stream).await?;
                    bounds.push(codec.decode_key(&block)?);
                }
                other => {
                    return Err(ShuffleError::malformed_request(format!(
                        "invalid continue flag {other}"
                    )))
                }
            }
        }
        Ok(bounds)
    }

    async fn try_stop(&mut self) -> ShuffleResult<()> {
        let id = self.session()?.id;
        let conn = self.ensure_connected().await?;
        let stream = &mut conn.stream;

        stream
            .write_u8(OpCode::Stop.as_byte())
            .await
            .map_err(ShuffleError::from_io)?;
        stream
            .write_all(id.as_bytes())
            .await
            .map_err(ShuffleError::from_io)?;
        stream.flush().await.map_err(ShuffleError::from_io)?;

        let ack = wire::read_u8(stream).await?;
        if ack != ACK {
            return Err(ShuffleError::malformed_request(format!(
                "unexpected STOP ack {ack}"
            )));
        }
        tracing::info!(shuffle = %id, "shuffle stopped");
        Ok(())
    }

    /// Transient errors drop the connection, back off, and let the caller
    /// loop; fatal errors surface.
    async fn handle_op_error(
        &mut self,
        error: ShuffleError,
        attempt: &mut u32,
        op: &'static str,
    ) -> ShuffleResult<()> {
        if !error.is_transient() {
            return Err(error);
        }
        self.drop_connection();
        let delay = self.config.backoff.delay(*attempt);
        tracing::warn!(
            %error,
            attempt = *attempt,
            delay_ms = delay.as_millis() as u64,
            op,
            "transient failure, reconnecting"
        );
        tokio::time::sleep(delay).await;
        *attempt += 1;
        Ok(())
    }

    fn encode_bounds(&self, range: &KeyRange) -> ShuffleResult<(Bytes, Bytes)> {
        let codec = &self.session()?.codec;
        let start = match &range.start {
            Some(values) => codec.encode_key_values(values)?,
            None => Bytes::new(),
        };
        let end = match &range.end {
            Some(values) => codec.encode_key_values(values)?,
            None => Bytes::new(),
        };
        Ok((start, end))
    }

    fn session(&self) -> ShuffleResult<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| ShuffleError::config("no started shuffle"))
    }

    async fn ensure_connected(&mut self) -> ShuffleResult<&mut Connection> {
        if self.conn.is_none() {
            let established = open_connection(&self.config.connect).await?;
            let uuid = uuid::Uuid::from_bytes(established.connection_uuid);
            tracing::debug!(connection = %uuid, "transport established");
            self.conn = Some(Connection {
                stream: BufStream::new(established.stream),
                uuid,
            });
        }
        Ok(self.conn.as_mut().expect("connection just ensured"))
    }

    fn drop_connection(&mut self) {
        self.conn = None;
    }
}

/// Mint a fresh batch token from the secure random source.
fn mint_batch_token() -> BatchToken {
    let mut token = [0u8; 16];
    OsRng.fill_bytes(&mut token);
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_range_all_is_unbounded() {
        let range = KeyRange::all();
        assert!(range.start.is_none());
        assert!(range.end.is_none());
        assert!(range.start_inclusive);
        assert!(range.end_inclusive);
    }
}
