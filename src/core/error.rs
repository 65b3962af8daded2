//! Error types shared across the shuffle service.
//!
//! Wire-visible errors terminate the connection they occur on; the server
//! never attempts to recover a connection mid-request. The client treats
//! transport-level failures as retriable and everything else as fatal.

use thiserror::Error;

/// Common shuffle error conditions.
#[derive(Debug, Error)]
pub enum ShuffleError {
    /// The 16-byte identifier does not resolve to a live shuffle.
    #[error("unknown shuffle: {id_hex}")]
    UnknownShuffle { id_hex: String },

    /// Opcode or request framing violated.
    #[error("malformed request: {detail}")]
    MalformedRequest { detail: String },

    /// A record or type descriptor could not be decoded.
    #[error("malformed record: {detail}")]
    MalformedRecord { detail: String },

    /// The byte stream ended in the middle of a record or frame.
    #[error("truncated stream")]
    Truncated,

    /// START carried a key type that is not a structural prefix of the row type.
    #[error("type mismatch: {detail}")]
    TypeMismatch { detail: String },

    /// A prior I/O failure poisoned this shuffle's store.
    #[error("shuffle poisoned: {id_hex}")]
    ShufflePoisoned { id_hex: String },

    /// Store-level I/O failure (flush, merge, or scan).
    #[error("store I/O error during {operation}: {source}")]
    StoreIo {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The proxy or server declined the transport handshake.
    #[error("transport handshake declined (ack byte {ack})")]
    TransportAck { ack: u8 },

    /// The peer closed the connection or socket I/O failed.
    #[error("connection error: {source}")]
    Connection {
        #[source]
        source: std::io::Error,
    },

    /// TLS configuration or handshake failure.
    #[error("tls error: {detail}")]
    Tls { detail: String },

    /// Configuration is invalid or unusable.
    #[error("invalid configuration: {detail}")]
    Config { detail: String },
}

impl ShuffleError {
    /// Create a MalformedRequest error.
    pub fn malformed_request(detail: impl Into<String>) -> Self {
        Self::MalformedRequest {
            detail: detail.into(),
        }
    }

    /// Create a MalformedRecord error.
    pub fn malformed_record(detail: impl Into<String>) -> Self {
        Self::MalformedRecord {
            detail: detail.into(),
        }
    }

    /// Create a TypeMismatch error.
    pub fn type_mismatch(detail: impl Into<String>) -> Self {
        Self::TypeMismatch {
            detail: detail.into(),
        }
    }

    /// Create a Config error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config {
            detail: detail.into(),
        }
    }

    /// Map an I/O error from socket reads/writes into the shuffle taxonomy.
    ///
    /// An unexpected EOF mid-frame is `Truncated`; everything else is a
    /// connection-level failure.
    pub fn from_io(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Connection { source: err }
        }
    }

    /// Whether the client should transparently reconnect and retry the
    /// operation that produced this error.
    ///
    /// Only transport-level failures qualify; protocol and type errors
    /// would fail identically on a fresh connection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Truncated | Self::TransportAck { .. }
        )
    }
}

/// Result type using ShuffleError.
pub type ShuffleResult<T> = Result<T, ShuffleError>;
