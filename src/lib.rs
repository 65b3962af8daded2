//! Riffle - distributed sort shuffle service.
//!
//! Riffle accepts typed rows from many parallel producers, keeps them in a
//! sorted, persistent store per shuffle session, and serves range scans
//! and partition-boundary queries back to consumers. The crate holds both
//! the server and the compiler-side client that drives it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Client                                │
//! │     typed put/get/bounds API │ reconnect + bounded backoff      │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Transport                              │
//! │      mTLS session │ token handshake │ direct or L4 proxy        │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Server                                │
//! │   accept loop │ per-connection protocol loop │ registry lookup  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Store (per shuffle)                      │
//! │     memtable │ sorted runs │ k-way merge │ reservoir sampler    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Server TOML config and the client deploy document
//! - [`core::error`] - Error taxonomy
//!
//! ## Data plane
//! - [`codec`] - Typed record codec and order-preserving key encoding
//! - [`store`] - Per-shuffle LSM: puts, range scans, partition bounds
//! - [`registry`] - identifier → live shuffle table
//!
//! ## Networking
//! - [`wire`] - Opcode table and request/response framing
//! - [`server`] - TLS accept loop and per-connection dispatch
//! - [`client`] - Typed client with transparent reconnect
//! - [`transport`] - TLS sessions, session tokens, proxy handshake
//!
//! ## CLI
//! - [`cli`] - `riffle serve` and config tooling
//!
//! # Key Invariants
//!
//! - The registry is a bijection from live identifier to store.
//! - The encoded-key order that places rows at PUT time is byte-identical
//!   to the order GET scans observe.
//! - Duplicate keys iterate in insertion order, across memtable flushes
//!   and run compactions.
//! - A store I/O failure poisons only its own shuffle; other shuffles and
//!   the server process are unaffected.
//! - START is never retried by the client; every other operation retries
//!   transparently on transport failure.

// Core infrastructure
pub mod core;

// Data plane
pub mod codec;
pub mod registry;
pub mod store;

// Networking
pub mod client;
pub mod server;
pub mod transport;
pub mod wire;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error};
pub use client::{ClientConfig, KeyRange, ShuffleClient};
pub use codec::{RowCodec, ShuffleSchema, SortDirection, SortField, Value};
pub use registry::{Shuffle, ShuffleId, ShuffleRegistry};
pub use server::{RunningServer, Server, ServerConfig};
pub use store::{BatchToken, KeyInterval, Store, StoreConfig};
