//! # Braid
//!
//! A bidirectional message transport that multiplexes four interaction
//! patterns over a single reliable ordered byte-stream (a WebSocket-like
//! channel): one-way transmits, request/response invocations, object
//! streams carrying structured values, and binary streams carrying raw
//! byte chunks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │              Application Code                    │
//! │      transmit / invoke / streams + handler       │
//! ├──────────────────────────────────────────────────┤
//! │     Transport (dispatch & correlation)           │
//! │     • Invoke registry with lazy response timers  │
//! │     • Per-stream credit-based flow control       │
//! │     • Binary-content resolvers with deadlines    │
//! ├──────────────────────────────────────────────────┤
//! │     Value Codec (placeholder substitution)       │
//! │     • {_b} blob / {_s} stream markers            │
//! │     • Invertible key escaping                    │
//! ├──────────────────────────────────────────────────┤
//! │     Wire Format (text tuples + binary frames)    │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use braid::{Transport, TransportOptions, Value, TransmitOptions};
//!
//! let transport = Transport::new(socket, handler, TransportOptions::default());
//!
//! // Fire-and-forget
//! transport.transmit("chat", &Value::from("hello"), &TransmitOptions::default())?;
//!
//! // Request/response
//! let sum = transport
//!     .invoke("add", &Value::obj([("a", 1i64.into()), ("b", 2i64.into())]), &Default::default())
//!     .await?;
//! ```
//!
//! The controller is single-threaded cooperative: run it inside a
//! `tokio::task::LocalSet`.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Outbound packages and the batch/disconnect buffer.
pub mod buffer;

pub(crate) mod codec;

/// Transport configuration.
pub mod config;

/// Error types.
pub mod error;

/// Listener hooks for inbound events.
pub mod handler;

/// Invoke correlation and the receiving-side responder.
pub mod invoke;

/// In-memory loopback pair for tests and embedding references.
pub mod loopback;

/// Multi-transmit package preparation.
pub mod multi;

pub(crate) mod resolver;

/// The socket seam to the byte-stream channel.
pub mod socket;

/// Write- and read-side stream state machines.
pub mod stream;

/// The transport controller.
pub mod transport;

/// The payload value tree.
pub mod value;

/// Wire format: packet tags, control bytes, binary frame layouts.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use buffer::Package;
pub use config::TransportOptions;
pub use error::{BadConnectionKind, RemoteError, TimeoutKind, TransportError, TransportResult};
pub use handler::{ListenerResult, NoopHandler, TransportHandler};
pub use invoke::{InvokeFuture, InvokeResponder, InvokeReturn};
pub use multi::{MultiPreparedPackage, prepare_multi_transmit};
pub use socket::{IncomingMessage, TransportSocket};
pub use stream::{ReadStream, WriteStream, close_code};
pub use transport::{InvokeOptions, TransmitOptions, Transport};
pub use value::{StreamValue, Value};
pub use wire::{DataType, MAX_SUPPORTED_BLOB_SIZE, PacketType};
