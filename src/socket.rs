//! The socket seam between the transport and the byte-stream channel.
//!
//! The transport never talks to a network directly; it emits frames through
//! a [`TransportSocket`] supplied by the embedding layer (a WebSocket
//! connection, a TCP framing layer, or the in-memory [`loopback`] pair).
//! Inbound frames travel the other way via
//! [`Transport::emit_message`](crate::Transport::emit_message).
//!
//! [`loopback`]: crate::loopback

use std::io;

/// Outbound frame sink plus backpressure probe.
///
/// All methods are called synchronously from within transport handlers, so
/// implementations must not block and must tolerate reentrant sends issued
/// while a `cork` closure is running.
pub trait TransportSocket {
    /// Send a text frame (a comma-joined packet tuple).
    ///
    /// # Errors
    ///
    /// Best effort; errors propagate to the caller of the sending
    /// operation, except for ping/pong where they are swallowed.
    fn send_text(&self, msg: &str) -> io::Result<()>;

    /// Send a binary frame.
    ///
    /// # Errors
    ///
    /// Same policy as [`send_text`](TransportSocket::send_text).
    fn send_binary(&self, msg: &[u8]) -> io::Result<()>;

    /// Run `f` with all sends inside flushed as one socket write boundary.
    ///
    /// The default implementation just invokes `f`; sockets that can
    /// coalesce writes should override it.
    fn cork(&self, f: &mut dyn FnMut()) {
        f();
    }

    /// Whether the socket currently has low send backpressure.
    ///
    /// Stream chunk writers wait for this to turn `true`; the embedding
    /// layer signals the transition via
    /// [`Transport::emit_send_backpressure_drain`](crate::Transport::emit_send_backpressure_drain).
    fn has_low_send_backpressure(&self) -> bool {
        true
    }
}

/// An inbound frame as handed to [`Transport::emit_message`](crate::Transport::emit_message).
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// A text frame.
    Text(String),
    /// A binary frame.
    Binary(bytes::Bytes),
}
