//! Listener hooks for inbound transport events.

use crate::error::TransportError;
use crate::invoke::InvokeResponder;
use crate::value::Value;

/// Result type returned by listener hooks.
///
/// An `Err` never propagates into inbound processing; the transport
/// forwards it to [`TransportHandler::on_listener_error`].
pub type ListenerResult = Result<(), Box<dyn std::error::Error>>;

/// Receiver-side hooks of a [`Transport`](crate::Transport).
///
/// All methods have no-op defaults; implement the ones the embedding
/// needs. Hooks are invoked on the transport's single-threaded event loop,
/// so they may call back into the transport synchronously.
pub trait TransportHandler {
    /// A one-way transmit arrived.
    fn on_transmit(&self, receiver: &str, data: Value) -> ListenerResult {
        let _ = (receiver, data);
        Ok(())
    }

    /// An invocation arrived; exactly one of
    /// [`InvokeResponder::send_data`] / [`InvokeResponder::send_err`]
    /// must eventually be called.
    fn on_invoke(&self, procedure: &str, data: Value, responder: InvokeResponder) -> ListenerResult {
        let _ = (procedure, data, responder);
        Ok(())
    }

    /// A ping control byte arrived.
    fn on_ping(&self) -> ListenerResult {
        Ok(())
    }

    /// A pong control byte arrived.
    fn on_pong(&self) -> ListenerResult {
        Ok(())
    }

    /// An inbound frame could not be processed.
    ///
    /// Per-message failures land here and never kill the transport.
    fn on_invalid_message(&self, error: TransportError) {
        let _ = error;
    }

    /// A listener hook returned an error, or the user misused a
    /// single-shot callback. Errors thrown here are swallowed.
    fn on_listener_error(&self, error: Box<dyn std::error::Error>) {
        let _ = error;
    }
}

/// Handler that ignores every event. Useful for send-only endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl TransportHandler for NoopHandler {}
