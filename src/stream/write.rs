//! Write side of a stream.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;

use crate::error::{TransportError, TransportResult};
use crate::transport::Transport;
use crate::value::Value;

use super::close_code;

/// Write-side state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Created, not yet embedded in a payload.
    Unbound,
    /// Embedded in a package that has not been sent yet.
    Bound,
    /// The package went out; waiting for the reader's accept.
    AwaitingAccept,
    /// Accepted; chunks flow while credit lasts.
    Open,
    /// Terminal, with the close code.
    Closed(u32),
}

struct Inner {
    state: State,
    id: Option<i64>,
    transport: Weak<Transport>,
    /// Remaining credit (items for object streams, bytes for binary ones).
    credit: u64,
    /// Woken on any state or credit change.
    wakers: Vec<Waker>,
    /// Woken only when the stream reaches `Closed`.
    closed_wakers: Vec<Waker>,
}

/// The local write side of a stream.
///
/// Create one with [`WriteStream::object`] or [`WriteStream::binary`],
/// embed it in a payload (see [`Value::write_stream`]), and start writing
/// once the reader accepts. Writes respect the reader's credit window and
/// the socket's send backpressure.
pub struct WriteStream {
    binary: bool,
    inner: RefCell<Inner>,
}

impl WriteStream {
    fn new(binary: bool) -> Rc<Self> {
        Rc::new(Self {
            binary,
            inner: RefCell::new(Inner {
                state: State::Unbound,
                id: None,
                transport: Weak::new(),
                credit: 0,
                wakers: Vec::new(),
                closed_wakers: Vec::new(),
            }),
        })
    }

    /// Create an object stream (chunks are payload values, credit counts
    /// items).
    pub fn object() -> Rc<Self> {
        Self::new(false)
    }

    /// Create a binary stream (chunks are raw bytes, credit counts bytes).
    pub fn binary() -> Rc<Self> {
        Self::new(true)
    }

    /// Whether this is a binary stream.
    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// The wire id, once the stream has been embedded in a payload.
    pub fn id(&self) -> Option<i64> {
        self.inner.borrow().id
    }

    /// Remaining send credit.
    pub fn credit(&self) -> u64 {
        self.inner.borrow().credit
    }

    /// Whether the stream has reached its terminal state.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.borrow().state, State::Closed(_))
    }

    /// Write one value chunk to an object stream.
    ///
    /// Waits for the reader's accept, one item of credit, and low socket
    /// send backpressure.
    ///
    /// # Errors
    ///
    /// Fails on a binary stream, on a closed stream, or when the
    /// connection is gone.
    pub async fn write(&self, value: Value) -> TransportResult<()> {
        if self.binary {
            return Err(TransportError::invalid_action(
                "write() on a binary stream; use write_bytes()",
            ));
        }
        self.reserve_credit(1).await?;
        let transport = self.transport()?;
        transport.wait_low_send_backpressure().await;
        if let Err(err) = self.ensure_open() {
            return Err(err);
        }
        let id = self.bound_id()?;
        match transport.send_object_stream_chunk(id, Some(&value), false) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.refund_credit(1);
                Err(err)
            }
        }
    }

    /// Write bytes to a binary stream.
    ///
    /// The data is split into chunks that fit the available credit; the
    /// future completes when every byte has been sent.
    ///
    /// # Errors
    ///
    /// Fails on an object stream, on a closed stream, or when the
    /// connection is gone.
    pub async fn write_bytes(&self, data: Bytes) -> TransportResult<()> {
        if !self.binary {
            return Err(TransportError::invalid_action(
                "write_bytes() on an object stream; use write()",
            ));
        }
        let mut offset = 0usize;
        while offset < data.len() {
            let want = (data.len() - offset) as u64;
            let take = self.reserve_credit_up_to(want).await?;
            let transport = self.transport()?;
            transport.wait_low_send_backpressure().await;
            if let Err(err) = self.ensure_open() {
                return Err(err);
            }
            let id = self.bound_id()?;
            let end = offset + take as usize;
            match transport.send_binary_stream_chunk(id, &data[offset..end], false) {
                Ok(()) => offset = end,
                Err(err) => {
                    self.refund_credit(take);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// End an object stream, optionally with a final chunk.
    ///
    /// The final chunk rides the end packet and is not credit-gated.
    pub async fn end(&self, final_value: Option<Value>) -> TransportResult<()> {
        if self.binary {
            return Err(TransportError::invalid_action(
                "end() on a binary stream; use end_bytes()",
            ));
        }
        self.wait_open().await?;
        let transport = self.transport()?;
        let id = self.bound_id()?;
        transport.send_object_stream_chunk(id, final_value.as_ref(), true)?;
        self.finish_closed(close_code::END);
        transport.unregister_write_stream(id);
        Ok(())
    }

    /// End a binary stream, optionally with a final byte chunk.
    pub async fn end_bytes(&self, final_chunk: Option<Bytes>) -> TransportResult<()> {
        if !self.binary {
            return Err(TransportError::invalid_action(
                "end_bytes() on an object stream; use end()",
            ));
        }
        self.wait_open().await?;
        let transport = self.transport()?;
        let id = self.bound_id()?;
        let payload = final_chunk.unwrap_or_default();
        transport.send_binary_stream_chunk(id, &payload, true)?;
        self.finish_closed(close_code::END);
        transport.unregister_write_stream(id);
        Ok(())
    }

    /// Abort the stream locally with `code`.
    ///
    /// Sends `WriteStreamClose` if the stream already has a wire identity.
    pub fn close(&self, code: u32) {
        let (id, transport) = {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.state, State::Closed(_)) {
                return;
            }
            let live = matches!(
                inner.state,
                State::AwaitingAccept | State::Open
            );
            inner.state = State::Closed(code);
            let id = if live { inner.id } else { None };
            (id, inner.transport.upgrade())
        };
        self.wake_all();
        if let (Some(id), Some(transport)) = (id, transport) {
            if let Err(err) = transport.send_write_stream_close(id, code) {
                tracing::debug!(stream_id = id, error = %err, "write stream close send failed");
            }
            transport.unregister_write_stream(id);
        }
    }

    /// Future resolving with the close code once the stream reaches its
    /// terminal state.
    pub fn closed(&self) -> ClosedFuture<'_> {
        ClosedFuture { stream: self }
    }

    // ---------------------------------------------------------------------
    // Transport-facing transitions
    // ---------------------------------------------------------------------

    /// Bind to a transport and take a wire id (at encode time).
    pub(crate) fn bind(&self, id: i64, transport: Weak<Transport>) -> TransportResult<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.state != State::Unbound {
            return Err(TransportError::invalid_action(
                "write stream already embedded in a payload",
            ));
        }
        inner.state = State::Bound;
        inner.id = Some(id);
        inner.transport = transport;
        Ok(())
    }

    /// The bearing package went out; the reader may now accept.
    pub(crate) fn activate(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.state == State::Bound {
            inner.state = State::AwaitingAccept;
        }
    }

    /// `StreamAccept` arrived with the initial credit window.
    pub(crate) fn accept(&self, initial_credit: u64) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state != State::AwaitingAccept {
                tracing::debug!(id = ?inner.id, state = ?inner.state, "accept in unexpected state");
                return;
            }
            inner.state = State::Open;
            inner.credit = initial_credit;
        }
        self.wake_all();
    }

    /// `StreamDataPermission` arrived.
    pub(crate) fn add_credit(&self, delta: u64) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state != State::Open {
                return;
            }
            inner.credit = inner.credit.saturating_add(delta);
        }
        self.wake_all();
    }

    /// The reader closed its side (`ReadStreamClose`), or the connection
    /// died underneath the stream.
    pub(crate) fn remote_close(&self, code: u32) {
        {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.state, State::Closed(_)) {
                return;
            }
            inner.state = State::Closed(code);
        }
        self.wake_all();
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn transport(&self) -> TransportResult<Rc<Transport>> {
        self.inner.borrow().transport.upgrade().ok_or_else(|| {
            TransportError::bad_connection(
                crate::error::BadConnectionKind::ConnectionLost,
                "transport dropped",
            )
        })
    }

    fn bound_id(&self) -> TransportResult<i64> {
        self.inner
            .borrow()
            .id
            .ok_or_else(|| TransportError::invalid_action("stream has no wire id yet"))
    }

    fn ensure_open(&self) -> TransportResult<()> {
        match self.inner.borrow().state {
            State::Open => Ok(()),
            State::Closed(code) => Err(TransportError::StreamClosed { code }),
            _ => Err(TransportError::invalid_action("stream is not open")),
        }
    }

    fn wake_all(&self) {
        let (wakers, closed_wakers) = {
            let mut inner = self.inner.borrow_mut();
            let closed = matches!(inner.state, State::Closed(_));
            (
                std::mem::take(&mut inner.wakers),
                if closed {
                    std::mem::take(&mut inner.closed_wakers)
                } else {
                    Vec::new()
                },
            )
        };
        for waker in wakers.into_iter().chain(closed_wakers) {
            waker.wake();
        }
    }

    fn finish_closed(&self, code: u32) {
        {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.state, State::Closed(_)) {
                return;
            }
            inner.state = State::Closed(code);
        }
        self.wake_all();
    }

    fn refund_credit(&self, amount: u64) {
        self.inner.borrow_mut().credit += amount;
    }

    /// Wait until `Open` with at least `amount` credit, then take it.
    async fn reserve_credit(&self, amount: u64) -> TransportResult<()> {
        std::future::poll_fn(|cx| {
            let mut inner = self.inner.borrow_mut();
            match inner.state {
                State::Closed(code) => Poll::Ready(Err(TransportError::StreamClosed { code })),
                State::Open if inner.credit >= amount => {
                    inner.credit -= amount;
                    Poll::Ready(Ok(()))
                }
                _ => {
                    inner.wakers.push(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await
    }

    /// Wait until `Open` with any credit, then take up to `want` of it.
    async fn reserve_credit_up_to(&self, want: u64) -> TransportResult<u64> {
        std::future::poll_fn(|cx| {
            let mut inner = self.inner.borrow_mut();
            match inner.state {
                State::Closed(code) => Poll::Ready(Err(TransportError::StreamClosed { code })),
                State::Open if inner.credit > 0 => {
                    let take = inner.credit.min(want);
                    inner.credit -= take;
                    Poll::Ready(Ok(take))
                }
                _ => {
                    inner.wakers.push(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await
    }

    async fn wait_open(&self) -> TransportResult<()> {
        std::future::poll_fn(|cx| {
            let mut inner = self.inner.borrow_mut();
            match inner.state {
                State::Open => Poll::Ready(Ok(())),
                State::Closed(code) => Poll::Ready(Err(TransportError::StreamClosed { code })),
                _ => {
                    inner.wakers.push(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await
    }
}

impl std::fmt::Debug for WriteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("WriteStream")
            .field("binary", &self.binary)
            .field("id", &inner.id)
            .field("state", &inner.state)
            .field("credit", &inner.credit)
            .finish()
    }
}

/// Future returned by [`WriteStream::closed`].
pub struct ClosedFuture<'a> {
    stream: &'a WriteStream,
}

impl Future for ClosedFuture<'_> {
    type Output = u32;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.stream.inner.borrow_mut();
        match inner.state {
            State::Closed(code) => Poll::Ready(code),
            _ => {
                inner.closed_wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let stream = WriteStream::object();
        assert!(!stream.is_binary());
        assert_eq!(stream.id(), None);
        assert_eq!(stream.credit(), 0);
        assert!(!stream.is_closed());
    }

    #[test]
    fn test_bind_once() {
        let stream = WriteStream::object();
        stream.bind(1, Weak::new()).expect("bind");
        assert_eq!(stream.id(), Some(1));
        assert!(stream.bind(2, Weak::new()).is_err());
    }

    #[test]
    fn test_accept_requires_awaiting_state() {
        let stream = WriteStream::binary();
        stream.bind(-1, Weak::new()).expect("bind");

        // Accept before the package was sent is ignored.
        stream.accept(512);
        assert_eq!(stream.credit(), 0);

        stream.activate();
        stream.accept(512);
        assert_eq!(stream.credit(), 512);
    }

    #[test]
    fn test_credit_accumulates_only_when_open() {
        let stream = WriteStream::binary();
        stream.bind(-1, Weak::new()).expect("bind");
        stream.add_credit(100);
        assert_eq!(stream.credit(), 0);

        stream.activate();
        stream.accept(100);
        stream.add_credit(50);
        assert_eq!(stream.credit(), 150);
    }

    #[test]
    fn test_remote_close_is_terminal() {
        let stream = WriteStream::object();
        stream.bind(3, Weak::new()).expect("bind");
        stream.activate();
        stream.remote_close(close_code::END);
        assert!(stream.is_closed());

        // Later accepts are ignored.
        stream.accept(10);
        assert_eq!(stream.credit(), 0);
    }

    #[tokio::test]
    async fn test_closed_future_resolves_with_code() {
        let stream = WriteStream::object();
        stream.bind(5, Weak::new()).expect("bind");
        stream.activate();

        let closed = stream.closed();
        stream.remote_close(close_code::ABORT);
        assert_eq!(closed.await, close_code::ABORT);
    }

    #[tokio::test]
    async fn test_write_fails_on_closed_stream() {
        let stream = WriteStream::object();
        stream.bind(5, Weak::new()).expect("bind");
        stream.activate();
        stream.remote_close(close_code::ABORT);

        let result = stream.write(Value::from(1i64)).await;
        assert!(matches!(
            result,
            Err(TransportError::StreamClosed {
                code: close_code::ABORT
            })
        ));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let object = WriteStream::object();
        let binary = WriteStream::binary();

        // Both error synchronously on the first poll.
        let err = futures_err(object.write_bytes(Bytes::from_static(b"x")));
        assert!(matches!(err, TransportError::InvalidAction { .. }));
        let err = futures_err(binary.write(Value::Null));
        assert!(matches!(err, TransportError::InvalidAction { .. }));
    }

    fn futures_err<F: Future<Output = TransportResult<()>>>(fut: F) -> TransportError {
        let mut fut = Box::pin(fut);
        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(Err(err)) => err,
            other => panic!("expected immediate error, got {other:?}"),
        }
    }
}
