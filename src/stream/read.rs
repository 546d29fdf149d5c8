//! Read side of a stream.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use crate::error::{TransportError, TransportResult};
use crate::transport::Transport;
use crate::value::Value;

/// Read-side state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Materialized by decode; the consumer has not accepted yet.
    Created,
    /// Accepted; chunks flow. `window` is the accepted credit window and
    /// `freed` the credit consumed since the last permission grant.
    Open { window: u64, freed: u64 },
    /// The writer ended the stream normally.
    Ended,
    /// The writer aborted (or the connection died). `reported` tracks
    /// whether the close error has been surfaced to the consumer.
    Closed { code: u32, reported: bool },
}

/// One decoded (or still decoding) chunk slot.
///
/// Chunks are queued the moment they arrive so the consumer observes them
/// in sent order even when a later chunk finishes decoding first.
pub(crate) enum Slot {
    /// Decode still in flight (awaiting a binary-content frame).
    Pending,
    /// Decoded value, ready for the consumer.
    Ready(Value),
    /// Decode failed; the error went to `on_invalid_message` and the slot
    /// is skipped.
    Failed,
}

enum Entry {
    Chunk {
        slot: Rc<RefCell<Slot>>,
        /// Whether consuming this chunk frees credit (final chunks riding
        /// the end packet do not).
        counted: bool,
    },
    End,
}

struct Inner {
    transport: Weak<Transport>,
    state: State,
    queue: VecDeque<Entry>,
    wakers: Vec<Waker>,
    /// Set once a terminal entry (end or close) has been queued; further
    /// inbound traffic for this stream is dropped.
    terminal_seen: bool,
}

/// The remote-fed read side of a stream, materialized by decoding an
/// inbound payload.
///
/// Call [`accept`](ReadStream::accept) to open the flow, then drain with
/// [`recv`](ReadStream::recv). Consumption grants the writer further
/// credit in half-window steps.
pub struct ReadStream {
    id: i64,
    binary: bool,
    inner: RefCell<Inner>,
}

impl ReadStream {
    pub(crate) fn new(id: i64, transport: Weak<Transport>) -> Rc<Self> {
        Rc::new(Self {
            id,
            // Sign encodes the stream kind on the wire.
            binary: id < 0,
            inner: RefCell::new(Inner {
                transport,
                state: State::Created,
                queue: VecDeque::new(),
                wakers: Vec::new(),
                terminal_seen: false,
            }),
        })
    }

    /// The wire id of this stream.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Whether this is a binary stream.
    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Accept the stream, granting the writer an initial credit window
    /// (items for object streams, bytes for binary streams).
    ///
    /// # Errors
    ///
    /// Fails if the stream was already accepted or has terminated.
    pub fn accept(&self, initial_credit: u64) -> TransportResult<()> {
        let transport = {
            let mut inner = self.inner.borrow_mut();
            match inner.state {
                State::Created => {}
                State::Open { .. } => {
                    return Err(TransportError::invalid_action("stream already accepted"));
                }
                State::Ended | State::Closed { .. } => {
                    return Err(TransportError::invalid_action(
                        "stream already terminated",
                    ));
                }
            }
            inner.state = State::Open {
                window: initial_credit,
                freed: 0,
            };
            inner.transport.upgrade()
        };
        let transport = transport.ok_or_else(|| {
            TransportError::bad_connection(
                crate::error::BadConnectionKind::ConnectionLost,
                "transport dropped",
            )
        })?;
        transport.send_stream_accept(self.id, initial_credit)
    }

    /// Accept with the transport's configured default credit window.
    pub fn accept_default(&self) -> TransportResult<()> {
        let credit = {
            let inner = self.inner.borrow();
            inner
                .transport
                .upgrade()
                .map(|t| t.options().read_stream_initial_credit)
        }
        .ok_or_else(|| {
            TransportError::bad_connection(
                crate::error::BadConnectionKind::ConnectionLost,
                "transport dropped",
            )
        })?;
        self.accept(credit)
    }

    /// Receive the next chunk in sent order.
    ///
    /// Resolves to `Some(Ok(value))` per chunk, `Some(Err(StreamClosed))`
    /// exactly once if the writer aborted, and `None` after the end of the
    /// stream.
    pub fn recv(&self) -> RecvFuture<'_> {
        RecvFuture { stream: self }
    }

    /// Abort the read side with `code`, telling the writer to stop.
    ///
    /// Undelivered chunks are dropped; subsequent [`recv`](ReadStream::recv)
    /// calls resolve to `None`.
    pub fn close(&self, code: u32) {
        let transport = {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.state, State::Ended | State::Closed { .. }) {
                return;
            }
            inner.state = State::Closed {
                code,
                reported: true,
            };
            inner.terminal_seen = true;
            inner.queue.clear();
            inner.transport.upgrade()
        };
        self.wake_all();
        if let Some(transport) = transport {
            if let Err(err) = transport.send_read_stream_close(self.id, code) {
                tracing::debug!(stream_id = self.id, error = %err, "read stream close send failed");
            }
            transport.unregister_read_stream(self.id);
        }
    }

    // ---------------------------------------------------------------------
    // Transport-facing feed
    // ---------------------------------------------------------------------

    /// Queue a slot for a chunk whose decode is still in flight.
    pub(crate) fn begin_chunk(&self, counted: bool) -> Option<Rc<RefCell<Slot>>> {
        let mut inner = self.inner.borrow_mut();
        if inner.terminal_seen {
            return None;
        }
        let slot = Rc::new(RefCell::new(Slot::Pending));
        inner.queue.push_back(Entry::Chunk {
            slot: slot.clone(),
            counted,
        });
        Some(slot)
    }

    /// Fill a previously queued slot.
    pub(crate) fn complete_chunk(&self, slot: &Rc<RefCell<Slot>>, result: TransportResult<Value>) {
        *slot.borrow_mut() = match result {
            Ok(value) => Slot::Ready(value),
            Err(_) => Slot::Failed,
        };
        self.wake_all();
    }

    /// Queue an already decoded chunk.
    pub(crate) fn push_chunk(&self, value: Value, counted: bool) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.terminal_seen {
                return;
            }
            inner.queue.push_back(Entry::Chunk {
                slot: Rc::new(RefCell::new(Slot::Ready(value))),
                counted,
            });
        }
        self.wake_all();
    }

    /// Queue the end-of-stream marker. At most one terminal entry is ever
    /// queued.
    pub(crate) fn push_end(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.terminal_seen {
                return;
            }
            inner.terminal_seen = true;
            inner.queue.push_back(Entry::End);
        }
        self.wake_all();
    }

    /// The writer aborted (`WriteStreamClose`), or the connection died.
    pub(crate) fn remote_close(&self, code: u32) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.terminal_seen {
                return;
            }
            inner.terminal_seen = true;
            inner.state = State::Closed {
                code,
                reported: false,
            };
        }
        self.wake_all();
    }

    fn wake_all(&self) {
        let wakers = std::mem::take(&mut self.inner.borrow_mut().wakers);
        for waker in wakers {
            waker.wake();
        }
    }

    /// Credit cost of a consumed chunk.
    fn chunk_cost(&self, value: &Value) -> u64 {
        if self.binary {
            value.as_blob().map(|b| b.len() as u64).unwrap_or(0)
        } else {
            1
        }
    }
}

impl std::fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ReadStream")
            .field("id", &self.id)
            .field("binary", &self.binary)
            .field("state", &inner.state)
            .field("queued", &inner.queue.len())
            .finish()
    }
}

/// Future returned by [`ReadStream::recv`].
pub struct RecvFuture<'a> {
    stream: &'a ReadStream,
}

impl Future for RecvFuture<'_> {
    type Output = Option<TransportResult<Value>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Computed under the borrow, performed after releasing it: sending
        // a permission grant reenters the transport.
        let mut grant: Option<u64> = None;
        let outcome = loop {
            let mut inner = self.stream.inner.borrow_mut();
            match inner.queue.front() {
                Some(Entry::Chunk { slot, counted }) => {
                    let counted = *counted;
                    let slot = Rc::clone(slot);
                    let decoded = {
                        let guard = slot.borrow();
                        match &*guard {
                            Slot::Pending => None,
                            Slot::Failed => Some(None),
                            Slot::Ready(value) => Some(Some(value.clone())),
                        }
                    };
                    match decoded {
                        None => {
                            inner.wakers.push(cx.waker().clone());
                            break Poll::Pending;
                        }
                        Some(None) => {
                            inner.queue.pop_front();
                            continue;
                        }
                        Some(Some(value)) => {
                            inner.queue.pop_front();
                            if counted
                                && let State::Open { window, freed } = &mut inner.state
                            {
                                *freed += self.stream.chunk_cost(&value);
                                if *window > 0 && *freed * 2 >= *window {
                                    grant = Some(*freed);
                                    *freed = 0;
                                }
                            }
                            break Poll::Ready(Some(Ok(value)));
                        }
                    }
                }
                Some(Entry::End) => {
                    inner.queue.pop_front();
                    inner.state = State::Ended;
                    break Poll::Ready(None);
                }
                None => match inner.state {
                    State::Ended => break Poll::Ready(None),
                    State::Closed { code, reported } => {
                        if reported {
                            break Poll::Ready(None);
                        }
                        inner.state = State::Closed {
                            code,
                            reported: true,
                        };
                        break Poll::Ready(Some(Err(TransportError::StreamClosed { code })));
                    }
                    _ => {
                        inner.wakers.push(cx.waker().clone());
                        break Poll::Pending;
                    }
                },
            }
        };

        if let Some(delta) = grant {
            let transport = self.stream.inner.borrow().transport.upgrade();
            if let Some(transport) = transport
                && let Err(err) = transport.send_stream_permission(self.stream.id, delta)
            {
                tracing::debug!(stream_id = self.stream.id, error = %err, "permission send failed");
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::close_code;

    fn detached(id: i64) -> Rc<ReadStream> {
        ReadStream::new(id, Weak::new())
    }

    fn poll_once(fut: &mut Pin<Box<RecvFuture>>) -> Poll<Option<TransportResult<Value>>> {
        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        fut.as_mut().poll(&mut cx)
    }

    fn open_for_test(stream: &ReadStream, window: u64) {
        stream.inner.borrow_mut().state = State::Open { window, freed: 0 };
    }

    #[test]
    fn test_sign_determines_kind() {
        assert!(!detached(1).is_binary());
        assert!(detached(-1).is_binary());
    }

    #[test]
    fn test_chunks_delivered_in_arrival_order() {
        let stream = detached(1);
        open_for_test(&stream, 10);

        // First chunk still decoding, second already ready.
        let pending = stream.begin_chunk(true).expect("slot");
        stream.push_chunk(Value::from(2i64), true);

        let mut recv = Box::pin(stream.recv());
        assert!(poll_once(&mut recv).is_pending());

        // Completing the first chunk releases both, in order.
        stream.complete_chunk(&pending, Ok(Value::from(1i64)));
        match poll_once(&mut recv) {
            Poll::Ready(Some(Ok(v))) => assert_eq!(v, Value::from(1i64)),
            other => panic!("unexpected: {other:?}"),
        }
        let mut recv = Box::pin(stream.recv());
        match poll_once(&mut recv) {
            Poll::Ready(Some(Ok(v))) => assert_eq!(v, Value::from(2i64)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_failed_chunk_skipped() {
        let stream = detached(1);
        open_for_test(&stream, 10);

        let bad = stream.begin_chunk(true).expect("slot");
        stream.complete_chunk(&bad, Err(TransportError::invalid_message("boom")));
        stream.push_chunk(Value::from(7i64), true);

        let mut recv = Box::pin(stream.recv());
        match poll_once(&mut recv) {
            Poll::Ready(Some(Ok(v))) => assert_eq!(v, Value::from(7i64)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_at_most_one_end() {
        let stream = detached(1);
        open_for_test(&stream, 10);

        stream.push_chunk(Value::from(1i64), true);
        stream.push_end();
        // Traffic after the terminal entry is dropped.
        stream.push_chunk(Value::from(2i64), true);
        stream.push_end();

        let mut recv = Box::pin(stream.recv());
        assert!(matches!(poll_once(&mut recv), Poll::Ready(Some(Ok(_)))));
        let mut recv = Box::pin(stream.recv());
        assert!(matches!(poll_once(&mut recv), Poll::Ready(None)));
        let mut recv = Box::pin(stream.recv());
        assert!(matches!(poll_once(&mut recv), Poll::Ready(None)));
    }

    #[test]
    fn test_remote_close_reported_once_after_drain() {
        let stream = detached(1);
        open_for_test(&stream, 10);

        stream.push_chunk(Value::from(1i64), true);
        stream.remote_close(close_code::ABORT);

        // Queued chunk drains first.
        let mut recv = Box::pin(stream.recv());
        assert!(matches!(poll_once(&mut recv), Poll::Ready(Some(Ok(_)))));

        // Then the close surfaces exactly once.
        let mut recv = Box::pin(stream.recv());
        assert!(matches!(
            poll_once(&mut recv),
            Poll::Ready(Some(Err(TransportError::StreamClosed {
                code: close_code::ABORT
            })))
        ));
        let mut recv = Box::pin(stream.recv());
        assert!(matches!(poll_once(&mut recv), Poll::Ready(None)));
    }

    #[test]
    fn test_double_accept_rejected() {
        let stream = detached(1);
        open_for_test(&stream, 10);
        assert!(stream.accept(5).is_err());
    }
}
