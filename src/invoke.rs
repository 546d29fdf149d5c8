//! Invoke correlation: call ids, pending response promises, and the
//! receiving-side responder.
//!
//! Call ids are unsigned-monotonic and wrap at the safe-integer ceiling
//! back to 0, skipping ids that still have a pending entry. Response
//! timers are armed lazily by the transport: not before the package went
//! out, and not while embedded streams are still transmitting.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use tokio::task::JoinHandle;

use crate::error::{RemoteError, TransportError, TransportResult};
use crate::transport::Transport;
use crate::value::Value;
use crate::wire::{DataType, MAX_SAFE_INTEGER};

/// A resolved invocation: the decoded payload plus its wire data type.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeReturn {
    /// Decoded response payload.
    pub data: Value,
    /// How the payload was carried on the wire.
    pub data_type: DataType,
}

pub(crate) struct Slot {
    result: Option<TransportResult<InvokeReturn>>,
    wakers: Vec<Waker>,
}

pub(crate) type InvokeSlot = Rc<RefCell<Slot>>;

pub(crate) fn new_slot() -> InvokeSlot {
    Rc::new(RefCell::new(Slot {
        result: None,
        wakers: Vec::new(),
    }))
}

/// Future resolving with the peer's response to an invocation.
pub struct InvokeFuture {
    slot: InvokeSlot,
}

impl InvokeFuture {
    pub(crate) fn new(slot: InvokeSlot) -> Self {
        Self { slot }
    }
}

impl Future for InvokeFuture {
    type Output = TransportResult<InvokeReturn>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        match slot.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                slot.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

struct PendingInvoke {
    slot: InvokeSlot,
    timer: Option<JoinHandle<()>>,
}

/// Table of in-flight invocations keyed by call id.
#[derive(Default)]
pub(crate) struct InvokeTable {
    pending: RefCell<HashMap<i64, PendingInvoke>>,
    next_call_id: Cell<i64>,
}

impl InvokeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next call id, wrapping at the safe-integer ceiling and
    /// skipping ids still outstanding.
    pub fn alloc_call_id(&self) -> i64 {
        let pending = self.pending.borrow();
        let mut id = self.next_call_id.get();
        while pending.contains_key(&id) {
            id = wrap_next(id);
        }
        drop(pending);
        self.next_call_id.set(wrap_next(id));
        id
    }

    pub fn is_pending(&self, call_id: i64) -> bool {
        self.pending.borrow().contains_key(&call_id)
    }

    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Install the response slot for `call_id` (at after-send time).
    pub fn install(&self, call_id: i64, slot: InvokeSlot) {
        self.pending.borrow_mut().insert(
            call_id,
            PendingInvoke {
                slot,
                timer: None,
            },
        );
    }

    /// Attach (or replace) the response timer of a pending entry.
    pub fn set_timer(&self, call_id: i64, timer: JoinHandle<()>) {
        if let Some(entry) = self.pending.borrow_mut().get_mut(&call_id)
            && let Some(old) = entry.timer.replace(timer)
        {
            old.abort();
        }
    }

    /// Complete the invocation. Returns `false` when no entry is pending
    /// under this id (stale response).
    pub fn complete(&self, call_id: i64, result: TransportResult<InvokeReturn>) -> bool {
        let entry = self.pending.borrow_mut().remove(&call_id);
        let Some(entry) = entry else {
            return false;
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        fill_slot(&entry.slot, result);
        true
    }

    /// Reject every pending invocation with `error`.
    pub fn reject_all(&self, error: &TransportError) {
        let entries: Vec<PendingInvoke> = {
            let mut pending = self.pending.borrow_mut();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            fill_slot(&entry.slot, Err(error.clone()));
        }
    }
}

fn fill_slot(slot: &InvokeSlot, result: TransportResult<InvokeReturn>) {
    let wakers = {
        let mut slot = slot.borrow_mut();
        if slot.result.is_some() {
            return;
        }
        slot.result = Some(result);
        std::mem::take(&mut slot.wakers)
    };
    for waker in wakers {
        waker.wake();
    }
}

fn wrap_next(id: i64) -> i64 {
    if id >= MAX_SAFE_INTEGER { 0 } else { id + 1 }
}

struct ResponderInner {
    transport: Weak<Transport>,
    call_id: i64,
    stamp: u64,
    fulfilled: bool,
}

/// Single-shot response handle delivered with each inbound invocation.
///
/// Exactly one of [`send_data`](InvokeResponder::send_data) /
/// [`send_err`](InvokeResponder::send_err) must be called; a second call
/// is a programmer error reported through `on_listener_error`. Both become
/// no-ops if the connection was lost (and possibly reestablished) since
/// the invocation was delivered.
#[derive(Clone)]
pub struct InvokeResponder {
    inner: Rc<RefCell<ResponderInner>>,
}

impl InvokeResponder {
    pub(crate) fn new(transport: Weak<Transport>, call_id: i64, stamp: u64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ResponderInner {
                transport,
                call_id,
                stamp,
                fulfilled: false,
            })),
        }
    }

    /// The call id this responder answers.
    pub fn call_id(&self) -> i64 {
        self.inner.borrow().call_id
    }

    /// Send the success response.
    ///
    /// The payload may embed blobs and streams like any other package.
    ///
    /// # Errors
    ///
    /// Fails if the payload cannot be encoded or the socket rejects the
    /// frame. Double sends and stale connections are not errors: they are
    /// reported (respectively swallowed) internally.
    pub fn send_data(&self, value: Value) -> TransportResult<()> {
        let Some((transport, call_id)) = self.take_shot() else {
            return Ok(());
        };
        transport.send_invoke_data_resp(call_id, &value)
    }

    /// Send an error response.
    ///
    /// # Errors
    ///
    /// Same policy as [`send_data`](InvokeResponder::send_data).
    pub fn send_err(&self, error: RemoteError) -> TransportResult<()> {
        let Some((transport, call_id)) = self.take_shot() else {
            return Ok(());
        };
        transport.send_invoke_err_resp(call_id, &error)
    }

    /// Consume the single shot. Returns `None` (after reporting, where
    /// appropriate) when the response must not be sent.
    fn take_shot(&self) -> Option<(Rc<Transport>, i64)> {
        let mut inner = self.inner.borrow_mut();
        if inner.fulfilled {
            let transport = inner.transport.upgrade();
            drop(inner);
            if let Some(transport) = transport {
                transport.report_listener_error(Box::new(TransportError::invalid_action(
                    "invoke response already sent",
                )));
            }
            return None;
        }
        inner.fulfilled = true;
        let transport = inner.transport.upgrade()?;
        // Fence: the connection this invocation arrived on is gone.
        if transport.bad_connection_stamp() != inner.stamp {
            return None;
        }
        Some((transport, inner.call_id))
    }
}

impl std::fmt::Debug for InvokeResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("InvokeResponder")
            .field("call_id", &inner.call_id)
            .field("fulfilled", &inner.fulfilled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(value: i64) -> TransportResult<InvokeReturn> {
        Ok(InvokeReturn {
            data: Value::Num(value.into()),
            data_type: DataType::Json,
        })
    }

    #[test]
    fn test_call_ids_monotonic() {
        let table = InvokeTable::new();
        assert_eq!(table.alloc_call_id(), 0);
        assert_eq!(table.alloc_call_id(), 1);
        assert_eq!(table.alloc_call_id(), 2);
    }

    #[test]
    fn test_call_id_wrap_skips_outstanding() {
        let table = InvokeTable::new();
        table.next_call_id.set(MAX_SAFE_INTEGER);

        // Occupy the ids the wrap would land on.
        table.install(0, new_slot());
        table.install(1, new_slot());

        assert_eq!(table.alloc_call_id(), MAX_SAFE_INTEGER);
        // Wrapped past the ceiling; 0 and 1 are outstanding, so 2 is next.
        assert_eq!(table.alloc_call_id(), 2);
    }

    #[test]
    fn test_complete_resolves_slot() {
        let table = InvokeTable::new();
        let slot = new_slot();
        table.install(7, slot.clone());
        assert!(table.is_pending(7));

        assert!(table.complete(7, ready(5)));
        assert!(!table.is_pending(7));

        let result = slot.borrow_mut().result.take().expect("resolved");
        assert_eq!(result.expect("ok").data.as_i64(), Some(5));

        // Stale second response finds nothing.
        assert!(!table.complete(7, ready(6)));
    }

    #[test]
    fn test_reject_all() {
        let table = InvokeTable::new();
        let slot_a = new_slot();
        let slot_b = new_slot();
        table.install(1, slot_a.clone());
        table.install(2, slot_b.clone());

        let error = TransportError::bad_connection(
            crate::error::BadConnectionKind::ConnectionLost,
            "lost",
        );
        table.reject_all(&error);
        assert_eq!(table.len(), 0);

        for slot in [slot_a, slot_b] {
            let result = slot.borrow_mut().result.take().expect("rejected");
            assert!(result.expect_err("err").is_bad_connection());
        }
    }

    #[tokio::test]
    async fn test_invoke_future_resolves() {
        let slot = new_slot();
        let future = InvokeFuture::new(slot.clone());
        fill_slot(&slot, ready(11));

        let result = future.await.expect("ok");
        assert_eq!(result.data.as_i64(), Some(11));
        assert_eq!(result.data_type, DataType::Json);
    }

    #[test]
    fn test_fill_slot_is_single_shot() {
        let slot = new_slot();
        fill_slot(&slot, ready(1));
        fill_slot(&slot, ready(2));
        let result = slot.borrow_mut().result.take().expect("first result kept");
        assert_eq!(result.expect("ok").data.as_i64(), Some(1));
    }

    #[test]
    fn test_invoke_return_equality() {
        let a = InvokeReturn {
            data: Value::Str("x".into()),
            data_type: DataType::Json,
        };
        let b = InvokeReturn {
            data: Value::Str("x".into()),
            data_type: DataType::Json,
        };
        assert_eq!(a, b);
    }
}
