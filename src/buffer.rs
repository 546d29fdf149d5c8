//! Outbound packages and the batch/disconnect buffer.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Hook fired exactly once after the package's frames hit the socket.
pub(crate) type AfterSend = Box<dyn FnOnce()>;

struct PackageInner {
    head: String,
    binary_frame: Option<Vec<u8>>,
    after_send: RefCell<Option<AfterSend>>,
    sent: Cell<bool>,
    sent_wakers: RefCell<Vec<Waker>>,
}

/// An outbound unit: a text head, an optional companion binary-content
/// frame, and an optional post-send hook.
///
/// Packages are cheap handles; clones refer to the same unit, which is
/// what lets [`Transport::try_cancel_package`](crate::Transport::try_cancel_package)
/// find a buffered package again.
#[derive(Clone)]
pub struct Package {
    inner: Rc<PackageInner>,
}

impl Package {
    pub(crate) fn new(head: String, binary_frame: Option<Vec<u8>>, after_send: Option<AfterSend>) -> Self {
        Self {
            inner: Rc::new(PackageInner {
                head,
                binary_frame,
                after_send: RefCell::new(after_send),
                sent: Cell::new(false),
                sent_wakers: RefCell::new(Vec::new()),
            }),
        }
    }

    /// The text head (a comma-joined packet tuple).
    pub fn head(&self) -> &str {
        &self.inner.head
    }

    /// The companion binary-content frame, if the payload embeds blobs.
    pub fn binary_frame(&self) -> Option<&[u8]> {
        self.inner.binary_frame.as_deref()
    }

    /// Whether the package has been handed to the socket.
    pub fn is_sent(&self) -> bool {
        self.inner.sent.get()
    }

    /// Future resolving once the package (and its after-send hook) went
    /// out.
    pub fn sent(&self) -> SentFuture {
        SentFuture {
            package: self.clone(),
        }
    }

    /// Two handles to the same package.
    pub fn same(&self, other: &Package) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run the after-send hook and resolve `sent()` waiters. Idempotent.
    pub(crate) fn fire_after_send(&self) {
        if self.inner.sent.replace(true) {
            return;
        }
        if let Some(hook) = self.inner.after_send.borrow_mut().take() {
            hook();
        }
        let wakers = std::mem::take(&mut *self.inner.sent_wakers.borrow_mut());
        for waker in wakers {
            waker.wake();
        }
    }
}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package")
            .field("head", &self.inner.head)
            .field("binary_frame_len", &self.inner.binary_frame.as_ref().map(Vec::len))
            .field("sent", &self.inner.sent.get())
            .finish()
    }
}

/// Future returned by [`Package::sent`].
pub struct SentFuture {
    package: Package,
}

impl Future for SentFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.package.inner.sent.get() {
            Poll::Ready(())
        } else {
            self.package
                .inner
                .sent_wakers
                .borrow_mut()
                .push(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Buffer of not-yet-sent packages.
///
/// Holds batched packages until their earliest deadline fires (or the
/// buffer fills up) and absorbs every send issued while the connection is
/// down. Flushing is driven by the transport, which owns the socket.
#[derive(Default)]
pub(crate) struct PackageBuffer {
    items: RefCell<Vec<Package>>,
    batch_timer: RefCell<Option<JoinHandle<()>>>,
    /// Deadline of the armed timer, to avoid re-arming for a later one.
    batch_deadline: Cell<Option<tokio::time::Instant>>,
}

impl PackageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    /// Add a package. Returns the batch delay if a (re-)armed timer is
    /// needed: the caller owns timer scheduling.
    pub fn add(&self, package: Package, batch: Option<Duration>) -> Option<Duration> {
        self.items.borrow_mut().push(package);
        let delay = batch?;
        let deadline = tokio::time::Instant::now() + delay;
        match self.batch_deadline.get() {
            Some(existing) if existing <= deadline => None,
            _ => {
                self.batch_deadline.set(Some(deadline));
                Some(delay)
            }
        }
    }

    /// Store the armed batch timer, aborting any earlier one.
    pub fn set_batch_timer(&self, timer: JoinHandle<()>) {
        if let Some(old) = self.batch_timer.borrow_mut().replace(timer) {
            old.abort();
        }
    }

    /// Cancel the batch timer without touching buffered packages.
    pub fn clear_batch_time(&self) {
        if let Some(timer) = self.batch_timer.borrow_mut().take() {
            timer.abort();
        }
        self.batch_deadline.set(None);
    }

    /// Take every buffered package for flushing.
    pub fn drain(&self) -> Vec<Package> {
        self.clear_batch_time();
        std::mem::take(&mut *self.items.borrow_mut())
    }

    /// Drop the oldest buffered package (overflow while disconnected).
    pub fn drop_oldest(&self) {
        let mut items = self.items.borrow_mut();
        if !items.is_empty() {
            let dropped = items.remove(0);
            tracing::debug!(head = dropped.head(), "package buffer overflow, dropping oldest");
        }
    }

    /// Remove a buffered package by identity. Returns whether it was
    /// still buffered.
    pub fn try_remove(&self, package: &Package) -> bool {
        let mut items = self.items.borrow_mut();
        match items.iter().position(|p| p.same(package)) {
            Some(index) => {
                items.remove(index);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn package(head: &str) -> Package {
        Package::new(head.to_string(), None, None)
    }

    #[test]
    fn test_after_send_fires_once() {
        let count = Rc::new(Cell::new(0));
        let clone = count.clone();
        let package = Package::new(
            "1,\"r\",0".to_string(),
            None,
            Some(Box::new(move || clone.set(clone.get() + 1))),
        );

        assert!(!package.is_sent());
        package.fire_after_send();
        package.fire_after_send();
        assert!(package.is_sent());
        assert_eq!(count.get(), 1);
    }

    #[tokio::test]
    async fn test_sent_future() {
        let package = package("1,\"r\",0");
        let sent = package.sent();
        package.fire_after_send();
        sent.await;
    }

    #[test]
    fn test_try_remove_by_identity() {
        let buffer = PackageBuffer::new();
        let a = package("a");
        let b = package("b");
        buffer.add(a.clone(), None);
        buffer.add(b.clone(), None);

        assert!(buffer.try_remove(&a));
        assert!(!buffer.try_remove(&a));
        assert_eq!(buffer.len(), 1);

        let drained = buffer.drain();
        assert_eq!(drained.len(), 1);
        assert!(drained[0].same(&b));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_batch_deadline_only_tightens() {
        let buffer = PackageBuffer::new();
        assert!(
            buffer
                .add(package("a"), Some(Duration::from_millis(50)))
                .is_some()
        );
        // A later deadline does not need a new timer.
        assert!(
            buffer
                .add(package("b"), Some(Duration::from_millis(500)))
                .is_none()
        );
        // An earlier one does.
        assert!(
            buffer
                .add(package("c"), Some(Duration::from_millis(5)))
                .is_some()
        );
    }

    #[test]
    fn test_drop_oldest() {
        let buffer = PackageBuffer::new();
        buffer.add(package("a"), None);
        buffer.add(package("b"), None);
        buffer.drop_oldest();

        let drained = buffer.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].head(), "b");

        // Empty buffer: no-op.
        buffer.drop_oldest();
    }

    #[test]
    fn test_clone_is_same_package() {
        let a = package("x");
        let b = a.clone();
        assert!(a.same(&b));
        assert!(!a.same(&package("x")));
    }
}
