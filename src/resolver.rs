//! Pending binary-content resolvers.
//!
//! A text packet whose data type references a binary-content packet
//! registers a resolver under that id; the callback fires when the
//! out-of-band frame (or chain of frames) arrives, when the deadline
//! expires, or when the connection goes bad.
//!
//! Chained frames use the buffered semantics: blobs accumulate on the
//! pending entry across frames carrying the continuation sentinel, and the
//! callback fires exactly once when a frame arrives without it.

use std::cell::RefCell;
use std::collections::HashMap;

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::error::{TransportError, TransportResult};

/// Callback invoked with the collected blobs or the failure reason.
pub(crate) type ResolverCallback = Box<dyn FnOnce(TransportResult<Vec<Bytes>>)>;

struct PendingBinaries {
    callback: ResolverCallback,
    timer: Option<JoinHandle<()>>,
    collected: Vec<Bytes>,
}

/// Outcome of delivering a binary-content frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DeliverOutcome {
    /// The resolver fired; the entry is gone.
    Completed,
    /// The frame carried the continuation sentinel; the entry stays and
    /// its timer should be re-armed.
    Continued,
    /// No resolver is registered under this id (stale traffic).
    Unknown,
}

/// Table of outstanding binary-content resolvers, keyed by packet id.
#[derive(Default)]
pub(crate) struct BinaryResolverTable {
    pending: RefCell<HashMap<i64, PendingBinaries>>,
}

impl BinaryResolverTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a resolver is outstanding under `id`.
    pub fn contains(&self, id: i64) -> bool {
        self.pending.borrow().contains_key(&id)
    }

    /// Number of outstanding resolvers.
    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Register a resolver. A second registration under a live id is a
    /// protocol violation.
    pub fn register(&self, id: i64, callback: ResolverCallback) -> TransportResult<()> {
        let mut pending = self.pending.borrow_mut();
        if pending.contains_key(&id) {
            return Err(TransportError::invalid_message(format!(
                "duplicate binary content id {id}"
            )));
        }
        pending.insert(
            id,
            PendingBinaries {
                callback,
                timer: None,
                collected: Vec::new(),
            },
        );
        Ok(())
    }

    /// Attach (or replace) the timeout timer of a pending entry.
    pub fn set_timer(&self, id: i64, timer: JoinHandle<()>) {
        if let Some(entry) = self.pending.borrow_mut().get_mut(&id)
            && let Some(old) = entry.timer.replace(timer)
        {
            old.abort();
        }
    }

    /// Deliver the blobs of one binary-content frame.
    pub fn deliver(&self, id: i64, blobs: Vec<Bytes>, continued: bool) -> DeliverOutcome {
        let entry = {
            let mut pending = self.pending.borrow_mut();
            let Some(entry) = pending.get_mut(&id) else {
                return DeliverOutcome::Unknown;
            };
            entry.collected.extend(blobs);
            if continued {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
                return DeliverOutcome::Continued;
            }
            pending.remove(&id)
        };
        if let Some(entry) = entry {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            (entry.callback)(Ok(entry.collected));
        }
        DeliverOutcome::Completed
    }

    /// Expire the entry under `id` with a binary-resolve timeout.
    pub fn expire(&self, id: i64) {
        let entry = self.pending.borrow_mut().remove(&id);
        if let Some(entry) = entry {
            (entry.callback)(Err(TransportError::Timeout {
                kind: crate::error::TimeoutKind::BinaryResolve,
            }));
        }
    }

    /// Reject every outstanding resolver with `error`.
    pub fn reject_all(&self, error: &TransportError) {
        let entries: Vec<PendingBinaries> = {
            let mut pending = self.pending.borrow_mut();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            (entry.callback)(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn capture() -> (
        Rc<RefCell<Option<TransportResult<Vec<Bytes>>>>>,
        ResolverCallback,
    ) {
        let slot: Rc<RefCell<Option<TransportResult<Vec<Bytes>>>>> = Rc::new(RefCell::new(None));
        let clone = slot.clone();
        (slot, Box::new(move |result| *clone.borrow_mut() = Some(result)))
    }

    #[test]
    fn test_register_and_deliver() {
        let table = BinaryResolverTable::new();
        let (slot, cb) = capture();
        table.register(1, cb).expect("register");
        assert!(table.contains(1));

        let outcome = table.deliver(1, vec![Bytes::from_static(b"a")], false);
        assert_eq!(outcome, DeliverOutcome::Completed);
        assert!(!table.contains(1));

        let blobs = slot.borrow_mut().take().expect("fired").expect("ok");
        assert_eq!(blobs, vec![Bytes::from_static(b"a")]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let table = BinaryResolverTable::new();
        let (_, cb) = capture();
        table.register(9, cb).expect("register");
        let (_, cb2) = capture();
        assert!(table.register(9, cb2).is_err());
    }

    #[test]
    fn test_chained_frames_buffer_until_final() {
        let table = BinaryResolverTable::new();
        let (slot, cb) = capture();
        table.register(4, cb).expect("register");

        assert_eq!(
            table.deliver(4, vec![Bytes::from_static(b"one")], true),
            DeliverOutcome::Continued
        );
        assert!(slot.borrow().is_none());
        assert!(table.contains(4));

        assert_eq!(
            table.deliver(4, vec![Bytes::from_static(b"two")], false),
            DeliverOutcome::Completed
        );
        let blobs = slot.borrow_mut().take().expect("fired").expect("ok");
        assert_eq!(
            blobs,
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
    }

    #[test]
    fn test_unknown_id_ignored() {
        let table = BinaryResolverTable::new();
        assert_eq!(
            table.deliver(7, vec![Bytes::from_static(b"x")], false),
            DeliverOutcome::Unknown
        );
    }

    #[test]
    fn test_expire_fires_timeout() {
        let table = BinaryResolverTable::new();
        let (slot, cb) = capture();
        table.register(2, cb).expect("register");
        table.expire(2);

        let result = slot.borrow_mut().take().expect("fired");
        assert!(matches!(
            result,
            Err(TransportError::Timeout {
                kind: crate::error::TimeoutKind::BinaryResolve
            })
        ));
        assert!(!table.contains(2));

        // Expiring again is a no-op.
        table.expire(2);
    }

    #[test]
    fn test_reject_all() {
        let table = BinaryResolverTable::new();
        let (slot_a, cb_a) = capture();
        let (slot_b, cb_b) = capture();
        table.register(1, cb_a).expect("register");
        table.register(2, cb_b).expect("register");

        let error = TransportError::bad_connection(
            crate::error::BadConnectionKind::ConnectionLost,
            "gone",
        );
        table.reject_all(&error);

        assert_eq!(table.len(), 0);
        assert!(slot_a.borrow_mut().take().expect("fired").is_err());
        assert!(slot_b.borrow_mut().take().expect("fired").is_err());
    }
}
