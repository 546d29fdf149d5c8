//! In-memory loopback pair: two transports wired to each other.
//!
//! Each socket records what it sends and forwards frames to the peer
//! transport through a local task queue, so deliveries happen serially and
//! never reenter the sender's call stack. Used by the integration tests
//! and handy as an embedding reference.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::{Rc, Weak};

use bytes::Bytes;

use crate::config::TransportOptions;
use crate::handler::TransportHandler;
use crate::socket::{IncomingMessage, TransportSocket};
use crate::transport::Transport;

/// A frame recorded by a [`LoopbackSocket`].
#[derive(Debug, Clone, PartialEq)]
pub enum SentFrame {
    /// Text frame content.
    Text(String),
    /// Binary frame content.
    Binary(Vec<u8>),
}

/// One side of an in-memory socket pair.
pub struct LoopbackSocket {
    peer: RefCell<Weak<Transport>>,
    queue: Rc<RefCell<VecDeque<IncomingMessage>>>,
    draining: Rc<Cell<bool>>,
    low_backpressure: Cell<bool>,
    connected: Cell<bool>,
    sent: RefCell<Vec<SentFrame>>,
}

impl LoopbackSocket {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            peer: RefCell::new(Weak::new()),
            queue: Rc::new(RefCell::new(VecDeque::new())),
            draining: Rc::new(Cell::new(false)),
            low_backpressure: Cell::new(true),
            connected: Cell::new(true),
            sent: RefCell::new(Vec::new()),
        })
    }

    fn attach_peer(&self, peer: &Rc<Transport>) {
        *self.peer.borrow_mut() = Rc::downgrade(peer);
    }

    /// Frames sent through this socket so far, in order.
    pub fn sent_frames(&self) -> Vec<SentFrame> {
        self.sent.borrow().clone()
    }

    /// Forget recorded frames.
    pub fn clear_sent_frames(&self) {
        self.sent.borrow_mut().clear();
    }

    /// Toggle the backpressure probe result.
    pub fn set_low_send_backpressure(&self, low: bool) {
        self.low_backpressure.set(low);
    }

    /// Stop delivering frames to the peer (simulates a dead link). Frames
    /// sent while detached are recorded but dropped.
    pub fn detach(&self) {
        self.connected.set(false);
    }

    /// Resume delivering frames to the peer.
    pub fn reattach(&self) {
        self.connected.set(true);
    }

    fn deliver(&self, message: IncomingMessage) {
        if !self.connected.get() {
            return;
        }
        self.queue.borrow_mut().push_back(message);
        if self.draining.get() {
            return;
        }
        self.draining.set(true);
        let queue = self.queue.clone();
        let draining = self.draining.clone();
        let peer = self.peer.borrow().clone();
        tokio::task::spawn_local(async move {
            loop {
                let message = queue.borrow_mut().pop_front();
                let Some(message) = message else {
                    break;
                };
                if let Some(peer) = peer.upgrade() {
                    peer.emit_message(message);
                }
                tokio::task::yield_now().await;
            }
            draining.set(false);
        });
    }
}

impl TransportSocket for LoopbackSocket {
    fn send_text(&self, msg: &str) -> io::Result<()> {
        self.sent.borrow_mut().push(SentFrame::Text(msg.to_string()));
        self.deliver(IncomingMessage::Text(msg.to_string()));
        Ok(())
    }

    fn send_binary(&self, msg: &[u8]) -> io::Result<()> {
        self.sent.borrow_mut().push(SentFrame::Binary(msg.to_vec()));
        self.deliver(IncomingMessage::Binary(Bytes::copy_from_slice(msg)));
        Ok(())
    }

    fn has_low_send_backpressure(&self) -> bool {
        self.low_backpressure.get()
    }
}

/// One endpoint of a loopback pair.
pub struct LoopbackEndpoint {
    /// The transport bound to this side.
    pub transport: Rc<Transport>,
    /// The socket underneath it, exposing the frame log and link toggles.
    pub socket: Rc<LoopbackSocket>,
}

/// Wire two transports together over in-memory sockets.
///
/// Both transports start open; frames flow through `spawn_local` tasks,
/// so callers must run inside a `tokio::task::LocalSet`.
pub fn pair(
    handler_a: Rc<dyn TransportHandler>,
    options_a: TransportOptions,
    handler_b: Rc<dyn TransportHandler>,
    options_b: TransportOptions,
) -> (LoopbackEndpoint, LoopbackEndpoint) {
    let socket_a = LoopbackSocket::new();
    let socket_b = LoopbackSocket::new();
    let transport_a = Transport::new(socket_a.clone(), handler_a, options_a);
    let transport_b = Transport::new(socket_b.clone(), handler_b, options_b);
    socket_a.attach_peer(&transport_b);
    socket_b.attach_peer(&transport_a);
    (
        LoopbackEndpoint {
            transport: transport_a,
            socket: socket_a,
        },
        LoopbackEndpoint {
            transport: transport_b,
            socket: socket_b,
        },
    )
}

/// Let queued loopback deliveries and timers make progress.
///
/// Yields the current task a number of rounds so `spawn_local` delivery
/// tasks (and anything they trigger) run to quiescence.
pub async fn settle() {
    for _ in 0..48 {
        tokio::task::yield_now().await;
    }
}
