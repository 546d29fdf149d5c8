//! Shared harness for the loopback integration tests.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use braid::loopback::{self, LoopbackEndpoint};
use braid::{
    InvokeResponder, ListenerResult, TransportError, TransportHandler, TransportOptions, Value,
};

/// Auto-responder installed on a [`Recorder`] for invoke tests.
pub type AutoInvoke = Box<dyn Fn(&str, &Value, &InvokeResponder)>;

/// Handler that records everything it sees and can auto-answer invokes.
#[derive(Default)]
pub struct Recorder {
    pub transmits: RefCell<Vec<(String, Value)>>,
    pub invokes: RefCell<Vec<(String, Value, InvokeResponder)>>,
    pub invalid: RefCell<Vec<TransportError>>,
    pub listener_errors: RefCell<Vec<String>>,
    pub pings: Cell<usize>,
    pub pongs: Cell<usize>,
    pub auto_invoke: RefCell<Option<AutoInvoke>>,
}

impl Recorder {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn set_auto_invoke(&self, auto: AutoInvoke) {
        *self.auto_invoke.borrow_mut() = Some(auto);
    }

    pub fn last_transmit(&self) -> (String, Value) {
        self.transmits
            .borrow()
            .last()
            .cloned()
            .expect("expected a recorded transmit")
    }

    pub fn last_invoke(&self) -> (String, Value, InvokeResponder) {
        self.invokes
            .borrow()
            .last()
            .cloned()
            .expect("expected a recorded invoke")
    }

    pub fn invalid_count(&self) -> usize {
        self.invalid.borrow().len()
    }
}

impl TransportHandler for Recorder {
    fn on_transmit(&self, receiver: &str, data: Value) -> ListenerResult {
        self.transmits
            .borrow_mut()
            .push((receiver.to_string(), data));
        Ok(())
    }

    fn on_invoke(&self, procedure: &str, data: Value, responder: InvokeResponder) -> ListenerResult {
        if let Some(auto) = &*self.auto_invoke.borrow() {
            auto(procedure, &data, &responder);
        }
        self.invokes
            .borrow_mut()
            .push((procedure.to_string(), data, responder));
        Ok(())
    }

    fn on_ping(&self) -> ListenerResult {
        self.pings.set(self.pings.get() + 1);
        Ok(())
    }

    fn on_pong(&self) -> ListenerResult {
        self.pongs.set(self.pongs.get() + 1);
        Ok(())
    }

    fn on_invalid_message(&self, error: TransportError) {
        self.invalid.borrow_mut().push(error);
    }

    fn on_listener_error(&self, error: Box<dyn std::error::Error>) {
        self.listener_errors.borrow_mut().push(error.to_string());
    }
}

/// A loopback side together with its recording handler.
pub struct Side {
    pub endpoint: LoopbackEndpoint,
    pub recorder: Rc<Recorder>,
}

/// Build a loopback pair with recording handlers on both sides.
pub fn recorded_pair(options_a: TransportOptions, options_b: TransportOptions) -> (Side, Side) {
    let recorder_a = Recorder::new();
    let recorder_b = Recorder::new();
    let (endpoint_a, endpoint_b) = loopback::pair(
        recorder_a.clone(),
        options_a,
        recorder_b.clone(),
        options_b,
    );
    (
        Side {
            endpoint: endpoint_a,
            recorder: recorder_a,
        },
        Side {
            endpoint: endpoint_b,
            recorder: recorder_b,
        },
    )
}

/// Shorthand for a default-options recorded pair.
pub fn default_pair() -> (Side, Side) {
    recorded_pair(TransportOptions::default(), TransportOptions::default())
}
