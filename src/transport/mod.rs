//! The transport controller.
//!
//! Glues the codec, the invoke registry, the resolver table, and the
//! stream engines together: outbound calls become packages (text head plus
//! optional binary-content frame) sent immediately or batched; inbound
//! frames are classified, parsed, and dispatched to the listener hooks.
//!
//! All state lives behind `RefCell`s inside an `Rc<Transport>`; the
//! controller is single-threaded cooperative and every deferred piece of
//! work (timers, pending binary decodes, batch deadlines) runs on
//! `spawn_local` tasks holding a `Weak` reference, fenced by the
//! bad-connection stamp.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;

use crate::buffer::{AfterSend, Package, PackageBuffer};
use crate::codec::{self, Decoded, DecodeEnv, EncodeEnv, EncodedPayload};
use crate::config::TransportOptions;
use crate::error::{BadConnectionKind, RemoteError, TransportError, TransportResult};
use crate::handler::{ListenerResult, TransportHandler};
use crate::invoke::{InvokeFuture, InvokeResponder, InvokeReturn, InvokeTable};
use crate::resolver::{BinaryResolverTable, DeliverOutcome, ResolverCallback};
use crate::socket::{IncomingMessage, TransportSocket};
use crate::stream::{ReadStream, WriteStream, close_code};
use crate::value::Value;
use crate::wire::{
    self, BinaryFrame, DataType, MAX_SAFE_INTEGER, PING_UINT8, PONG_UINT8, PacketType,
};

/// Options for a single transmit.
#[derive(Clone, Debug)]
pub struct TransmitOptions {
    /// Batch deadline: hold the package up to this long to coalesce it
    /// with other sends into one bundle.
    pub batch: Option<Duration>,
    /// Whether the payload may embed blobs and streams. When `false` the
    /// payload is treated as pure JSON and complex values fail the send.
    pub process_complex_types: bool,
}

impl Default for TransmitOptions {
    fn default() -> Self {
        Self {
            batch: None,
            process_complex_types: true,
        }
    }
}

/// Options for a single invocation.
#[derive(Clone, Debug)]
pub struct InvokeOptions {
    /// Batch deadline, as for [`TransmitOptions::batch`].
    pub batch: Option<Duration>,
    /// Whether the payload may embed blobs and streams.
    pub process_complex_types: bool,
    /// Per-call override of the configured response timeout.
    pub response_timeout: Option<Duration>,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            batch: None,
            process_complex_types: true,
            response_timeout: None,
        }
    }
}

/// The transport state machine multiplexing transmits, invocations, and
/// streams over one socket.
///
/// Construct with [`Transport::new`], feed inbound frames through
/// [`emit_message`](Transport::emit_message), and signal connection state
/// changes with [`emit_connection`](Transport::emit_connection) /
/// [`emit_bad_connection`](Transport::emit_bad_connection).
pub struct Transport {
    weak_self: std::rc::Weak<Transport>,
    socket: Rc<dyn TransportSocket>,
    handler: Rc<dyn TransportHandler>,
    options: TransportOptions,
    open: Cell<bool>,
    stamp: Cell<u64>,
    invokes: InvokeTable,
    resolvers: BinaryResolverTable,
    write_streams: RefCell<HashMap<i64, Rc<WriteStream>>>,
    read_streams: RefCell<HashMap<i64, Rc<ReadStream>>>,
    next_binary_content_id: Cell<i64>,
    next_object_stream_id: Cell<i64>,
    next_binary_stream_id: Cell<i64>,
    buffer: PackageBuffer,
    backpressure_waiters: RefCell<VecDeque<std::task::Waker>>,
}

impl Transport {
    /// Create a transport over `socket`, delivering events to `handler`.
    ///
    /// The transport starts open; call
    /// [`emit_bad_connection`](Transport::emit_bad_connection) when the
    /// underlying channel drops.
    pub fn new(
        socket: Rc<dyn TransportSocket>,
        handler: Rc<dyn TransportHandler>,
        options: TransportOptions,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            socket,
            handler,
            options,
            open: Cell::new(true),
            stamp: Cell::new(0),
            invokes: InvokeTable::new(),
            resolvers: BinaryResolverTable::new(),
            write_streams: RefCell::new(HashMap::new()),
            read_streams: RefCell::new(HashMap::new()),
            next_binary_content_id: Cell::new(0),
            next_object_stream_id: Cell::new(1),
            next_binary_stream_id: Cell::new(-1),
            buffer: PackageBuffer::new(),
            backpressure_waiters: RefCell::new(VecDeque::new()),
        })
    }

    /// The configured options.
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    fn weak(&self) -> std::rc::Weak<Transport> {
        self.weak_self.clone()
    }

    /// Whether the connection is currently usable.
    pub fn is_open(&self) -> bool {
        self.open.get()
    }

    /// The bad-connection stamp: changes on every
    /// [`emit_bad_connection`](Transport::emit_bad_connection), fencing
    /// deferred work from before the disconnect.
    pub fn bad_connection_stamp(&self) -> u64 {
        self.stamp.get()
    }

    /// Number of invocations awaiting a response.
    pub fn pending_invokes(&self) -> usize {
        self.invokes.len()
    }

    /// Number of packages held in the batch/disconnect buffer.
    pub fn buffered_packages(&self) -> usize {
        self.buffer.len()
    }

    // =====================================================================
    // Outbound surface
    // =====================================================================

    /// Fire-and-forget send to the peer's `receiver` listener.
    ///
    /// # Errors
    ///
    /// Fails if the payload cannot be encoded or the socket rejects the
    /// frame.
    pub fn transmit(
        &self,
        receiver: &str,
        data: &Value,
        options: &TransmitOptions,
    ) -> TransportResult<()> {
        let package = self.prepare_transmit(receiver, data, options.process_complex_types)?;
        self.send_package(package, options.batch)
    }

    /// Invoke `procedure` on the peer and await its response payload.
    ///
    /// # Errors
    ///
    /// Fails on encode/send errors; the awaited result fails on error
    /// responses, response timeout, or bad connection.
    pub async fn invoke(
        &self,
        procedure: &str,
        data: &Value,
        options: &InvokeOptions,
    ) -> TransportResult<Value> {
        Ok(self.invoke_detailed(procedure, data, options)?.await?.data)
    }

    /// Like [`invoke`](Transport::invoke), but returns the future
    /// immediately and resolves to the payload together with its wire
    /// data type.
    pub fn invoke_detailed(
        &self,
        procedure: &str,
        data: &Value,
        options: &InvokeOptions,
    ) -> TransportResult<InvokeFuture> {
        let (package, future) = self.prepare_invoke(procedure, data, options)?;
        self.send_package(package, options.batch)?;
        Ok(future)
    }

    /// Build a transmit package without sending it.
    pub fn prepare_transmit(
        &self,
        receiver: &str,
        data: &Value,
        process_complex_types: bool,
    ) -> TransportResult<Package> {
        let payload = self.encode(data, process_complex_types)?;
        let mut parts = vec![
            json!(PacketType::Transmit as u8),
            json!(receiver),
            json!(payload.data_type as u8),
            payload.data.clone(),
        ];
        if let Some(meta) = &payload.meta {
            parts.push(meta.clone());
        }
        let head = wire::head_from_parts(&parts);
        let binary_frame = Self::payload_frame(&payload)?;
        let after_send = self.activate_streams_hook(payload.streams);
        Ok(Package::new(head, binary_frame, after_send))
    }

    /// Build an invoke package without sending it. The returned future
    /// stays pending until the package is actually sent and answered.
    pub fn prepare_invoke(
        &self,
        procedure: &str,
        data: &Value,
        options: &InvokeOptions,
    ) -> TransportResult<(Package, InvokeFuture)> {
        let payload = self.encode(data, options.process_complex_types)?;
        let call_id = self.invokes.alloc_call_id();

        let mut parts = vec![
            json!(PacketType::Invoke as u8),
            json!(procedure),
            json!(call_id),
            json!(payload.data_type as u8),
            payload.data.clone(),
        ];
        if let Some(meta) = &payload.meta {
            parts.push(meta.clone());
        }
        let head = wire::head_from_parts(&parts);
        let binary_frame = Self::payload_frame(&payload)?;

        let slot = crate::invoke::new_slot();
        let future = InvokeFuture::new(slot.clone());
        let timeout = options
            .response_timeout
            .unwrap_or(self.options.response_timeout);
        let streams = payload.streams;
        let weak = self.weak();

        // The pending entry is installed (and the timer armed) only after
        // the package actually went out; before that, cancelling the
        // package leaves no trace. The timer stays unarmed while embedded
        // streams are still transmitting.
        let after_send: AfterSend = Box::new(move || {
            let Some(transport) = weak.upgrade() else {
                return;
            };
            transport.activate_streams(&streams);
            transport.invokes.install(call_id, slot);
            if streams.is_empty() {
                transport.arm_invoke_timer(call_id, timeout);
            } else {
                transport.arm_invoke_timer_after_streams(call_id, streams.clone(), timeout);
            }
        });

        Ok((Package::new(head, binary_frame, Some(after_send)), future))
    }

    /// Send a prepared package: buffered while disconnected, batched when
    /// a deadline is given, immediate otherwise.
    ///
    /// # Errors
    ///
    /// Immediate sends propagate socket errors; buffered sends cannot
    /// fail.
    pub fn send_package(
        &self,
        package: Package,
        batch: Option<Duration>,
    ) -> TransportResult<()> {
        if !self.open.get() {
            // Disconnected: absorb the send, dropping the oldest package
            // once the buffer is at capacity.
            if self.buffer.len() >= self.options.max_buffer_size {
                self.buffer.drop_oldest();
            }
            self.buffer.add(package, None);
            return Ok(());
        }
        match batch {
            Some(delay) => {
                if let Some(delay) = self.buffer.add(package, Some(delay)) {
                    self.arm_batch_timer(delay);
                }
                if self.buffer.len() >= self.options.max_buffer_size {
                    self.flush_buffer();
                }
                Ok(())
            }
            None => self.send_package_now(&package),
        }
    }

    /// [`send_package`](Transport::send_package), resolving once the
    /// package's after-send hook has fired.
    pub async fn send_package_with_promise(
        &self,
        package: Package,
        batch: Option<Duration>,
    ) -> TransportResult<()> {
        let sent = package.sent();
        self.send_package(package, batch)?;
        sent.await;
        Ok(())
    }

    /// Remove a package from the batch buffer if it has not been sent
    /// yet.
    pub fn try_cancel_package(&self, package: &Package) -> bool {
        self.buffer.try_remove(package)
    }

    /// Cancel the pending batch deadline without touching buffered
    /// packages; they flush on the next trigger.
    pub fn clear_batch_time(&self) {
        self.buffer.clear_batch_time();
    }

    /// Flush every buffered package, coalescing multiples into one
    /// bundle frame.
    pub fn flush_buffer(&self) {
        if !self.open.get() {
            return;
        }
        let packages = self.buffer.drain();
        match packages.len() {
            0 => {}
            1 => {
                if let Err(err) = self.send_package_now(&packages[0]) {
                    tracing::warn!(error = %err, "buffered package send failed");
                }
            }
            _ => self.send_bundle(&packages),
        }
    }

    /// Create an object write stream ready for embedding in a payload.
    ///
    /// Equivalent to [`WriteStream::object`]; the stream binds to this
    /// transport when it is first encoded into a package.
    pub fn create_object_stream(&self) -> Rc<WriteStream> {
        WriteStream::object()
    }

    /// Create a binary write stream ready for embedding in a payload.
    pub fn create_binary_stream(&self) -> Rc<WriteStream> {
        WriteStream::binary()
    }

    /// Send the single-byte ping frame. Socket errors are swallowed.
    pub fn send_ping(&self) {
        if self.socket.send_binary(&[PING_UINT8]).is_err() {
            tracing::debug!("ping send failed");
        }
    }

    /// Send the single-byte pong frame. Socket errors are swallowed.
    pub fn send_pong(&self) {
        if self.socket.send_binary(&[PONG_UINT8]).is_err() {
            tracing::debug!("pong send failed");
        }
    }

    // =====================================================================
    // Connection lifecycle
    // =====================================================================

    /// The underlying channel is (re)established: start sending and flush
    /// everything buffered while disconnected.
    pub fn emit_connection(&self) {
        self.open.set(true);
        self.flush_buffer();
    }

    /// The underlying channel dropped.
    ///
    /// Advances the bad-connection stamp first, then rejects every
    /// pending invocation and resolver and closes every live stream with
    /// [`close_code::BAD_CONNECTION`]. Identifier counters are not reset:
    /// packets for old ids arriving after a reconnect are dropped by the
    /// id lookups.
    pub fn emit_bad_connection(&self, kind: BadConnectionKind, message: impl Into<String>) {
        self.open.set(false);
        self.stamp.set(self.stamp.get().wrapping_add(1));
        self.buffer.clear_batch_time();

        let error = TransportError::bad_connection(kind, message);
        tracing::debug!(%error, "bad connection");
        self.invokes.reject_all(&error);
        self.resolvers.reject_all(&error);

        let writers: Vec<Rc<WriteStream>> = {
            let mut map = self.write_streams.borrow_mut();
            map.drain().map(|(_, s)| s).collect()
        };
        let readers: Vec<Rc<ReadStream>> = {
            let mut map = self.read_streams.borrow_mut();
            map.drain().map(|(_, s)| s).collect()
        };
        for writer in writers {
            writer.remote_close(close_code::BAD_CONNECTION);
        }
        for reader in readers {
            reader.remote_close(close_code::BAD_CONNECTION);
        }
    }

    /// The socket's send backpressure dropped below the threshold: replay
    /// the waiting stream writers in FIFO order while it stays low.
    pub fn emit_send_backpressure_drain(&self) {
        while self.socket.has_low_send_backpressure() {
            let waker = self.backpressure_waiters.borrow_mut().pop_front();
            match waker {
                Some(waker) => waker.wake(),
                None => break,
            }
        }
    }

    // =====================================================================
    // Inbound dispatch
    // =====================================================================

    /// Feed one inbound frame. Every processing error is routed to
    /// `on_invalid_message`; this never panics the event loop.
    pub fn emit_message(&self, message: IncomingMessage) {
        let result = match message {
            IncomingMessage::Text(text) => self.process_text(&text),
            IncomingMessage::Binary(data) => self.process_binary(data),
        };
        if let Err(err) = result {
            self.handler.on_invalid_message(err);
        }
    }

    fn process_text(&self, raw: &str) -> TransportResult<()> {
        let parsed: serde_json::Value = serde_json::from_str(&format!("[{raw}]"))?;
        let parts = parsed
            .as_array()
            .ok_or_else(|| TransportError::invalid_message("text frame is not a tuple"))?;
        if packet_type_at(parts, 0)? == PacketType::Bundle {
            let actions = parts
                .get(1)
                .and_then(|v| v.as_array())
                .ok_or_else(|| TransportError::invalid_message("bundle without action list"))?;
            for action in actions {
                let action_parts = action.as_array().ok_or_else(|| {
                    TransportError::invalid_message("bundle action is not a tuple")
                })?;
                self.process_action(action_parts)?;
            }
            Ok(())
        } else {
            self.process_action(parts)
        }
    }

    fn process_action(&self, parts: &[serde_json::Value]) -> TransportResult<()> {
        match packet_type_at(parts, 0)? {
            PacketType::Transmit => {
                let receiver = string_at(parts, 1)?;
                let data_type = data_type_at(parts, 2)?;
                self.decode_then(data_type, parts.get(3), parts.get(4), move |t, result| {
                    match result {
                        Ok(value) => t.dispatch_listener(t.handler.on_transmit(&receiver, value)),
                        Err(err) => t.handler.on_invalid_message(err),
                    }
                })
            }
            PacketType::Invoke => {
                let procedure = string_at(parts, 1)?;
                let call_id = id_at(parts, 2)?;
                let data_type = data_type_at(parts, 3)?;
                let stamp = self.stamp.get();
                self.decode_then(data_type, parts.get(4), parts.get(5), move |t, result| {
                    match result {
                        Ok(value) => {
                            let responder =
                                InvokeResponder::new(t.weak(), call_id, stamp);
                            t.dispatch_listener(t.handler.on_invoke(&procedure, value, responder));
                        }
                        Err(err) => t.handler.on_invalid_message(err),
                    }
                })
            }
            PacketType::InvokeDataResp => {
                let call_id = id_at(parts, 1)?;
                let data_type = data_type_at(parts, 2)?;
                self.decode_then(data_type, parts.get(3), parts.get(4), move |t, result| {
                    match result {
                        Ok(data) => {
                            if !t.invokes.complete(call_id, Ok(InvokeReturn { data, data_type })) {
                                tracing::debug!(call_id, "response for unknown call id");
                            }
                        }
                        Err(err) => {
                            if !t.invokes.complete(call_id, Err(err.clone())) {
                                t.handler.on_invalid_message(err);
                            }
                        }
                    }
                })
            }
            PacketType::InvokeErrResp => {
                let call_id = id_at(parts, 1)?;
                let remote = hydrate_remote_error(parts.get(2));
                if !self
                    .invokes
                    .complete(call_id, Err(TransportError::Remote(remote)))
                {
                    tracing::debug!(call_id, "error response for unknown call id");
                }
                Ok(())
            }
            PacketType::StreamAccept => {
                let id = id_at(parts, 1)?;
                let credit = credit_at(parts, 2)?;
                if let Some(stream) = self.write_streams.borrow().get(&id).cloned() {
                    stream.accept(credit);
                } else {
                    tracing::debug!(stream_id = id, "accept for unknown stream");
                }
                Ok(())
            }
            PacketType::StreamDataPermission => {
                let id = id_at(parts, 1)?;
                let credit = credit_at(parts, 2)?;
                if let Some(stream) = self.write_streams.borrow().get(&id).cloned() {
                    stream.add_credit(credit);
                } else {
                    tracing::debug!(stream_id = id, "permission for unknown stream");
                }
                Ok(())
            }
            PacketType::StreamChunk => self.process_text_chunk(parts, false),
            PacketType::StreamEnd => self.process_text_chunk(parts, true),
            PacketType::WriteStreamClose => {
                let id = id_at(parts, 1)?;
                let code = code_at(parts, 2)?.unwrap_or(close_code::END);
                let stream = self.read_streams.borrow_mut().remove(&id);
                match stream {
                    Some(stream) => stream.remote_close(code),
                    None => tracing::debug!(stream_id = id, "close for unknown read stream"),
                }
                Ok(())
            }
            PacketType::ReadStreamClose => {
                let id = id_at(parts, 1)?;
                let code = code_at(parts, 2)?.unwrap_or(close_code::END);
                let stream = self.write_streams.borrow_mut().remove(&id);
                match stream {
                    Some(stream) => stream.remote_close(code),
                    None => tracing::debug!(stream_id = id, "close for unknown write stream"),
                }
                Ok(())
            }
            PacketType::Bundle => Err(TransportError::invalid_message("nested bundle")),
            PacketType::BinaryContent => Err(TransportError::invalid_message(
                "binary content packet in a text frame",
            )),
        }
    }

    fn process_text_chunk(&self, parts: &[serde_json::Value], end: bool) -> TransportResult<()> {
        let id = id_at(parts, 1)?;
        let reader = self.read_streams.borrow().get(&id).cloned();
        let Some(reader) = reader else {
            tracing::debug!(stream_id = id, "chunk for unknown stream");
            return Ok(());
        };

        // Bare end packet: no final chunk.
        if end && parts.len() <= 2 {
            reader.push_end();
            self.read_streams.borrow_mut().remove(&id);
            return Ok(());
        }

        let data_type = data_type_at(parts, 2)?;
        if data_type.contains_streams() && !self.options.chunks_can_contain_streams {
            return Err(TransportError::invalid_message(
                "stream chunk carries embedded streams",
            ));
        }

        let allow_streams = self.options.chunks_can_contain_streams;
        let env = TransportDecodeEnv {
            transport: self,
            allow_streams,
        };
        // Final chunks ride the end packet outside the credit window.
        let counted = !end;
        match codec::decode_payload(data_type, parts.get(3), parts.get(4), &env)? {
            Decoded::Value(value) => {
                reader.push_chunk(value, counted);
                if end {
                    reader.push_end();
                }
            }
            Decoded::AwaitBinaries { content_id, pending } => {
                let Some(slot) = reader.begin_chunk(counted) else {
                    return Ok(());
                };
                if end {
                    reader.push_end();
                }
                let weak = self.weak();
                let stamp = self.stamp.get();
                let chunk_reader = reader.clone();
                self.register_resolver(
                    content_id,
                    Box::new(move |blobs| {
                        let Some(transport) = weak.upgrade() else {
                            return;
                        };
                        if transport.stamp.get() != stamp {
                            return;
                        }
                        let result = blobs.and_then(|blobs| {
                            let env = TransportDecodeEnv {
                                transport: &*transport,
                                allow_streams,
                            };
                            codec::finish_with_binaries(pending, blobs, &env)
                        });
                        if let Err(err) = &result
                            && !err.is_bad_connection()
                        {
                            transport.handler.on_invalid_message(err.clone());
                        }
                        chunk_reader.complete_chunk(&slot, result);
                    }),
                )?;
            }
        }
        if end {
            self.read_streams.borrow_mut().remove(&id);
        }
        Ok(())
    }

    fn process_binary(&self, data: Bytes) -> TransportResult<()> {
        match wire::parse_binary_frame(data)? {
            BinaryFrame::Ping => {
                self.dispatch_listener(self.handler.on_ping());
                Ok(())
            }
            BinaryFrame::Pong => {
                self.dispatch_listener(self.handler.on_pong());
                Ok(())
            }
            BinaryFrame::BinaryContent {
                id,
                blobs,
                continued,
            } => {
                match self.resolvers.deliver(id, blobs, continued) {
                    DeliverOutcome::Completed => {}
                    // Chained frame: keep waiting, fresh deadline.
                    DeliverOutcome::Continued => self.arm_resolver_timer(id),
                    DeliverOutcome::Unknown => {
                        tracing::debug!(id, "binary content for unknown resolver");
                    }
                }
                Ok(())
            }
            BinaryFrame::StreamChunk { stream_id, payload } => {
                if let Some(reader) = self.read_streams.borrow().get(&stream_id).cloned() {
                    reader.push_chunk(Value::Blob(payload), true);
                } else {
                    tracing::debug!(stream_id, "binary chunk for unknown stream");
                }
                Ok(())
            }
            BinaryFrame::StreamEnd { stream_id, payload } => {
                let reader = self.read_streams.borrow_mut().remove(&stream_id);
                match reader {
                    Some(reader) => {
                        if !payload.is_empty() {
                            reader.push_chunk(Value::Blob(payload), false);
                        }
                        reader.push_end();
                    }
                    None => tracing::debug!(stream_id, "binary end for unknown stream"),
                }
                Ok(())
            }
        }
    }

    // =====================================================================
    // Internals shared with the stream / invoke modules
    // =====================================================================

    pub(crate) fn report_listener_error(&self, error: Box<dyn std::error::Error>) {
        self.handler.on_listener_error(error);
    }

    fn dispatch_listener(&self, result: ListenerResult) {
        if let Err(err) = result {
            self.report_listener_error(err);
        }
    }

    pub(crate) async fn wait_low_send_backpressure(&self) {
        std::future::poll_fn(|cx| {
            if self.socket.has_low_send_backpressure() {
                Poll::Ready(())
            } else {
                self.backpressure_waiters
                    .borrow_mut()
                    .push_back(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }

    pub(crate) fn send_stream_accept(&self, id: i64, credit: u64) -> TransportResult<()> {
        self.send_control(&[
            json!(PacketType::StreamAccept as u8),
            json!(id),
            json!(credit),
        ])
    }

    pub(crate) fn send_stream_permission(&self, id: i64, delta: u64) -> TransportResult<()> {
        self.send_control(&[
            json!(PacketType::StreamDataPermission as u8),
            json!(id),
            json!(delta),
        ])
    }

    pub(crate) fn send_write_stream_close(&self, id: i64, code: u32) -> TransportResult<()> {
        self.send_control(&[
            json!(PacketType::WriteStreamClose as u8),
            json!(id),
            json!(code),
        ])
    }

    pub(crate) fn send_read_stream_close(&self, id: i64, code: u32) -> TransportResult<()> {
        self.send_control(&[
            json!(PacketType::ReadStreamClose as u8),
            json!(id),
            json!(code),
        ])
    }

    /// Send an object stream chunk or end packet, encoding the payload
    /// like any other package slot.
    pub(crate) fn send_object_stream_chunk(
        &self,
        id: i64,
        value: Option<&Value>,
        end: bool,
    ) -> TransportResult<()> {
        let packet = if end {
            PacketType::StreamEnd
        } else {
            PacketType::StreamChunk
        };
        let Some(value) = value else {
            return self.send_control(&[json!(packet as u8), json!(id)]);
        };
        let payload = self.encode(value, true)?;
        if !payload.streams.is_empty() && !self.options.chunks_can_contain_streams {
            return Err(TransportError::invalid_action(
                "stream chunks may not contain streams",
            ));
        }
        self.send_payload_packet(vec![json!(packet as u8), json!(id)], payload)
    }

    /// Send a binary stream chunk or end frame.
    pub(crate) fn send_binary_stream_chunk(
        &self,
        id: i64,
        payload: &[u8],
        end: bool,
    ) -> TransportResult<()> {
        if !self.open.get() {
            return Err(self.not_open_error());
        }
        let packet = if end {
            PacketType::StreamEnd
        } else {
            PacketType::StreamChunk
        };
        let frame = wire::encode_stream_frame(packet, id, payload);
        self.socket
            .send_binary(&frame)
            .map_err(|e| self.socket_error(e))
    }

    pub(crate) fn send_invoke_data_resp(
        &self,
        call_id: i64,
        value: &Value,
    ) -> TransportResult<()> {
        let payload = self.encode(value, true)?;
        self.send_payload_packet(
            vec![json!(PacketType::InvokeDataResp as u8), json!(call_id)],
            payload,
        )
    }

    pub(crate) fn send_invoke_err_resp(
        &self,
        call_id: i64,
        error: &RemoteError,
    ) -> TransportResult<()> {
        let raw = serde_json::to_value(error)
            .map_err(|e| TransportError::invalid_action(e.to_string()))?;
        self.send_control(&[json!(PacketType::InvokeErrResp as u8), json!(call_id), raw])
    }

    pub(crate) fn unregister_write_stream(&self, id: i64) {
        self.write_streams.borrow_mut().remove(&id);
    }

    pub(crate) fn unregister_read_stream(&self, id: i64) {
        self.read_streams.borrow_mut().remove(&id);
    }

    // =====================================================================
    // Private helpers
    // =====================================================================

    fn encode(&self, value: &Value, process_complex_types: bool) -> TransportResult<EncodedPayload> {
        let env = TransportEncodeEnv { transport: self };
        codec::encode_value(value, &env, process_complex_types)
    }

    fn payload_frame(payload: &EncodedPayload) -> TransportResult<Option<Vec<u8>>> {
        payload
            .binaries
            .as_ref()
            .map(|(id, blobs)| wire::encode_binary_content_frame(*id, blobs))
            .transpose()
    }

    /// Send a packet whose payload was just encoded: text head plus a
    /// corked binary-content frame, then activate embedded streams.
    fn send_payload_packet(
        &self,
        mut leading: Vec<serde_json::Value>,
        payload: EncodedPayload,
    ) -> TransportResult<()> {
        if !self.open.get() {
            return Err(self.not_open_error());
        }
        leading.push(json!(payload.data_type as u8));
        leading.push(payload.data.clone());
        if let Some(meta) = &payload.meta {
            leading.push(meta.clone());
        }
        let head = wire::head_from_parts(&leading);
        match Self::payload_frame(&payload)? {
            Some(frame) => self.send_corked(&head, &frame)?,
            None => self
                .socket
                .send_text(&head)
                .map_err(|e| self.socket_error(e))?,
        }
        self.activate_streams(&payload.streams);
        Ok(())
    }

    fn send_package_now(&self, package: &Package) -> TransportResult<()> {
        if !self.open.get() {
            return Err(self.not_open_error());
        }
        match package.binary_frame() {
            Some(frame) => self.send_corked(package.head(), frame)?,
            None => self
                .socket
                .send_text(package.head())
                .map_err(|e| self.socket_error(e))?,
        }
        package.fire_after_send();
        Ok(())
    }

    fn send_corked(&self, head: &str, frame: &[u8]) -> TransportResult<()> {
        let socket = &self.socket;
        let mut result = Ok(());
        socket.cork(&mut || {
            if result.is_ok() {
                result = socket.send_text(head);
            }
            if result.is_ok() {
                result = socket.send_binary(frame);
            }
        });
        result.map_err(|e| self.socket_error(e))
    }

    fn send_bundle(&self, packages: &[Package]) {
        let heads: Vec<String> = packages
            .iter()
            .map(|p| format!("[{}]", p.head()))
            .collect();
        let bundle_head = format!("{},[{}]", PacketType::Bundle as u8, heads.join(","));
        let socket = &self.socket;
        let mut result = Ok(());
        socket.cork(&mut || {
            if result.is_ok() {
                result = socket.send_text(&bundle_head);
            }
            for package in packages {
                if result.is_ok()
                    && let Some(frame) = package.binary_frame()
                {
                    result = socket.send_binary(frame);
                }
            }
        });
        match result {
            Ok(()) => {
                for package in packages {
                    package.fire_after_send();
                }
            }
            Err(err) => tracing::warn!(error = %err, "bundle send failed"),
        }
    }

    fn send_control(&self, parts: &[serde_json::Value]) -> TransportResult<()> {
        if !self.open.get() {
            return Err(self.not_open_error());
        }
        self.socket
            .send_text(&wire::head_from_parts(parts))
            .map_err(|e| self.socket_error(e))
    }

    fn not_open_error(&self) -> TransportError {
        TransportError::bad_connection(BadConnectionKind::ConnectionLost, "transport not open")
    }

    fn socket_error(&self, err: std::io::Error) -> TransportError {
        TransportError::bad_connection(BadConnectionKind::ConnectionLost, err.to_string())
    }

    fn activate_streams(&self, streams: &[Rc<WriteStream>]) {
        for stream in streams {
            stream.activate();
            if let Some(id) = stream.id() {
                self.write_streams.borrow_mut().insert(id, stream.clone());
            }
        }
    }

    fn activate_streams_hook(&self, streams: Vec<Rc<WriteStream>>) -> Option<AfterSend> {
        if streams.is_empty() {
            return None;
        }
        let weak = self.weak();
        Some(Box::new(move || {
            if let Some(transport) = weak.upgrade() {
                transport.activate_streams(&streams);
            }
        }))
    }

    /// Decode a payload slot and hand the result to `f`: synchronously if
    /// it is complete, or from the binary-content resolver otherwise.
    fn decode_then<F>(
        &self,
        data_type: DataType,
        data: Option<&serde_json::Value>,
        meta: Option<&serde_json::Value>,
        f: F,
    ) -> TransportResult<()>
    where
        F: FnOnce(&Transport, TransportResult<Value>) + 'static,
    {
        let env = TransportDecodeEnv {
            transport: self,
            allow_streams: true,
        };
        match codec::decode_payload(data_type, data, meta, &env)? {
            Decoded::Value(value) => {
                f(self, Ok(value));
                Ok(())
            }
            Decoded::AwaitBinaries { content_id, pending } => {
                let weak = self.weak();
                let stamp = self.stamp.get();
                self.register_resolver(
                    content_id,
                    Box::new(move |blobs| {
                        let Some(transport) = weak.upgrade() else {
                            return;
                        };
                        if transport.stamp.get() != stamp {
                            return;
                        }
                        let result = blobs.and_then(|blobs| {
                            let env = TransportDecodeEnv {
                                transport: &*transport,
                                allow_streams: true,
                            };
                            codec::finish_with_binaries(pending, blobs, &env)
                        });
                        f(&*transport, result);
                    }),
                )
            }
        }
    }

    fn register_resolver(
        &self,
        content_id: i64,
        callback: ResolverCallback,
    ) -> TransportResult<()> {
        self.resolvers.register(content_id, callback)?;
        self.arm_resolver_timer(content_id);
        Ok(())
    }

    fn arm_resolver_timer(&self, content_id: i64) {
        let weak = self.weak();
        let timeout = self.options.binary_content_packet_timeout;
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(timeout).await;
            if let Some(transport) = weak.upgrade() {
                transport.resolvers.expire(content_id);
            }
        });
        self.resolvers.set_timer(content_id, handle);
    }

    fn arm_invoke_timer(&self, call_id: i64, timeout: Duration) {
        let weak = self.weak();
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(timeout).await;
            if let Some(transport) = weak.upgrade() {
                transport.invokes.complete(
                    call_id,
                    Err(TransportError::Timeout {
                        kind: crate::error::TimeoutKind::InvokeResponse,
                    }),
                );
            }
        });
        self.invokes.set_timer(call_id, handle);
    }

    /// Lazy arming: the response timer starts only once every stream
    /// embedded in the invoke payload has closed.
    fn arm_invoke_timer_after_streams(
        &self,
        call_id: i64,
        streams: Vec<Rc<WriteStream>>,
        timeout: Duration,
    ) {
        let weak = self.weak();
        let stamp = self.stamp.get();
        tokio::task::spawn_local(async move {
            for stream in &streams {
                stream.closed().await;
            }
            if let Some(transport) = weak.upgrade()
                && transport.stamp.get() == stamp
                && transport.invokes.is_pending(call_id)
            {
                transport.arm_invoke_timer(call_id, timeout);
            }
        });
    }

    fn arm_batch_timer(&self, delay: Duration) {
        let weak = self.weak();
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            if let Some(transport) = weak.upgrade() {
                transport.flush_buffer();
            }
        });
        self.buffer.set_batch_timer(handle);
    }

    fn alloc_binary_content_id(&self) -> i64 {
        let id = self.next_binary_content_id.get();
        self.next_binary_content_id
            .set(if id >= MAX_SAFE_INTEGER { 0 } else { id + 1 });
        id
    }

    fn alloc_object_stream_id(&self) -> i64 {
        let map = self.write_streams.borrow();
        let mut id = self.next_object_stream_id.get();
        while map.contains_key(&id) {
            id = if id >= MAX_SAFE_INTEGER { 1 } else { id + 1 };
        }
        drop(map);
        self.next_object_stream_id
            .set(if id >= MAX_SAFE_INTEGER { 1 } else { id + 1 });
        id
    }

    fn alloc_binary_stream_id(&self) -> i64 {
        let map = self.write_streams.borrow();
        let mut id = self.next_binary_stream_id.get();
        while map.contains_key(&id) {
            id = if id <= -MAX_SAFE_INTEGER { -1 } else { id - 1 };
        }
        drop(map);
        self.next_binary_stream_id
            .set(if id <= -MAX_SAFE_INTEGER { -1 } else { id - 1 });
        id
    }
}

struct TransportEncodeEnv<'a> {
    transport: &'a Transport,
}

impl EncodeEnv for TransportEncodeEnv<'_> {
    fn streams_enabled(&self) -> bool {
        self.transport.options.streams_enabled
    }

    fn next_binary_content_id(&self) -> i64 {
        self.transport.alloc_binary_content_id()
    }

    fn bind_write_stream(&self, stream: &Rc<WriteStream>) -> TransportResult<i64> {
        let id = if stream.is_binary() {
            self.transport.alloc_binary_stream_id()
        } else {
            self.transport.alloc_object_stream_id()
        };
        stream.bind(id, self.transport.weak())?;
        Ok(id)
    }
}

struct TransportDecodeEnv<'a> {
    transport: &'a Transport,
    /// Cleared for stream chunk payloads unless chunks may carry streams.
    allow_streams: bool,
}

impl DecodeEnv for TransportDecodeEnv<'_> {
    fn streams_enabled(&self) -> bool {
        self.transport.options.streams_enabled
    }

    fn streams_per_package_limit(&self) -> usize {
        self.transport.options.streams_per_package_limit
    }

    fn materialize_read_stream(&self, id: i64) -> TransportResult<Rc<ReadStream>> {
        if !self.transport.options.streams_enabled {
            return Err(TransportError::invalid_message(
                "stream reference received but streams are disabled",
            ));
        }
        if !self.allow_streams {
            return Err(TransportError::invalid_message(
                "stream embedded in a stream chunk",
            ));
        }
        if id == 0 || id.unsigned_abs() > MAX_SAFE_INTEGER as u64 {
            return Err(TransportError::invalid_message(format!(
                "stream id {id} out of range"
            )));
        }
        let stream = ReadStream::new(id, self.transport.weak());
        if self
            .transport
            .read_streams
            .borrow_mut()
            .insert(id, stream.clone())
            .is_some()
        {
            tracing::debug!(stream_id = id, "replacing stale read stream entry");
        }
        Ok(stream)
    }
}

fn packet_type_at(parts: &[serde_json::Value], index: usize) -> TransportResult<PacketType> {
    parts
        .get(index)
        .and_then(|v| v.as_u64())
        .and_then(|t| u8::try_from(t).ok())
        .and_then(PacketType::from_u8)
        .ok_or_else(|| TransportError::invalid_message("missing or unknown packet type"))
}

fn data_type_at(parts: &[serde_json::Value], index: usize) -> TransportResult<DataType> {
    parts
        .get(index)
        .and_then(|v| v.as_u64())
        .and_then(|t| u8::try_from(t).ok())
        .and_then(DataType::from_u8)
        .ok_or_else(|| TransportError::invalid_message("missing or unknown data type"))
}

fn string_at(parts: &[serde_json::Value], index: usize) -> TransportResult<String> {
    parts
        .get(index)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| TransportError::invalid_message("expected a string slot"))
}

fn id_at(parts: &[serde_json::Value], index: usize) -> TransportResult<i64> {
    wire::id_from_json(
        parts
            .get(index)
            .ok_or_else(|| TransportError::invalid_message("missing id slot"))?,
    )
}

fn credit_at(parts: &[serde_json::Value], index: usize) -> TransportResult<u64> {
    parts
        .get(index)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| TransportError::invalid_message("expected a credit amount"))
}

fn code_at(parts: &[serde_json::Value], index: usize) -> TransportResult<Option<u32>> {
    match parts.get(index) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|c| u32::try_from(c).ok())
            .map(Some)
            .ok_or_else(|| TransportError::invalid_message("malformed close code")),
    }
}

fn hydrate_remote_error(raw: Option<&serde_json::Value>) -> RemoteError {
    match raw {
        Some(serde_json::Value::String(message)) => RemoteError::new("Error", message.clone()),
        Some(value) => serde_json::from_value::<RemoteError>(value.clone())
            .unwrap_or_else(|_| RemoteError::new("Error", value.to_string())),
        None => RemoteError::new("Error", "unknown remote error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hydrate_remote_error_forms() {
        let err = hydrate_remote_error(Some(&json!({"name": "RangeError", "message": "nope"})));
        assert_eq!(err.name, "RangeError");
        assert_eq!(err.message, "nope");

        let err = hydrate_remote_error(Some(&json!("plain text")));
        assert_eq!(err.name, "Error");
        assert_eq!(err.message, "plain text");

        let err = hydrate_remote_error(None);
        assert_eq!(err.name, "Error");
    }

    #[test]
    fn test_slot_parsers() {
        let parts = vec![json!(1), json!("recv"), json!(0), json!(null)];
        assert_eq!(packet_type_at(&parts, 0).expect("tag"), PacketType::Transmit);
        assert_eq!(string_at(&parts, 1).expect("str"), "recv");
        assert_eq!(data_type_at(&parts, 2).expect("dt"), DataType::Json);
        assert!(packet_type_at(&parts, 3).is_err());
        assert_eq!(code_at(&parts, 3).expect("code"), None);
        assert_eq!(code_at(&parts, 9).expect("code"), None);
    }
}
