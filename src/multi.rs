//! Multi-transmit: prepare one package reusable across many peers.
//!
//! A multi-prepared package carries no transport-local state, so the same
//! head and binary-content frame can be broadcast to any number of
//! transports. Binary-content ids come from a process-wide negative
//! counter, keeping them disjoint from every transport's local positive id
//! space; live streams cannot ride such a package.

use std::rc::Rc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::json;

use crate::buffer::Package;
use crate::codec::{self, EncodeEnv};
use crate::error::{TransportError, TransportResult};
use crate::stream::WriteStream;
use crate::transport::Transport;
use crate::value::Value;
use crate::wire::{self, MAX_SAFE_INTEGER, PacketType};

static NEXT_MULTI_BINARY_CONTENT_ID: AtomicI64 = AtomicI64::new(-1);

fn next_multi_binary_content_id() -> i64 {
    let id = NEXT_MULTI_BINARY_CONTENT_ID.fetch_sub(1, Ordering::Relaxed);
    if id < -MAX_SAFE_INTEGER {
        // Wrapped past the safe-integer floor; restart the space. The
        // collision window is the instant between prepare and dispatch.
        NEXT_MULTI_BINARY_CONTENT_ID.store(-1, Ordering::Relaxed);
        return -1;
    }
    id
}

struct MultiEncodeEnv;

impl EncodeEnv for MultiEncodeEnv {
    fn streams_enabled(&self) -> bool {
        // Streams are treated as embeddable so that one showing up fails
        // the prepare loudly instead of being silently inlined.
        true
    }

    fn next_binary_content_id(&self) -> i64 {
        next_multi_binary_content_id()
    }

    fn bind_write_stream(&self, _stream: &Rc<WriteStream>) -> TransportResult<i64> {
        Err(TransportError::invalid_action(
            "live streams cannot ride a multi-transmit package",
        ))
    }
}

/// A transmit package prepared once and sendable to any number of peers.
#[derive(Debug, Clone)]
pub struct MultiPreparedPackage {
    head: String,
    binary_frame: Option<Vec<u8>>,
}

impl MultiPreparedPackage {
    /// The text head shared by every send of this package.
    pub fn head(&self) -> &str {
        &self.head
    }

    /// The companion binary-content frame, if blobs are embedded.
    pub fn binary_frame(&self) -> Option<&[u8]> {
        self.binary_frame.as_deref()
    }
}

/// Prepare a transmit package for broadcasting.
///
/// Blobs are permitted (they ride a shared negative-id binary-content
/// frame); live streams fail the prepare.
///
/// # Errors
///
/// Fails when the payload embeds a stream, or when
/// `process_complex_types` is `false` and the payload is not pure JSON.
pub fn prepare_multi_transmit(
    receiver: &str,
    data: &Value,
    process_complex_types: bool,
) -> TransportResult<MultiPreparedPackage> {
    let payload = codec::encode_value(data, &MultiEncodeEnv, process_complex_types)?;
    let mut parts = vec![
        json!(PacketType::Transmit as u8),
        json!(receiver),
        json!(payload.data_type as u8),
        payload.data.clone(),
    ];
    if let Some(meta) = &payload.meta {
        parts.push(meta.clone());
    }
    let binary_frame = payload
        .binaries
        .as_ref()
        .map(|(id, blobs)| wire::encode_binary_content_frame(*id, blobs))
        .transpose()?;
    Ok(MultiPreparedPackage {
        head: wire::head_from_parts(&parts),
        binary_frame,
    })
}

impl Transport {
    /// Send a multi-prepared package over this transport.
    ///
    /// # Errors
    ///
    /// Propagates socket errors for immediate sends.
    pub fn send_multi_package(
        &self,
        package: &MultiPreparedPackage,
        batch: Option<Duration>,
    ) -> TransportResult<()> {
        self.send_package(
            Package::new(
                package.head.clone(),
                package.binary_frame.clone(),
                None,
            ),
            batch,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::wire::DataType;

    #[test]
    fn test_multi_ids_are_negative_and_distinct() {
        let blob = Value::from(Bytes::from_static(b"payload"));
        let first = prepare_multi_transmit("all", &blob, true).expect("prepare");
        let second = prepare_multi_transmit("all", &blob, true).expect("prepare");

        // Head form: 1,"all",<Binary>,<id>
        let id_of = |package: &MultiPreparedPackage| -> i64 {
            let parsed: serde_json::Value =
                serde_json::from_str(&format!("[{}]", package.head())).expect("parse head");
            parsed[3].as_i64().expect("content id")
        };
        let (a, b) = (id_of(&first), id_of(&second));
        assert!(a < 0);
        assert!(b < 0);
        assert_ne!(a, b);
        assert!(first.binary_frame().is_some());
    }

    #[test]
    fn test_multi_plain_json_has_no_frame() {
        let package = prepare_multi_transmit("all", &Value::from("hello"), true).expect("prepare");
        assert!(package.binary_frame().is_none());
        let parsed: serde_json::Value =
            serde_json::from_str(&format!("[{}]", package.head())).expect("parse head");
        assert_eq!(parsed[2].as_u64(), Some(DataType::Json as u64));
    }

    #[test]
    fn test_multi_rejects_streams() {
        let payload = Value::obj([("s", Value::write_stream(WriteStream::object()))]);
        let result = prepare_multi_transmit("all", &payload, true);
        assert!(matches!(result, Err(TransportError::InvalidAction { .. })));
    }
}
