//! Encoding and decoding of payload values.
//!
//! Encoding walks a [`Value`] tree and produces a JSON tree in which every
//! blob is replaced by a `{_b: index}` placeholder and every embedded write
//! stream by `{_s: streamId}`. Collected blobs ride an out-of-band
//! binary-content frame; collected streams are activated after the package
//! is sent. Decoding reverses the substitution, materializing read streams
//! and (possibly asynchronously) resolving blob placeholders against the
//! referenced binary-content frame.
//!
//! User object keys beginning with `_` would collide with the placeholder
//! markers, so a mixed-JSON walk escapes every such key with one extra
//! leading `_` and the decode walk strips it again. Plain-JSON payloads
//! carry no placeholders and are never escaped.

use std::collections::BTreeMap;
use std::rc::Rc;

use bytes::Bytes;
use chrono::SecondsFormat;
use serde_json::json;

use crate::error::{TransportError, TransportResult};
use crate::stream::{ReadStream, WriteStream};
use crate::value::{StreamValue, Value};
use crate::wire::DataType;

/// Placeholder key for a blob index within the referenced binary-content
/// packet.
const BINARY_PLACEHOLDER_KEY: &str = "_b";

/// Placeholder key for an embedded stream id.
const STREAM_PLACEHOLDER_KEY: &str = "_s";

/// JSON projection of a write stream when streams are disabled.
const INLINED_WRITE_STREAM: &str = "[WriteStream]";

/// JSON projection of a read stream when streams are disabled.
const INLINED_READ_STREAM: &str = "[ReadStream]";

/// Id allocation and policy hooks the encoder needs from the transport.
pub(crate) trait EncodeEnv {
    /// Whether live streams may be embedded.
    fn streams_enabled(&self) -> bool;

    /// Allocate a fresh binary-content packet id.
    fn next_binary_content_id(&self) -> i64;

    /// Bind a write stream to this transport, allocating its stream id.
    ///
    /// # Errors
    ///
    /// Fails if the stream is already bound, or if the environment cannot
    /// host streams (multi-transmit preparation).
    fn bind_write_stream(&self, stream: &Rc<WriteStream>) -> TransportResult<i64>;
}

/// Stream materialization hooks the decoder needs from the transport.
pub(crate) trait DecodeEnv {
    /// Whether inbound stream references are acceptable.
    fn streams_enabled(&self) -> bool;

    /// Cap on streams materialized out of one package.
    fn streams_per_package_limit(&self) -> usize;

    /// Create (and register) the read side of stream `id`.
    fn materialize_read_stream(&self, id: i64) -> TransportResult<Rc<ReadStream>>;
}

/// An encoded payload: the head slots plus companion data.
pub(crate) struct EncodedPayload {
    pub data_type: DataType,
    /// JSON for the `data` slot.
    pub data: serde_json::Value,
    /// JSON for the `meta` slot (the binary-content id, when blobs are
    /// embedded in a mixed tree).
    pub meta: Option<serde_json::Value>,
    /// Companion binary-content frame content: `(id, blobs)`.
    pub binaries: Option<(i64, Vec<Bytes>)>,
    /// Write streams embedded in the payload, to be activated after send.
    pub streams: Vec<Rc<WriteStream>>,
}

/// Encode a payload value for a packet slot.
///
/// With `process_complex_types = false` the value must be pure JSON;
/// blobs and streams fail the encode.
pub(crate) fn encode_value(
    value: &Value,
    env: &dyn EncodeEnv,
    process_complex_types: bool,
) -> TransportResult<EncodedPayload> {
    if !process_complex_types {
        if contains_complex(value, true) {
            return Err(TransportError::invalid_action(
                "payload contains blobs or streams but complex types are disabled for this send",
            ));
        }
        return Ok(EncodedPayload {
            data_type: DataType::Json,
            data: plain_json(value)?,
            meta: None,
            binaries: None,
            streams: Vec::new(),
        });
    }

    if !contains_complex(value, env.streams_enabled()) {
        return Ok(EncodedPayload {
            data_type: DataType::Json,
            data: plain_json(value)?,
            meta: None,
            binaries: None,
            streams: Vec::new(),
        });
    }

    // Whole payload is a single blob: no JSON tree, just the content id.
    if let Value::Blob(blob) = value {
        if blob.len() > crate::wire::MAX_SUPPORTED_BLOB_SIZE {
            return Err(TransportError::MaxSupportedBlobSizeExceeded { size: blob.len() });
        }
        let id = env.next_binary_content_id();
        return Ok(EncodedPayload {
            data_type: DataType::Binary,
            data: json!(id),
            meta: None,
            binaries: Some((id, vec![blob.clone()])),
            streams: Vec::new(),
        });
    }

    // Whole payload is a single stream: the data slot carries its id.
    if let Value::Stream(StreamValue::Write(stream)) = value {
        let id = env.bind_write_stream(stream)?;
        return Ok(EncodedPayload {
            data_type: DataType::Stream,
            data: json!(id),
            meta: None,
            binaries: None,
            streams: vec![stream.clone()],
        });
    }

    let mut binaries = Vec::new();
    let mut streams = Vec::new();
    let tree = walk_encode(value, env, &mut binaries, &mut streams)?;

    let data_type = match (!binaries.is_empty(), !streams.is_empty()) {
        (true, true) => DataType::JsonWithStreamsAndBinaries,
        (true, false) => DataType::JsonWithBinaries,
        (false, true) => DataType::JsonWithStreams,
        // The scan saw a complex leaf but the walk collected nothing; the
        // only way here is an encode bug.
        (false, false) => {
            return Err(TransportError::invalid_action(
                "complex scan and encode walk disagree",
            ));
        }
    };

    let (meta, binaries) = if binaries.is_empty() {
        (None, None)
    } else {
        let id = env.next_binary_content_id();
        (Some(json!(id)), Some((id, binaries)))
    };

    Ok(EncodedPayload {
        data_type,
        data: tree,
        meta,
        binaries,
        streams,
    })
}

/// Whether the tree holds anything that cannot ride plain JSON.
fn contains_complex(value: &Value, streams_count: bool) -> bool {
    match value {
        Value::Blob(_) => true,
        Value::Stream(_) => streams_count,
        Value::Arr(items) => items.iter().any(|v| contains_complex(v, streams_count)),
        Value::Obj(map) => map.values().any(|v| contains_complex(v, streams_count)),
        _ => false,
    }
}

/// Serialize a value known to be placeholder-free. Keys are not escaped.
fn plain_json(value: &Value) -> TransportResult<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Num(n) => serde_json::Value::Number(n.clone()),
        Value::Str(s) => json!(s),
        Value::Date(d) => json!(d.to_rfc3339_opts(SecondsFormat::Millis, true)),
        Value::Blob(_) => {
            return Err(TransportError::invalid_action(
                "blob in a plain JSON payload",
            ));
        }
        Value::Stream(StreamValue::Write(_)) => json!(INLINED_WRITE_STREAM),
        Value::Stream(StreamValue::Read(_)) => json!(INLINED_READ_STREAM),
        Value::Arr(items) => serde_json::Value::Array(
            items.iter().map(plain_json).collect::<TransportResult<_>>()?,
        ),
        Value::Obj(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), plain_json(item)?);
            }
            serde_json::Value::Object(out)
        }
    })
}

fn walk_encode(
    value: &Value,
    env: &dyn EncodeEnv,
    binaries: &mut Vec<Bytes>,
    streams: &mut Vec<Rc<WriteStream>>,
) -> TransportResult<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Num(n) => serde_json::Value::Number(n.clone()),
        Value::Str(s) => json!(s),
        Value::Date(d) => json!(d.to_rfc3339_opts(SecondsFormat::Millis, true)),
        Value::Blob(blob) => {
            if blob.len() > crate::wire::MAX_SUPPORTED_BLOB_SIZE {
                return Err(TransportError::MaxSupportedBlobSizeExceeded { size: blob.len() });
            }
            let index = binaries.len();
            binaries.push(blob.clone());
            json!({ BINARY_PLACEHOLDER_KEY: index })
        }
        Value::Stream(StreamValue::Write(stream)) => {
            if !env.streams_enabled() {
                json!(INLINED_WRITE_STREAM)
            } else {
                let id = env.bind_write_stream(stream)?;
                streams.push(stream.clone());
                json!({ STREAM_PLACEHOLDER_KEY: id })
            }
        }
        Value::Stream(StreamValue::Read(_)) => {
            return Err(TransportError::invalid_action(
                "read streams cannot be embedded in outbound payloads",
            ));
        }
        Value::Arr(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|v| walk_encode(v, env, binaries, streams))
                .collect::<TransportResult<_>>()?,
        ),
        Value::Obj(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(
                    escape_key(key),
                    walk_encode(item, env, binaries, streams)?,
                );
            }
            serde_json::Value::Object(out)
        }
    })
}

fn escape_key(key: &str) -> String {
    if key.starts_with('_') {
        format!("_{key}")
    } else {
        key.to_string()
    }
}

fn unescape_key(key: &str) -> &str {
    key.strip_prefix('_')
        .filter(|rest| rest.starts_with('_'))
        .unwrap_or(key)
}

/// Continuation of a decode that still awaits its binary-content frame.
pub(crate) enum PendingDecode {
    /// `DataType::Binary`: the payload is the first blob of the frame.
    SingleBlob,
    /// A mixed tree with `{_b}` placeholders to substitute.
    Mixed { tree: serde_json::Value },
}

/// Outcome of the synchronous decode phase.
pub(crate) enum Decoded {
    /// The payload is complete.
    Value(Value),
    /// Blobs are still in flight; finish with [`finish_with_binaries`]
    /// once the binary-content frame under `content_id` resolves.
    AwaitBinaries {
        content_id: i64,
        pending: PendingDecode,
    },
}

/// Decode the `data`/`meta` slots of an action packet.
///
/// # Errors
///
/// Fails on malformed slots, disabled or over-limit streams, and unknown
/// data types.
pub(crate) fn decode_payload(
    data_type: DataType,
    data: Option<&serde_json::Value>,
    meta: Option<&serde_json::Value>,
    env: &dyn DecodeEnv,
) -> TransportResult<Decoded> {
    match data_type {
        DataType::Json => {
            let tree = data.cloned().unwrap_or(serde_json::Value::Null);
            Ok(Decoded::Value(json_to_value(&tree)))
        }
        DataType::Binary => {
            let content_id = crate::wire::id_from_json(
                data.ok_or_else(|| TransportError::invalid_message("missing binary content id"))?,
            )?;
            Ok(Decoded::AwaitBinaries {
                content_id,
                pending: PendingDecode::SingleBlob,
            })
        }
        DataType::Stream => {
            let id = crate::wire::id_from_json(
                data.ok_or_else(|| TransportError::invalid_message("missing stream id"))?,
            )?;
            let stream = env.materialize_read_stream(id)?;
            Ok(Decoded::Value(Value::Stream(StreamValue::Read(stream))))
        }
        DataType::JsonWithBinaries
        | DataType::JsonWithStreams
        | DataType::JsonWithStreamsAndBinaries => {
            let tree = data
                .cloned()
                .ok_or_else(|| TransportError::invalid_message("missing mixed JSON tree"))?;
            if data_type.contains_binaries() {
                let content_id = crate::wire::id_from_json(meta.ok_or_else(|| {
                    TransportError::invalid_message("missing binary content id in meta")
                })?)?;
                Ok(Decoded::AwaitBinaries {
                    content_id,
                    pending: PendingDecode::Mixed { tree },
                })
            } else {
                Ok(Decoded::Value(finish_with_binaries(
                    PendingDecode::Mixed { tree },
                    Vec::new(),
                    env,
                )?))
            }
        }
    }
}

/// Finish a decode once the referenced blobs are available.
pub(crate) fn finish_with_binaries(
    pending: PendingDecode,
    blobs: Vec<Bytes>,
    env: &dyn DecodeEnv,
) -> TransportResult<Value> {
    match pending {
        PendingDecode::SingleBlob => blobs
            .into_iter()
            .next()
            .map(Value::Blob)
            .ok_or_else(|| TransportError::invalid_message("empty binary content frame")),
        PendingDecode::Mixed { tree } => {
            let mut streams_created = 0usize;
            walk_decode(&tree, &blobs, env, &mut streams_created)
        }
    }
}

fn json_to_value(tree: &serde_json::Value) -> Value {
    match tree {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Num(n.clone()),
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => Value::Arr(items.iter().map(json_to_value).collect()),
        serde_json::Value::Object(map) => Value::Obj(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        ),
    }
}

fn walk_decode(
    tree: &serde_json::Value,
    blobs: &[Bytes],
    env: &dyn DecodeEnv,
    streams_created: &mut usize,
) -> TransportResult<Value> {
    Ok(match tree {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Num(n.clone()),
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => Value::Arr(
            items
                .iter()
                .map(|v| walk_decode(v, blobs, env, streams_created))
                .collect::<TransportResult<_>>()?,
        ),
        serde_json::Value::Object(map) => {
            // Placeholder detection needs both the marker key and a
            // numeric value; anything else is an ordinary object.
            if let Some(index_value) = map.get(BINARY_PLACEHOLDER_KEY)
                && index_value.is_number()
            {
                let index = index_value.as_u64().ok_or_else(|| {
                    TransportError::invalid_message("negative blob placeholder index")
                })?;
                let blob = blobs.get(index as usize).ok_or_else(|| {
                    TransportError::invalid_message(format!(
                        "blob placeholder index {index} out of range ({} blobs)",
                        blobs.len()
                    ))
                })?;
                return Ok(Value::Blob(blob.clone()));
            }
            if let Some(id_value) = map.get(STREAM_PLACEHOLDER_KEY)
                && id_value.is_number()
            {
                let id = crate::wire::id_from_json(id_value)?;
                *streams_created += 1;
                if *streams_created > env.streams_per_package_limit() {
                    return Err(TransportError::invalid_message(format!(
                        "package exceeds stream limit of {}",
                        env.streams_per_package_limit()
                    )));
                }
                let stream = env.materialize_read_stream(id)?;
                return Ok(Value::Stream(StreamValue::Read(stream)));
            }
            let mut out = BTreeMap::new();
            for (key, item) in map {
                out.insert(
                    unescape_key(key).to_string(),
                    walk_decode(item, blobs, env, streams_created)?,
                );
            }
            Value::Obj(out)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Encode env that allocates ids but cannot host streams.
    struct NoStreamsEnv {
        next_content_id: Cell<i64>,
    }

    impl NoStreamsEnv {
        fn new() -> Self {
            Self {
                next_content_id: Cell::new(0),
            }
        }
    }

    impl EncodeEnv for NoStreamsEnv {
        fn streams_enabled(&self) -> bool {
            false
        }

        fn next_binary_content_id(&self) -> i64 {
            let id = self.next_content_id.get();
            self.next_content_id.set(id + 1);
            id
        }

        fn bind_write_stream(&self, _stream: &Rc<WriteStream>) -> TransportResult<i64> {
            Err(TransportError::invalid_action("streams disabled"))
        }
    }

    /// Decode env without stream support.
    struct NoStreamsDecodeEnv;

    impl DecodeEnv for NoStreamsDecodeEnv {
        fn streams_enabled(&self) -> bool {
            false
        }

        fn streams_per_package_limit(&self) -> usize {
            20
        }

        fn materialize_read_stream(&self, _id: i64) -> TransportResult<Rc<ReadStream>> {
            Err(TransportError::invalid_message("streams disabled"))
        }
    }

    fn decode_ready(payload: &EncodedPayload) -> Value {
        let decoded = decode_payload(
            payload.data_type,
            Some(&payload.data),
            payload.meta.as_ref(),
            &NoStreamsDecodeEnv,
        )
        .expect("decode");
        match decoded {
            Decoded::Value(v) => v,
            Decoded::AwaitBinaries {
                pending, ..
            } => {
                let blobs = payload
                    .binaries
                    .as_ref()
                    .map(|(_, b)| b.clone())
                    .unwrap_or_default();
                finish_with_binaries(pending, blobs, &NoStreamsDecodeEnv).expect("finish")
            }
        }
    }

    #[test]
    fn test_plain_json_roundtrip() {
        let value = Value::obj([
            ("label", Value::from("x")),
            ("count", Value::from(3i64)),
            ("ratio", Value::from(0.5)),
            ("none", Value::Null),
            ("flags", Value::arr([Value::from(true), Value::from(false)])),
        ]);

        let env = NoStreamsEnv::new();
        let payload = encode_value(&value, &env, true).expect("encode");
        assert_eq!(payload.data_type, DataType::Json);
        assert!(payload.binaries.is_none());
        assert!(payload.streams.is_empty());

        assert_eq!(decode_ready(&payload), value);
    }

    #[test]
    fn test_single_blob_payload() {
        let value = Value::from(Bytes::from_static(b"\x01\x02\x03"));
        let env = NoStreamsEnv::new();
        let payload = encode_value(&value, &env, true).expect("encode");

        assert_eq!(payload.data_type, DataType::Binary);
        let (id, blobs) = payload.binaries.as_ref().expect("binaries");
        assert_eq!(*id, 0);
        assert_eq!(blobs.len(), 1);
        assert_eq!(payload.data, json!(0));

        assert_eq!(decode_ready(&payload), value);
    }

    #[test]
    fn test_mixed_payload_with_blob() {
        let value = Value::obj([
            ("file", Value::from(Bytes::from_static(b"0123456789abcdef"))),
            ("meta", Value::obj([("label", Value::from("x"))])),
        ]);
        let env = NoStreamsEnv::new();
        let payload = encode_value(&value, &env, true).expect("encode");

        assert_eq!(payload.data_type, DataType::JsonWithBinaries);
        assert_eq!(payload.meta, Some(json!(0)));
        assert_eq!(payload.data["file"], json!({ "_b": 0 }));

        assert_eq!(decode_ready(&payload), value);
    }

    #[test]
    fn test_adversarial_keys_roundtrip() {
        // Keys that collide with the placeholder markers must survive.
        let value = Value::obj([
            ("_b", Value::from(1i64)),
            ("_s", Value::from("sneaky")),
            ("__b", Value::from(2i64)),
            ("_other", Value::Null),
            ("plain", Value::from(3i64)),
        ]);
        // Force the mixed path with a blob sibling.
        let value = Value::obj([
            ("keys", value),
            ("blob", Value::from(Bytes::from_static(b"z"))),
        ]);

        let env = NoStreamsEnv::new();
        let payload = encode_value(&value, &env, true).expect("encode");
        assert_eq!(payload.data_type, DataType::JsonWithBinaries);

        // On the wire the user's `_b` key is escaped.
        assert!(payload.data["keys"].get("__b").is_some());
        assert!(payload.data["keys"].get("___b").is_some());

        assert_eq!(decode_ready(&payload), value);
    }

    #[test]
    fn test_placeholder_requires_numeric_value() {
        // `{_b: "x"}` is an ordinary object, not a placeholder.
        let tree = json!({ "_b": "x" });
        let decoded = finish_with_binaries(
            PendingDecode::Mixed { tree },
            vec![],
            &NoStreamsDecodeEnv,
        )
        .expect("decode");
        assert_eq!(
            decoded,
            Value::obj([("_b", Value::from("x"))]),
        );
    }

    #[test]
    fn test_blob_placeholder_out_of_range() {
        let tree = json!({ "_b": 2 });
        let result = finish_with_binaries(
            PendingDecode::Mixed { tree },
            vec![Bytes::from_static(b"only one")],
            &NoStreamsDecodeEnv,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_date_encodes_as_rfc3339() {
        use chrono::TimeZone;
        let date = chrono::Utc
            .with_ymd_and_hms(2024, 5, 17, 8, 30, 0)
            .single()
            .expect("valid date");
        let env = NoStreamsEnv::new();
        let payload = encode_value(&Value::Date(date), &env, true).expect("encode");
        assert_eq!(payload.data, json!("2024-05-17T08:30:00.000Z"));
    }

    #[test]
    fn test_complex_types_disabled_rejects_blob() {
        let value = Value::obj([("b", Value::from(Bytes::from_static(b"x")))]);
        let env = NoStreamsEnv::new();
        let result = encode_value(&value, &env, false);
        assert!(matches!(
            result,
            Err(TransportError::InvalidAction { .. })
        ));
    }

    #[test]
    fn test_oversize_blob_rejected() {
        // Construct a Bytes that *claims* a huge length without allocating:
        // not possible safely, so exercise the check through the constant.
        assert_eq!(
            crate::wire::MAX_SUPPORTED_BLOB_SIZE,
            (u32::MAX - 1) as usize
        );
    }

    #[test]
    fn test_decode_missing_slots_rejected() {
        assert!(decode_payload(DataType::Binary, None, None, &NoStreamsDecodeEnv).is_err());
        assert!(decode_payload(DataType::Stream, None, None, &NoStreamsDecodeEnv).is_err());
        assert!(
            decode_payload(DataType::JsonWithBinaries, Some(&json!({})), None, &NoStreamsDecodeEnv)
                .is_err()
        );
    }

    #[test]
    fn test_stream_decode_disabled() {
        let tree = json!({ "_s": 1 });
        let result = finish_with_binaries(
            PendingDecode::Mixed { tree },
            vec![],
            &NoStreamsDecodeEnv,
        );
        assert!(result.is_err());
    }
}
