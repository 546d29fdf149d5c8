//! Wire format: packet tags, control bytes, and binary frame layouts.
//!
//! Text frames are comma-joined JSON tuples (a frame is parsed by wrapping
//! it in `[` ... `]`). Binary frames carry a one-byte discriminator:
//!
//! ```text
//! binary content:   [5][id: f64 BE][(len: u32 BE)(blob bytes)]...[sentinel?]
//! stream chunk/end: [7|8][stream id: f64 LE][payload bytes]
//! ping/pong:        [57] / [65]   (single byte)
//! ```
//!
//! A blob length equal to [`NEXT_BINARIES_PACKET_TOKEN`] is the chaining
//! sentinel: no payload follows it and a later binary-content frame with
//! the same id continues the blob list.

use bytes::Bytes;

use crate::error::{TransportError, TransportResult};

/// Ping control byte (single-byte binary frame).
pub const PING_UINT8: u8 = 57;

/// Pong control byte (single-byte binary frame).
pub const PONG_UINT8: u8 = 65;

/// Blob-length sentinel marking a chained binary-content frame.
pub const NEXT_BINARIES_PACKET_TOKEN: u32 = u32::MAX;

/// Maximum size of a single blob. The length prefix is a u32 and the
/// sentinel value is reserved for chaining.
pub const MAX_SUPPORTED_BLOB_SIZE: usize = (u32::MAX - 1) as usize;

/// Largest integer the wire can carry exactly (ids travel as f64).
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Numeric packet tags (stable wire constants).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Carries a list of action packets for batched flushes.
    Bundle = 0,
    /// Fire-and-forget transmit.
    Transmit = 1,
    /// Invocation expecting exactly one response.
    Invoke = 2,
    /// Successful invoke response.
    InvokeDataResp = 3,
    /// Error invoke response.
    InvokeErrResp = 4,
    /// Out-of-band frame carrying blobs referenced by id.
    BinaryContent = 5,
    /// Reader is ready; carries the initial credit.
    StreamAccept = 6,
    /// Stream chunk (text or binary form).
    StreamChunk = 7,
    /// Stream end, optionally with a final chunk (text or binary form).
    StreamEnd = 8,
    /// Reader grants additional credit.
    StreamDataPermission = 9,
    /// Writer aborts the stream.
    WriteStreamClose = 10,
    /// Reader aborts the stream.
    ReadStreamClose = 11,
}

impl PacketType {
    /// Parse a wire tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => PacketType::Bundle,
            1 => PacketType::Transmit,
            2 => PacketType::Invoke,
            3 => PacketType::InvokeDataResp,
            4 => PacketType::InvokeErrResp,
            5 => PacketType::BinaryContent,
            6 => PacketType::StreamAccept,
            7 => PacketType::StreamChunk,
            8 => PacketType::StreamEnd,
            9 => PacketType::StreamDataPermission,
            10 => PacketType::WriteStreamClose,
            11 => PacketType::ReadStreamClose,
            _ => return None,
        })
    }
}

/// How the `data` slot of an action packet is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    /// Plain JSON tree.
    Json = 0,
    /// `data` is a binary-content packet id; the payload is a single blob.
    Binary = 1,
    /// `data` is a stream id; the payload is a live stream.
    Stream = 2,
    /// JSON tree containing `{_b}` placeholders; `meta` holds the
    /// binary-content packet id.
    JsonWithBinaries = 3,
    /// JSON tree containing `{_s}` placeholders.
    JsonWithStreams = 4,
    /// JSON tree containing both placeholder kinds.
    JsonWithStreamsAndBinaries = 5,
}

impl DataType {
    /// Parse a wire tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => DataType::Json,
            1 => DataType::Binary,
            2 => DataType::Stream,
            3 => DataType::JsonWithBinaries,
            4 => DataType::JsonWithStreams,
            5 => DataType::JsonWithStreamsAndBinaries,
            _ => return None,
        })
    }

    /// Whether this data type references a binary-content packet.
    pub fn contains_binaries(self) -> bool {
        matches!(
            self,
            DataType::Binary | DataType::JsonWithBinaries | DataType::JsonWithStreamsAndBinaries
        )
    }

    /// Whether this data type references live streams.
    pub fn contains_streams(self) -> bool {
        matches!(
            self,
            DataType::Stream | DataType::JsonWithStreams | DataType::JsonWithStreamsAndBinaries
        )
    }

    /// Whether the `data` slot is a mixed JSON tree with placeholders.
    pub fn is_mixed_json(self) -> bool {
        matches!(
            self,
            DataType::JsonWithBinaries
                | DataType::JsonWithStreams
                | DataType::JsonWithStreamsAndBinaries
        )
    }
}

/// A classified inbound binary frame.
#[derive(Debug)]
pub enum BinaryFrame {
    /// Single-byte ping.
    Ping,
    /// Single-byte pong.
    Pong,
    /// Out-of-band blobs for a binary-content id. `continued` is set when
    /// the frame ends with the chaining sentinel.
    BinaryContent {
        /// Referenced binary-content packet id.
        id: i64,
        /// Blobs carried by this frame, in order.
        blobs: Vec<Bytes>,
        /// Whether a chained frame with the same id follows.
        continued: bool,
    },
    /// Binary stream chunk.
    StreamChunk {
        /// Target stream id.
        stream_id: i64,
        /// Raw chunk bytes.
        payload: Bytes,
    },
    /// Binary stream end; an empty payload means no final chunk.
    StreamEnd {
        /// Target stream id.
        stream_id: i64,
        /// Final chunk bytes (may be empty).
        payload: Bytes,
    },
}

/// Classify and parse an inbound binary frame.
///
/// # Errors
///
/// Returns [`TransportError::InvalidMessage`] for unknown discriminators,
/// truncated headers, or malformed blob lists.
pub fn parse_binary_frame(data: Bytes) -> TransportResult<BinaryFrame> {
    if data.len() == 1 {
        return match data[0] {
            PING_UINT8 => Ok(BinaryFrame::Ping),
            PONG_UINT8 => Ok(BinaryFrame::Pong),
            other => Err(TransportError::invalid_message(format!(
                "unknown control byte: {other}"
            ))),
        };
    }
    if data.len() < 9 {
        return Err(TransportError::invalid_message(format!(
            "binary frame too short: {} bytes",
            data.len()
        )));
    }
    match PacketType::from_u8(data[0]) {
        Some(PacketType::BinaryContent) => {
            let id = id_from_f64_bits(f64::from_be_bytes(header_id_bytes(&data)))?;
            let (blobs, continued) = parse_blob_list(&data, 9)?;
            Ok(BinaryFrame::BinaryContent {
                id,
                blobs,
                continued,
            })
        }
        Some(PacketType::StreamChunk) => Ok(BinaryFrame::StreamChunk {
            stream_id: id_from_f64_bits(f64::from_le_bytes(header_id_bytes(&data)))?,
            payload: data.slice(9..),
        }),
        Some(PacketType::StreamEnd) => Ok(BinaryFrame::StreamEnd {
            stream_id: id_from_f64_bits(f64::from_le_bytes(header_id_bytes(&data)))?,
            payload: data.slice(9..),
        }),
        _ => Err(TransportError::invalid_message(format!(
            "unknown binary frame discriminator: {}",
            data[0]
        ))),
    }
}

fn header_id_bytes(data: &[u8]) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[1..9]);
    buf
}

fn parse_blob_list(data: &Bytes, mut offset: usize) -> TransportResult<(Vec<Bytes>, bool)> {
    let mut blobs = Vec::new();
    while offset < data.len() {
        if data.len() - offset < 4 {
            return Err(TransportError::invalid_message(
                "truncated blob length prefix",
            ));
        }
        let len = u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        offset += 4;
        if len == NEXT_BINARIES_PACKET_TOKEN {
            // Sentinel: nothing follows it in this frame.
            if offset != data.len() {
                return Err(TransportError::invalid_message(
                    "data after continuation sentinel",
                ));
            }
            return Ok((blobs, true));
        }
        let len = len as usize;
        if data.len() - offset < len {
            return Err(TransportError::invalid_message("truncated blob payload"));
        }
        blobs.push(data.slice(offset..offset + len));
        offset += len;
    }
    Ok((blobs, false))
}

/// Encode a binary-content frame carrying `blobs` under `id`.
///
/// The transport always emits unchained frames; chaining is only parsed.
///
/// # Errors
///
/// Returns [`TransportError::MaxSupportedBlobSizeExceeded`] if any blob is
/// larger than [`MAX_SUPPORTED_BLOB_SIZE`].
pub fn encode_binary_content_frame(id: i64, blobs: &[Bytes]) -> TransportResult<Vec<u8>> {
    let total: usize = blobs.iter().map(|b| b.len() + 4).sum();
    let mut frame = Vec::with_capacity(9 + total);
    frame.push(PacketType::BinaryContent as u8);
    frame.extend_from_slice(&(id as f64).to_be_bytes());
    for blob in blobs {
        if blob.len() > MAX_SUPPORTED_BLOB_SIZE {
            return Err(TransportError::MaxSupportedBlobSizeExceeded { size: blob.len() });
        }
        frame.extend_from_slice(&(blob.len() as u32).to_be_bytes());
        frame.extend_from_slice(blob);
    }
    Ok(frame)
}

/// Encode a binary stream chunk or end frame.
pub fn encode_stream_frame(packet: PacketType, stream_id: i64, payload: &[u8]) -> Vec<u8> {
    debug_assert!(matches!(
        packet,
        PacketType::StreamChunk | PacketType::StreamEnd
    ));
    let mut frame = Vec::with_capacity(9 + payload.len());
    frame.push(packet as u8);
    frame.extend_from_slice(&(stream_id as f64).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Build a text head from packet tuple parts: the serialized JSON array
/// with the outer brackets stripped (the wire form is a bare
/// comma-separated tuple).
pub fn head_from_parts(parts: &[serde_json::Value]) -> String {
    let json = serde_json::to_string(parts).unwrap_or_else(|_| "[]".to_string());
    json[1..json.len() - 1].to_string()
}

/// Parse a JSON tuple slot into a wire id.
///
/// # Errors
///
/// Returns [`TransportError::InvalidMessage`] for non-integral or
/// out-of-range values.
pub fn id_from_json(value: &serde_json::Value) -> TransportResult<i64> {
    if let Some(id) = value.as_i64()
        && id.unsigned_abs() <= MAX_SAFE_INTEGER as u64
    {
        return Ok(id);
    }
    if let Some(f) = value.as_f64() {
        return id_from_f64_bits(f);
    }
    Err(TransportError::invalid_message(format!(
        "expected a wire id, got {value}"
    )))
}

fn id_from_f64_bits(value: f64) -> TransportResult<i64> {
    if value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER as f64 {
        Ok(value as i64)
    } else {
        Err(TransportError::invalid_message(format!(
            "non-integral wire id: {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_bytes() {
        assert!(matches!(
            parse_binary_frame(Bytes::from_static(&[PING_UINT8])).expect("parse"),
            BinaryFrame::Ping
        ));
        assert!(matches!(
            parse_binary_frame(Bytes::from_static(&[PONG_UINT8])).expect("parse"),
            BinaryFrame::Pong
        ));
        assert!(parse_binary_frame(Bytes::from_static(&[0x00])).is_err());
    }

    #[test]
    fn test_binary_content_roundtrip() {
        let blobs = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"defgh")];
        let frame = encode_binary_content_frame(42, &blobs).expect("encode");

        match parse_binary_frame(Bytes::from(frame)).expect("parse") {
            BinaryFrame::BinaryContent {
                id,
                blobs: parsed,
                continued,
            } => {
                assert_eq!(id, 42);
                assert_eq!(parsed, blobs);
                assert!(!continued);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_binary_content_id_is_big_endian_f64() {
        let frame = encode_binary_content_frame(3, &[]).expect("encode");
        assert_eq!(frame[1..9], 3.0f64.to_be_bytes());
    }

    #[test]
    fn test_continuation_sentinel() {
        let mut frame = encode_binary_content_frame(7, &[Bytes::from_static(b"x")]).expect("encode");
        frame.extend_from_slice(&NEXT_BINARIES_PACKET_TOKEN.to_be_bytes());

        match parse_binary_frame(Bytes::from(frame)).expect("parse") {
            BinaryFrame::BinaryContent {
                blobs, continued, ..
            } => {
                assert_eq!(blobs.len(), 1);
                assert!(continued);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_data_after_sentinel_rejected() {
        let mut frame = encode_binary_content_frame(7, &[]).expect("encode");
        frame.extend_from_slice(&NEXT_BINARIES_PACKET_TOKEN.to_be_bytes());
        frame.push(0xAA);
        assert!(parse_binary_frame(Bytes::from(frame)).is_err());
    }

    #[test]
    fn test_stream_frame_roundtrip_negative_id() {
        let frame = encode_stream_frame(PacketType::StreamChunk, -5, b"payload");
        match parse_binary_frame(Bytes::from(frame)).expect("parse") {
            BinaryFrame::StreamChunk { stream_id, payload } => {
                assert_eq!(stream_id, -5);
                assert_eq!(payload.as_ref(), b"payload");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_stream_id_is_little_endian_f64() {
        let frame = encode_stream_frame(PacketType::StreamEnd, 9, b"");
        assert_eq!(frame[1..9], 9.0f64.to_le_bytes());
    }

    #[test]
    fn test_truncated_frames_rejected() {
        assert!(parse_binary_frame(Bytes::from_static(&[5, 0, 0])).is_err());

        // Blob length prefix claims more bytes than the frame has.
        let mut frame = Vec::new();
        frame.push(PacketType::BinaryContent as u8);
        frame.extend_from_slice(&1.0f64.to_be_bytes());
        frame.extend_from_slice(&100u32.to_be_bytes());
        frame.push(0x01);
        assert!(parse_binary_frame(Bytes::from(frame)).is_err());
    }

    #[test]
    fn test_head_from_parts() {
        let head = head_from_parts(&[
            serde_json::json!(1),
            serde_json::json!("receiver"),
            serde_json::json!(0),
            serde_json::json!({"a": 1}),
        ]);
        assert_eq!(head, r#"1,"receiver",0,{"a":1}"#);

        // The inverse: wrapping in brackets parses back to the tuple.
        let parsed: serde_json::Value =
            serde_json::from_str(&format!("[{head}]")).expect("parse wrapped head");
        assert_eq!(parsed.as_array().map(Vec::len), Some(4));
    }

    #[test]
    fn test_id_from_json() {
        assert_eq!(id_from_json(&serde_json::json!(12)).expect("id"), 12);
        assert_eq!(id_from_json(&serde_json::json!(-3.0)).expect("id"), -3);
        assert!(id_from_json(&serde_json::json!(1.5)).is_err());
        assert!(id_from_json(&serde_json::json!("7")).is_err());
    }

    #[test]
    fn test_packet_type_tags_are_stable() {
        for (tag, packet) in [
            (0, PacketType::Bundle),
            (1, PacketType::Transmit),
            (2, PacketType::Invoke),
            (3, PacketType::InvokeDataResp),
            (4, PacketType::InvokeErrResp),
            (5, PacketType::BinaryContent),
            (6, PacketType::StreamAccept),
            (7, PacketType::StreamChunk),
            (8, PacketType::StreamEnd),
            (9, PacketType::StreamDataPermission),
            (10, PacketType::WriteStreamClose),
            (11, PacketType::ReadStreamClose),
        ] {
            assert_eq!(PacketType::from_u8(tag), Some(packet));
            assert_eq!(packet as u8, tag);
        }
        assert_eq!(PacketType::from_u8(12), None);
    }

    #[test]
    fn test_data_type_predicates() {
        assert!(DataType::Binary.contains_binaries());
        assert!(DataType::JsonWithStreamsAndBinaries.contains_binaries());
        assert!(DataType::JsonWithStreamsAndBinaries.contains_streams());
        assert!(!DataType::Json.contains_binaries());
        assert!(!DataType::Json.contains_streams());
        assert!(DataType::JsonWithStreams.is_mixed_json());
        assert!(!DataType::Stream.is_mixed_json());
    }
}
