//! Per-stream state machines.
//!
//! A [`WriteStream`] is created locally, embedded in an outbound payload,
//! and becomes sendable once the reader accepts it with an initial credit
//! window. A [`ReadStream`] is materialized by decoding an inbound payload
//! and feeds chunks to its consumer in arrival order, granting further
//! credit as the consumer drains them.
//!
//! Object streams count credit in items, binary streams in bytes. Stream
//! id signs distinguish the two on the wire: object ids are positive,
//! binary ids negative.

mod read;
mod write;

pub use read::ReadStream;
pub use write::WriteStream;

/// Well-known stream close codes. Any `u32` is a valid code on the wire;
/// these are the ones the transport itself emits.
pub mod close_code {
    /// Regular end of stream (the default close code).
    pub const END: u32 = 200;
    /// Local abort by the writer or reader.
    pub const ABORT: u32 = 201;
    /// The connection went bad underneath the stream.
    pub const BAD_CONNECTION: u32 = 202;
}
