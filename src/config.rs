//! Configuration for transport behavior.

use std::time::Duration;

/// Default deadline for invoke responses.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for a referenced binary-content frame to arrive.
pub const DEFAULT_BINARY_CONTENT_PACKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Default cap on streams resolved out of a single inbound package.
pub const DEFAULT_STREAMS_PER_PACKAGE_LIMIT: usize = 20;

/// Default credit window a read stream opens with.
pub const DEFAULT_READ_STREAM_INITIAL_CREDIT: u64 = 16 * 1024;

/// Default cap on packages held in the batch/disconnect buffer.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1000;

/// Configuration for a [`Transport`](crate::Transport).
#[derive(Clone, Debug)]
pub struct TransportOptions {
    /// Deadline for the peer to answer an invocation.
    ///
    /// Can be overridden per call via
    /// [`InvokeOptions::response_timeout`](crate::transport::InvokeOptions).
    pub response_timeout: Duration,

    /// Deadline for a binary-content frame referenced by a text packet
    /// to arrive before the bearing action fails.
    pub binary_content_packet_timeout: Duration,

    /// Maximum number of streams a single inbound package may materialize.
    /// Exceeding it fails the decode of that package.
    pub streams_per_package_limit: usize,

    /// Whether streams are usable at all.
    ///
    /// When `false`, inbound stream references fail the decode and outbound
    /// stream values are inlined as their JSON description string.
    pub streams_enabled: bool,

    /// Whether stream chunks may themselves carry embedded streams.
    pub chunks_can_contain_streams: bool,

    /// Credit window granted by [`ReadStream::accept_default`]
    /// (bytes for binary streams, items for object streams).
    ///
    /// [`ReadStream::accept_default`]: crate::stream::ReadStream::accept_default
    pub read_stream_initial_credit: u64,

    /// Maximum number of packages held in the batch/disconnect buffer
    /// before it is force-flushed (while connected) or oldest entries are
    /// dropped (while disconnected).
    pub max_buffer_size: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            binary_content_packet_timeout: DEFAULT_BINARY_CONTENT_PACKET_TIMEOUT,
            streams_per_package_limit: DEFAULT_STREAMS_PER_PACKAGE_LIMIT,
            streams_enabled: true,
            chunks_can_contain_streams: false,
            read_stream_initial_credit: DEFAULT_READ_STREAM_INITIAL_CREDIT,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

impl TransportOptions {
    /// Set the invoke response deadline.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the binary-content arrival deadline.
    pub fn with_binary_content_packet_timeout(mut self, timeout: Duration) -> Self {
        self.binary_content_packet_timeout = timeout;
        self
    }

    /// Set the per-package stream materialization cap.
    pub fn with_streams_per_package_limit(mut self, limit: usize) -> Self {
        self.streams_per_package_limit = limit;
        self
    }

    /// Enable or disable streams entirely.
    pub fn with_streams_enabled(mut self, enabled: bool) -> Self {
        self.streams_enabled = enabled;
        self
    }

    /// Allow stream chunks to carry embedded streams.
    pub fn with_chunks_can_contain_streams(mut self, allowed: bool) -> Self {
        self.chunks_can_contain_streams = allowed;
        self
    }

    /// Set the default read-stream credit window.
    pub fn with_read_stream_initial_credit(mut self, credit: u64) -> Self {
        self.read_stream_initial_credit = credit;
        self
    }

    /// Set the package buffer capacity.
    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = TransportOptions::default();
        assert_eq!(options.response_timeout, Duration::from_secs(10));
        assert_eq!(
            options.binary_content_packet_timeout,
            Duration::from_secs(10)
        );
        assert_eq!(options.streams_per_package_limit, 20);
        assert!(options.streams_enabled);
        assert!(!options.chunks_can_contain_streams);
    }

    #[test]
    fn test_builder_setters() {
        let options = TransportOptions::default()
            .with_response_timeout(Duration::from_millis(250))
            .with_streams_enabled(false)
            .with_chunks_can_contain_streams(true)
            .with_streams_per_package_limit(3);

        assert_eq!(options.response_timeout, Duration::from_millis(250));
        assert!(!options.streams_enabled);
        assert!(options.chunks_can_contain_streams);
        assert_eq!(options.streams_per_package_limit, 3);
    }
}
