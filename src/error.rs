//! Error types for spawn-tracer.

use thiserror::Error;

/// Main error type for all collector operations.
#[derive(Debug, Error)]
pub enum TracerError {
    /// I/O error during pipe/socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The client closed the stream. Normal end of a connection.
    #[error("End of stream")]
    EndOfStream,

    /// Code page number that does not map to a known text encoding.
    #[error("Unknown encoding passed by client: {0}")]
    UnknownEncoding(i32),

    /// Message terminator did not match, the stream is out of sync.
    #[error("Malformed message from the traced process, incorrect terminator {found:#010x}")]
    ProtocolDesync { found: u32 },

    /// Message kind tag not defined by the protocol.
    #[error("Received an unknown message kind from the client: {0}")]
    UnknownMessageKind(u16),

    /// Environment block that cannot be split into `KEY=VALUE` entries.
    #[error("Invalid environment block: {0}")]
    MalformedEnvironment(String),

    /// Any other protocol violation (missing field, oversized string, ...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// FILETIME value outside the representable range.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(u64),

    /// The aggregator task is gone.
    #[error("Event channel closed")]
    ChannelClosed,
}

impl TracerError {
    /// Whether the error invalidates the byte stream of the connection it came from.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            TracerError::UnknownEncoding(_)
                | TracerError::ProtocolDesync { .. }
                | TracerError::UnknownMessageKind(_)
                | TracerError::MalformedEnvironment(_)
                | TracerError::Protocol(_)
                | TracerError::InvalidTimestamp(_)
        )
    }
}

/// Result type alias using TracerError.
pub type Result<T> = std::result::Result<T, TracerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desync_message_shows_hex() {
        let err = TracerError::ProtocolDesync { found: 0xDEADBEEF };
        assert!(err.to_string().contains("0xdeadbeef"));
    }

    #[test]
    fn test_protocol_error_classification() {
        assert!(TracerError::UnknownMessageKind(7).is_protocol_error());
        assert!(TracerError::UnknownEncoding(-1).is_protocol_error());
        assert!(!TracerError::EndOfStream.is_protocol_error());
        assert!(!TracerError::ChannelClosed.is_protocol_error());
    }
}
