//! Client-side message encoding.
//!
//! Produces byte-exact messages as an instrumented process writes them,
//! for tests, demos and tooling that replays a trace into a collector.
//!
//! # Example
//!
//! ```
//! use spawn_tracer::protocol::{ClientMessage, MessageEncoder};
//!
//! let mut encoder = MessageEncoder::new();
//! encoder
//!     .encode(&ClientMessage::Exit {
//!         timestamp: chrono::Utc::now(),
//!         exit_code: 3,
//!     })
//!     .unwrap();
//! let bytes = encoder.take();
//! assert_eq!(bytes.len(), 8 + 2 + 4 + 4);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use encoding_rs::UTF_16LE;

use super::wire_format::{utc_to_filetime, MessageKind, NULL_STRING_LEN, TERMINATOR};
use crate::codec::{encode_environment_block, text, TextEncoding};
use crate::error::Result;
use crate::Pid;

/// A message as sent by a traced process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// The process is exiting.
    Exit {
        timestamp: DateTime<Utc>,
        exit_code: i32,
    },
    /// A spawn attempt by this process failed.
    CreateFailure {
        timestamp: DateTime<Utc>,
        code_page: i32,
        exe_path: Option<String>,
        command_line: Option<String>,
    },
    /// The process announces itself after starting.
    Info {
        timestamp: DateTime<Utc>,
        parent_pid: Pid,
        exe_path: String,
        command_line: String,
        working_directory: String,
        environment: Vec<(String, String)>,
    },
}

impl ClientMessage {
    /// Wire kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            ClientMessage::Exit { .. } => MessageKind::Exit,
            ClientMessage::CreateFailure { .. } => MessageKind::CreateFailure,
            ClientMessage::Info { .. } => MessageKind::Info,
        }
    }
}

/// Accumulates encoded messages in a single buffer.
#[derive(Debug, Default)]
pub struct MessageEncoder {
    buf: BytesMut,
}

impl MessageEncoder {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one complete message, terminator included.
    ///
    /// # Errors
    ///
    /// Fails if a `CreateFailure` code page cannot be resolved.
    pub fn encode(&mut self, message: &ClientMessage) -> Result<&mut Self> {
        match message {
            ClientMessage::Exit {
                timestamp,
                exit_code,
            } => {
                self.put_header(*timestamp, MessageKind::Exit);
                self.buf.put_i32_le(*exit_code);
            }
            ClientMessage::CreateFailure {
                timestamp,
                code_page,
                exe_path,
                command_line,
            } => {
                let encoding = text::resolve_code_page(*code_page)?;
                self.put_header(*timestamp, MessageKind::CreateFailure);
                self.buf.put_i32_le(*code_page);
                self.put_string(encoding, exe_path.as_deref());
                self.put_string(encoding, command_line.as_deref());
            }
            ClientMessage::Info {
                timestamp,
                parent_pid,
                exe_path,
                command_line,
                working_directory,
                environment,
            } => {
                self.put_header(*timestamp, MessageKind::Info);
                self.buf.put_u32_le(*parent_pid);
                self.put_string(UTF_16LE, Some(exe_path));
                self.put_string(UTF_16LE, Some(command_line));
                self.put_string(UTF_16LE, Some(working_directory));
                let block = encode_environment_block(
                    environment
                        .iter()
                        .map(|(name, value)| (name.as_str(), value.as_str())),
                );
                self.put_string(UTF_16LE, Some(&block));
            }
        }
        self.buf.put_u32_le(TERMINATOR);
        Ok(self)
    }

    fn put_header(&mut self, timestamp: DateTime<Utc>, kind: MessageKind) {
        self.buf.put_u64_le(utc_to_filetime(timestamp));
        self.buf.put_u16_le(kind.tag());
    }

    fn put_string(&mut self, encoding: TextEncoding, value: Option<&str>) {
        match value {
            None => self.buf.put_u64_le(NULL_STRING_LEN),
            Some(value) => {
                let bytes = text::encode(encoding, value);
                self.buf.put_u64_le(bytes.len() as u64);
                self.buf.put_slice(&bytes);
            }
        }
    }

    /// Number of encoded bytes waiting.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if nothing is encoded.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the encoded bytes, leaving the encoder empty.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

/// Encode a single message into a fresh buffer.
pub fn encode_message(message: &ClientMessage) -> Result<Bytes> {
    let mut encoder = MessageEncoder::new();
    encoder.encode(message)?;
    Ok(encoder.take())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_exit_layout() {
        let bytes = encode_message(&ClientMessage::Exit {
            timestamp: ts(),
            exit_code: -1,
        })
        .unwrap();

        assert_eq!(bytes.len(), 18);
        assert_eq!(&bytes[0..8], &utc_to_filetime(ts()).to_le_bytes());
        assert_eq!(&bytes[8..10], &[0, 0]);
        assert_eq!(&bytes[10..14], &(-1i32).to_le_bytes());
        assert_eq!(&bytes[14..18], &TERMINATOR.to_le_bytes());
    }

    #[test]
    fn test_create_failure_null_strings() {
        let bytes = encode_message(&ClientMessage::CreateFailure {
            timestamp: ts(),
            code_page: 65001,
            exe_path: None,
            command_line: Some("ab".to_string()),
        })
        .unwrap();

        assert_eq!(&bytes[8..10], &[1, 0]);
        assert_eq!(&bytes[10..14], &65001i32.to_le_bytes());
        assert_eq!(&bytes[14..22], &u64::MAX.to_le_bytes());
        assert_eq!(&bytes[22..30], &2u64.to_le_bytes());
        assert_eq!(&bytes[30..32], b"ab");
        assert_eq!(bytes.len(), 36);
    }

    #[test]
    fn test_create_failure_unknown_code_page() {
        let result = encode_message(&ClientMessage::CreateFailure {
            timestamp: ts(),
            code_page: 12,
            exe_path: None,
            command_line: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_info_strings_are_utf16() {
        let bytes = encode_message(&ClientMessage::Info {
            timestamp: ts(),
            parent_pid: 4,
            exe_path: "a".to_string(),
            command_line: String::new(),
            working_directory: String::new(),
            environment: Vec::new(),
        })
        .unwrap();

        assert_eq!(&bytes[8..10], &[2, 0]);
        assert_eq!(&bytes[10..14], &4u32.to_le_bytes());
        assert_eq!(&bytes[14..22], &2u64.to_le_bytes());
        assert_eq!(&bytes[22..24], &[b'a', 0]);
    }

    #[test]
    fn test_multiple_messages_accumulate() {
        let mut encoder = MessageEncoder::new();
        for code in 0..3 {
            encoder
                .encode(&ClientMessage::Exit {
                    timestamp: ts(),
                    exit_code: code,
                })
                .unwrap();
        }
        assert_eq!(encoder.len(), 54);
        let bytes = encoder.take();
        assert_eq!(bytes.len(), 54);
        assert!(encoder.is_empty());
    }
}
