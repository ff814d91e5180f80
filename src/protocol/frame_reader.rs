//! Field-level reader over a connection stream.
//!
//! Uses `bytes::BytesMut` to accumulate partial reads; every read method
//! suspends until enough bytes are buffered or the stream ends. All reads
//! are cancel safe: bytes already received stay in the buffer.
//!
//! # Example
//!
//! ```ignore
//! use spawn_tracer::protocol::FrameReader;
//!
//! let mut reader = FrameReader::new(stream);
//! let timestamp = reader.read_timestamp().await?;
//! let kind = reader.read_u16().await?;
//! ```

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::wire_format::{filetime_to_utc, DEFAULT_MAX_STRING_LEN, NULL_STRING_LEN, TERMINATOR};
use crate::codec::{parse_environment_block, text, Environment, TextEncoding};
use crate::error::{Result, TracerError};

/// Initial read buffer capacity.
const READ_BUFFER_CAPACITY: usize = 4 * 1024;

/// Reader for the primitive wire types.
pub struct FrameReader<R> {
    /// Underlying stream.
    reader: R,
    /// Bytes received but not consumed yet.
    buffer: BytesMut,
    /// Maximum accepted string length in bytes.
    max_string_len: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a new reader with default limits.
    pub fn new(reader: R) -> Self {
        Self::with_max_string_len(reader, DEFAULT_MAX_STRING_LEN)
    }

    /// Create a new reader with a custom string length limit.
    pub fn with_max_string_len(reader: R, max_string_len: u64) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            max_string_len,
        }
    }

    /// Wait until at least `len` bytes are buffered.
    ///
    /// Returns [`TracerError::EndOfStream`] if the stream closes first.
    async fn fill(&mut self, len: usize) -> Result<()> {
        while self.buffer.len() < len {
            self.buffer.reserve(len - self.buffer.len());
            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(TracerError::EndOfStream);
            }
        }
        Ok(())
    }

    /// Read exactly `len` bytes.
    pub async fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        self.fill(len).await?;
        Ok(self.buffer.split_to(len).freeze())
    }

    async fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.fill(N).await?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buffer.split_to(N));
        Ok(out)
    }

    /// Read a little endian `u16`.
    pub async fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array().await?))
    }

    /// Read a little endian `u32`.
    pub async fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array().await?))
    }

    /// Read a little endian `i32`.
    pub async fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array().await?))
    }

    /// Read a little endian `u64`.
    pub async fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array().await?))
    }

    /// Read a FILETIME and convert it to UTC.
    pub async fn read_timestamp(&mut self) -> Result<DateTime<Utc>> {
        filetime_to_utc(self.read_u64().await?)
    }

    /// Read a length-prefixed byte buffer. `None` is the null string.
    pub async fn read_lpstr_bytes(&mut self) -> Result<Option<Bytes>> {
        let len = self.read_u64().await?;
        if len == NULL_STRING_LEN {
            return Ok(None);
        }
        if len > self.max_string_len {
            return Err(TracerError::Protocol(format!(
                "String length {} exceeds maximum {}",
                len, self.max_string_len
            )));
        }
        let len = usize::try_from(len)
            .map_err(|_| TracerError::Protocol(format!("String length {len} too large")))?;
        Ok(Some(self.read_bytes(len).await?))
    }

    /// Read a length-prefixed string decoded with `encoding`.
    ///
    /// Returns `None` for the null string, `Some("")` for an empty one.
    pub async fn read_string(&mut self, encoding: TextEncoding) -> Result<Option<String>> {
        Ok(self
            .read_lpstr_bytes()
            .await?
            .map(|bytes| text::decode(encoding, &bytes)))
    }

    /// Read a code page number and resolve it to an encoding.
    pub async fn read_encoding(&mut self) -> Result<TextEncoding> {
        text::resolve_code_page(self.read_i32().await?)
    }

    /// Read an environment block encoded with `encoding`.
    ///
    /// The whole block is decoded at once and split on NUL afterwards, so
    /// the encoding must map NUL code units to NUL characters. A null block
    /// is an empty environment.
    pub async fn read_environment_block(&mut self, encoding: TextEncoding) -> Result<Environment> {
        match self.read_string(encoding).await? {
            Some(block) => parse_environment_block(&block),
            None => Ok(Environment::new()),
        }
    }

    /// Read the message terminator and check it.
    pub async fn verify_terminator(&mut self) -> Result<()> {
        let found = self.read_u32().await?;
        if found != TERMINATOR {
            return Err(TracerError::ProtocolDesync { found });
        }
        Ok(())
    }

    /// Number of bytes received but not consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::UTF_16LE;

    fn lpstr(bytes: &[u8]) -> Vec<u8> {
        let mut out = (bytes.len() as u64).to_le_bytes().to_vec();
        out.extend_from_slice(bytes);
        out
    }

    #[tokio::test]
    async fn test_read_integers_little_endian() {
        let mut data = Vec::new();
        data.extend_from_slice(&0x0102u16.to_le_bytes());
        data.extend_from_slice(&(-2i32).to_le_bytes());
        data.extend_from_slice(&0x0102_0304_0506_0708u64.to_le_bytes());

        let mut reader = FrameReader::new(&data[..]);
        assert_eq!(reader.read_u16().await.unwrap(), 0x0102);
        assert_eq!(reader.read_i32().await.unwrap(), -2);
        assert_eq!(reader.read_u64().await.unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_end_of_stream_mid_value() {
        let data = [1u8, 2, 3];
        let mut reader = FrameReader::new(&data[..]);
        assert!(matches!(
            reader.read_u32().await,
            Err(TracerError::EndOfStream)
        ));
    }

    #[tokio::test]
    async fn test_null_and_empty_strings_differ() {
        let mut data = NULL_STRING_LEN.to_le_bytes().to_vec();
        data.extend(lpstr(b""));

        let mut reader = FrameReader::new(&data[..]);
        assert_eq!(reader.read_string(UTF_16LE).await.unwrap(), None);
        assert_eq!(
            reader.read_string(UTF_16LE).await.unwrap(),
            Some(String::new())
        );
    }

    #[tokio::test]
    async fn test_read_utf16_string() {
        let data = lpstr(&text::encode(UTF_16LE, "C:\\\u{e9}.exe"));
        let mut reader = FrameReader::new(&data[..]);
        assert_eq!(
            reader.read_string(UTF_16LE).await.unwrap().as_deref(),
            Some("C:\\\u{e9}.exe")
        );
    }

    #[tokio::test]
    async fn test_string_over_limit_rejected() {
        let data = lpstr(&[0u8; 32]);
        let mut reader = FrameReader::with_max_string_len(&data[..], 16);
        let err = reader.read_string(UTF_16LE).await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn test_read_encoding() {
        let data = 1200i32.to_le_bytes();
        let mut reader = FrameReader::new(&data[..]);
        assert_eq!(reader.read_encoding().await.unwrap(), UTF_16LE);

        let data = 4242i32.to_le_bytes();
        let mut reader = FrameReader::new(&data[..]);
        assert!(matches!(
            reader.read_encoding().await,
            Err(TracerError::UnknownEncoding(4242))
        ));
    }

    #[tokio::test]
    async fn test_read_environment_block() {
        let data = lpstr(&text::encode(UTF_16LE, "=C:=C:\\\0Path=C:\\bin\0A=1\0"));
        let mut reader = FrameReader::new(&data[..]);
        let env = reader.read_environment_block(UTF_16LE).await.unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env.get("PATH"), Some("C:\\bin"));
    }

    #[tokio::test]
    async fn test_null_environment_block_is_empty() {
        let data = NULL_STRING_LEN.to_le_bytes();
        let mut reader = FrameReader::new(&data[..]);
        assert!(reader
            .read_environment_block(UTF_16LE)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_terminator_check() {
        let mut data = TERMINATOR.to_le_bytes().to_vec();
        data.extend_from_slice(&0xCAFE_BABEu32.to_le_bytes());

        let mut reader = FrameReader::new(&data[..]);
        assert!(reader.verify_terminator().await.is_ok());
        assert!(matches!(
            reader.verify_terminator().await,
            Err(TracerError::ProtocolDesync { found: 0xCAFE_BABE })
        ));
    }

    #[tokio::test]
    async fn test_byte_at_a_time_stream() {
        let (mut tx, rx) = tokio::io::duplex(1);
        let data = lpstr(&text::encode(UTF_16LE, "fragmented"));
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for byte in data {
                tx.write_all(&[byte]).await.unwrap();
            }
        });

        let mut reader = FrameReader::new(rx);
        assert_eq!(
            reader.read_string(UTF_16LE).await.unwrap().as_deref(),
            Some("fragmented")
        );
    }
}
