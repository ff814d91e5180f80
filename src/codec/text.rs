//! Text encodings negotiated by Windows code page number.
//!
//! Clients report strings either as UTF-16LE (the wide Win32 APIs) or in
//! the ANSI code page of the calling process, which may differ per process.
//! The code page travels on the wire as an `int32`.

use std::borrow::Cow;

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};

use crate::error::{Result, TracerError};

/// A resolved text encoding.
pub type TextEncoding = &'static Encoding;

/// UTF-16 little endian, used for every string in `Info` messages.
pub const UTF16_LE_CODE_PAGE: i32 = 1200;

/// UTF-16 big endian.
pub const UTF16_BE_CODE_PAGE: i32 = 1201;

/// UTF-8.
pub const UTF8_CODE_PAGE: i32 = 65001;

/// Resolve a Windows code page number to a text encoding.
///
/// # Errors
///
/// Returns [`TracerError::UnknownEncoding`] if the code page has no mapping.
pub fn resolve_code_page(code_page: i32) -> Result<TextEncoding> {
    match code_page {
        UTF16_LE_CODE_PAGE => Ok(UTF_16LE),
        UTF16_BE_CODE_PAGE => Ok(UTF_16BE),
        UTF8_CODE_PAGE => Ok(UTF_8),
        _ => u16::try_from(code_page)
            .ok()
            .and_then(codepage::to_encoding)
            .ok_or(TracerError::UnknownEncoding(code_page)),
    }
}

/// Decode bytes with the given encoding.
///
/// Invalid sequences are replaced with U+FFFD rather than rejected. NUL
/// code units are preserved, environment blocks rely on that.
pub fn decode(encoding: TextEncoding, bytes: &[u8]) -> String {
    let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
    if had_errors {
        tracing::trace!("Lossy {} decode of {} bytes", encoding.name(), bytes.len());
    }
    text.into_owned()
}

/// Encode text with the given encoding.
///
/// `encoding_rs` only encodes to UTF-16 as UTF-8, so both UTF-16 variants
/// are handled here directly.
pub fn encode(encoding: TextEncoding, text: &str) -> Cow<'_, [u8]> {
    if encoding == UTF_16LE {
        Cow::Owned(text.encode_utf16().flat_map(u16::to_le_bytes).collect())
    } else if encoding == UTF_16BE {
        Cow::Owned(text.encode_utf16().flat_map(u16::to_be_bytes).collect())
    } else {
        let (bytes, _, _) = encoding.encode(text);
        bytes
    }
}
