//! Protocol module - wire format, field reader and message encoder.
//!
//! This module implements the binary protocol spoken by traced processes:
//! - Little endian primitives, FILETIME timestamps and `LPSTR` strings
//! - [`FrameReader`] for decoding fields from a stream that may suspend
//! - [`MessageEncoder`] for producing messages on the client side

mod encoder;
mod frame_reader;
mod wire_format;

pub use encoder::{encode_message, ClientMessage, MessageEncoder};
pub use frame_reader::FrameReader;
pub use wire_format::{
    filetime_to_utc, utc_to_filetime, MessageKind, DEFAULT_MAX_STRING_LEN, NULL_STRING_LEN,
    TERMINATOR,
};
