//! Codec module - text encodings and environment blocks.
//!
//! This module turns raw payload bytes into text:
//!
//! - [`text`] - Windows code page resolution and decoding via `encoding_rs`
//! - [`Environment`] - case-insensitive environment map and the NUL-delimited
//!   block format it travels in
//!
//! # Example
//!
//! ```
//! use spawn_tracer::codec::{parse_environment_block, text};
//!
//! let encoding = text::resolve_code_page(text::UTF16_LE_CODE_PAGE).unwrap();
//! let bytes = text::encode(encoding, "Path=C:\\bin\0");
//! let env = parse_environment_block(&text::decode(encoding, &bytes)).unwrap();
//! assert_eq!(env.get("PATH"), Some("C:\\bin"));
//! ```

mod environment;
pub mod text;

pub use environment::{encode_environment_block, parse_environment_block, Environment};
pub(crate) use environment::normalize_key;
pub use text::TextEncoding;
