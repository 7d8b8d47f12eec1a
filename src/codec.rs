//! Newline-delimited JSON codec.
//!
//! Every message on the wire is one JSON text terminated by `\n`. The codec
//! is a marker struct with static methods rather than a trait object, so the
//! encoding is selected at compile time.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Codec for newline-delimited UTF-8 JSON messages.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value as one JSON line, including the trailing newline.
    pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(value)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Decode a value from a single line (without the newline).
    pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T> {
        Ok(serde_json::from_str(line)?)
    }
}
