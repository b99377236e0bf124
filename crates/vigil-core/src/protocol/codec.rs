//! NDJSON framing: one JSON message per line.
//!
//! Tolerant reader: blank lines are skipped by the transport and a line that
//! fails to parse is reported as an error without poisoning the stream.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Serialize a message into a single newline-terminated line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line into a message.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(Error::Protocol("empty frame".into()));
    }
    serde_json::from_str(trimmed).map_err(|e| Error::Protocol(format!("bad frame: {e}")))
}
