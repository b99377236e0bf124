//! Control channel protocol.
//!
//! Message types shared by the control plane and workers, and the
//! newline-delimited JSON framing that carries them over TCP.

pub mod codec;
pub mod transport;
pub mod types;

pub use codec::{decode_line, encode_line};
pub use transport::{MessageChannel, bridge};
pub use types::*;
