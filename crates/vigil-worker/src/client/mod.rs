//! Control channel client.

mod config;
mod connection;
mod error;

pub use config::{ClientConfig, ReconnectPolicy};
pub use connection::ControlClient;
pub use error::ClientError;
