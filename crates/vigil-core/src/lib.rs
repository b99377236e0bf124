//! `Vigil` Core Library
//!
//! Shared functionality for `Vigil` components:
//! - Control channel protocol (messages, NDJSON framing)
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers and the injectable lease clock
//! - Common error types

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod protocol;
pub mod tracing_init;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
