//! Worker registry and in-memory connection routing.

pub mod connection;
pub mod workers;

pub use connection::{ConnectionRegistry, WorkerConnection};
pub use workers::{RegisterError, WorkerRegistry};
