//! SQLite storage for the Vigil control plane.
//!
//! Provides persistence for the camera catalog, camera leases, worker
//! records and issued intents. Every lease mutation is a single conditional
//! `UPDATE`; there is no read-then-write path.

mod db;
mod models;
mod queries_cameras;
mod queries_intents;
mod queries_leases;
mod queries_workers;


pub use db::{ControlDatabase, DatabaseError};
pub use models::*;
pub use queries_leases::CandidateScan;
pub use queries_workers::WorkerUpsert;
