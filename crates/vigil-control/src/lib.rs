//! `Vigil` Control Plane Library
//!
//! Owns the camera lease table and drives edge workers over per-worker
//! control channels:
//! - Lease store with compare-and-set acquisition and renewal
//! - Worker registry and connection routing
//! - Assignment service and reclaim scheduler
//! - Worker session handling and the administrative surface

pub mod assignment;
pub mod dispatch;
pub mod lease;
pub mod plane;
pub mod reclaim;
pub mod registry;
pub mod server;
pub mod storage;

pub use plane::ControlPlane;
