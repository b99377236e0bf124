//! `Vigil` Edge Worker
//!
//! Holds the control channel to the control plane, runs the worker lifecycle
//! machine and drives one camera pipeline under a lease.

pub mod agent;
pub mod client;
pub mod fsm;
pub mod identity;
pub mod pipeline;
pub mod sink;
