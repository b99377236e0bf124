//! Periodic lease reclamation.

mod scheduler;

pub use scheduler::{ReclaimScheduler, SweepReport};
