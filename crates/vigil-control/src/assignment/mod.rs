//! Assignment of unowned cameras to eligible workers.

mod service;

pub use service::{AssignError, AssignmentService, SiteScope};
