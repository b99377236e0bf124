//! Network surfaces of the control plane.

pub mod admin;
pub mod listener;
pub mod session;

#[cfg(test)]
mod admin_tests;
#[cfg(test)]
mod session_tests;
#[cfg(test)]
pub(crate) mod test_helpers;

pub use admin::{AdminError, AdminService, send_admin_request, serve_admin};
pub use listener::serve_workers;
pub use session::{SessionError, run_session};
