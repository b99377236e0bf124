//! Intent dispatch to connected workers.

mod dispatcher;

pub use dispatcher::Dispatcher;
