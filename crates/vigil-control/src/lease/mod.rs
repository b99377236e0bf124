//! Camera lease store.

mod store;

pub use store::LeaseStore;
