//! Worker lifecycle state machine.
//!
//! Pure: [`WorkerMachine::apply`] maps an input to the next state and the
//! effects the agent must carry out. It performs no I/O.

mod machine;
mod types;


pub use machine::WorkerMachine;
pub use types::{DrainTarget, Effect, Input, TransitionError, WorkerState};
