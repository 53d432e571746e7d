//! Turn-loop execution: wires the pure `state_machine` to real LLM
//! calls, tool dispatch, and persistence.

pub mod executor;

pub use executor::{cancel, run_turn_loop, submit_confirmation, ExecutorError};
