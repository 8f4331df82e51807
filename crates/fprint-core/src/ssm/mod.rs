//! Sequential state machine runtime.

pub mod machine;
pub mod runner;

pub(crate) use machine::ssm_states;
pub use machine::{Phase, Ssm, SsmState, Step};
pub use runner::{DEFAULT_POLL, SsmHandler, SsmRunner};
