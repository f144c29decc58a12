//! Shared test utilities for treeline-core.
//!
//! Scripted backends, programmable constraint automata, and fixture
//! constructors used by unit and integration tests.

mod fixtures;
mod mock_automaton;
mod step_backend;

pub use fixtures::{make_req, shared_state};
pub use mock_automaton::MockAutomaton;
pub use step_backend::StepBackend;
