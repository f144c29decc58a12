//! Constrained decoding: automata over token vocabularies.
//!
//! An automaton is a stateless service over explicit state handles; the
//! request owning a constraint carries its current state and advances it
//! with each realized token. Per state the automaton answers two
//! questions: which tokens may be sampled next, and whether the grammar
//! deterministically forces a continuation that decoding can jump over
//! without sampling at all.

pub mod bitmask;
pub mod regex_dfa;
pub mod vocabulary;

pub use bitmask::PackedBitmask;
pub use regex_dfa::RegexDfaAutomaton;
pub use vocabulary::VocabularyIndex;

/// Opaque automaton state handle.
///
/// Handles are minted by one automaton instance and are only meaningful
/// when passed back to it.
pub type AutomatonState = u32;

/// A compiled decoding constraint.
pub trait DecodingAutomaton {
    /// State before any output token.
    fn start_state(&self) -> AutomatonState;

    /// Load the packed allowed-token row for `state` into `mask` at
    /// `row`. For a state the automaton does not know, the row is left
    /// untouched; callers hand in cleared rows.
    fn fill_allowed(&self, state: AutomatonState, mask: &mut PackedBitmask, row: usize);

    /// Transition on one realized token. `None` when the token is not
    /// accepted from `state`.
    fn next_state(&self, state: AutomatonState, token_id: u32) -> Option<AutomatonState>;

    /// The run of bytes forced from `state`: while exactly one byte keeps
    /// the match alive and the match may not yet end, that byte and its
    /// successor state are appended. Empty when nothing is forced.
    fn forced_byte_chain(&self, state: AutomatonState) -> Vec<(u8, AutomatonState)>;

    /// The forced continuation from `state` cut back to the last whole
    /// character, as text plus the state after it. Returns an empty
    /// string and `state` itself when no whole character is forced.
    fn forced_symbol_run(&self, state: AutomatonState) -> (String, AutomatonState);

    /// Whether the match may end at `state`.
    fn is_accepting(&self, state: AutomatonState) -> bool;
}
