use ahash::AHashMap;

use crate::grammar::{AutomatonState, DecodingAutomaton, PackedBitmask};

/// A table-driven constraint automaton.
///
/// Tests fill in exactly the transitions and forced runs a scenario
/// needs. A state without an `allowed` entry permits every token; a
/// transition without an entry keeps the current state while
/// `permissive` holds and rejects otherwise.
pub struct MockAutomaton {
    pub start: AutomatonState,
    pub allowed: AHashMap<AutomatonState, Vec<u32>>,
    pub transitions: AHashMap<(AutomatonState, u32), AutomatonState>,
    pub forced_chains: AHashMap<AutomatonState, Vec<(u8, AutomatonState)>>,
    pub forced_symbols: AHashMap<AutomatonState, (String, AutomatonState)>,
    pub accepting: Vec<AutomatonState>,
    pub permissive: bool,
}

impl Default for MockAutomaton {
    fn default() -> Self {
        Self {
            start: 0,
            allowed: AHashMap::new(),
            transitions: AHashMap::new(),
            forced_chains: AHashMap::new(),
            forced_symbols: AHashMap::new(),
            accepting: Vec::new(),
            permissive: true,
        }
    }
}

impl DecodingAutomaton for MockAutomaton {
    fn start_state(&self) -> AutomatonState {
        self.start
    }

    fn fill_allowed(&self, state: AutomatonState, mask: &mut PackedBitmask, row: usize) {
        match self.allowed.get(&state) {
            Some(tokens) => {
                for &token in tokens {
                    mask.allow(row, token as usize);
                }
            }
            None => {
                for token in 0..mask.vocab_size() {
                    mask.allow(row, token);
                }
            }
        }
    }

    fn next_state(&self, state: AutomatonState, token_id: u32) -> Option<AutomatonState> {
        self.transitions
            .get(&(state, token_id))
            .copied()
            .or(self.permissive.then_some(state))
    }

    fn forced_byte_chain(&self, state: AutomatonState) -> Vec<(u8, AutomatonState)> {
        self.forced_chains.get(&state).cloned().unwrap_or_default()
    }

    fn forced_symbol_run(&self, state: AutomatonState) -> (String, AutomatonState) {
        self.forced_symbols
            .get(&state)
            .cloned()
            .unwrap_or_else(|| (String::new(), state))
    }

    fn is_accepting(&self, state: AutomatonState) -> bool {
        self.accepting.contains(&state)
    }
}
