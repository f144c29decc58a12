//! Regex automaton compiled to a dense DFA.
//!
//! Patterns are anchored and compiled once; a BFS over token-boundary
//! states precomputes the packed allowed-token row for every state a
//! request can occupy, so masking at sampling time is a single row copy.
//! Forced-continuation walks for jump-forward read the DFA directly.

use std::sync::Arc;

use regex_automata::dfa::dense::DFA;
use regex_automata::dfa::Automaton;
use regex_automata::util::primitives::StateID;
use regex_automata::Anchored;

use super::bitmask::PackedBitmask;
use super::vocabulary::VocabularyIndex;
use super::{AutomatonState, DecodingAutomaton};

/// Bound on a single forced walk; unminimized automata may contain
/// cycles that never reach a match.
const MAX_FORCED_RUN: usize = 4096;

/// Dense-DFA automaton with precomputed per-state allowed-token rows.
pub struct RegexDfaAutomaton {
    dfa: DFA<Vec<u32>>,
    /// Packed allowed-token row per token-boundary state.
    allowed_rows: ahash::AHashMap<StateID, Vec<i32>>,
    start: StateID,
    vocab: Arc<VocabularyIndex>,
}

impl std::fmt::Debug for RegexDfaAutomaton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegexDfaAutomaton")
            .field("states_precomputed", &self.allowed_rows.len())
            .field("vocab_size", &self.vocab.vocab_size())
            .finish()
    }
}

impl RegexDfaAutomaton {
    /// Compile `pattern` against a vocabulary. The pattern is anchored so
    /// the whole generated output must match it; `eos_token_id` becomes
    /// allowed exactly at states where the match may end.
    pub fn new(
        pattern: &str,
        vocab: Arc<VocabularyIndex>,
        eos_token_id: u32,
    ) -> anyhow::Result<Self> {
        let anchored = format!("^(?:{pattern})$");

        let dfa = DFA::builder()
            .configure(
                DFA::config()
                    .minimize(false)
                    .start_kind(regex_automata::dfa::StartKind::Anchored),
            )
            .build(&anchored)
            .map_err(|e| anyhow::anyhow!("automaton compilation failed: {e}"))?;

        let start = dfa
            .start_state(&regex_automata::util::start::Config::new().anchored(Anchored::Yes))
            .map_err(|e| anyhow::anyhow!("automaton start state: {e}"))?;

        let allowed_rows = Self::precompute_rows(&dfa, start, &vocab, eos_token_id);

        Ok(Self {
            dfa,
            allowed_rows,
            start,
            vocab,
        })
    }

    /// BFS over states reachable by whole tokens, computing each state's
    /// packed allowed row along the way.
    fn precompute_rows(
        dfa: &DFA<Vec<u32>>,
        start: StateID,
        vocab: &VocabularyIndex,
        eos_token_id: u32,
    ) -> ahash::AHashMap<StateID, Vec<i32>> {
        let words_per_row = vocab.vocab_size().div_ceil(32);
        let mut rows = ahash::AHashMap::new();
        let mut seen = ahash::AHashSet::new();
        let mut queue = std::collections::VecDeque::new();

        seen.insert(start);
        queue.push_back(start);

        while let Some(state) = queue.pop_front() {
            let mut row = vec![0i32; words_per_row];

            for (token_id, bytes) in vocab.iter() {
                if bytes.is_empty() {
                    continue;
                }
                let Some(next) = walk_token(dfa, state, bytes) else {
                    continue;
                };
                row[token_id as usize / 32] |= 1i32 << (token_id % 32);
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }

            // Stopping is legal exactly at accepting states.
            if accepts_here(dfa, state) {
                row[eos_token_id as usize / 32] |= 1i32 << (eos_token_id % 32);
            }

            rows.insert(state, row);
        }

        rows
    }

    fn state_id(&self, state: AutomatonState) -> Option<StateID> {
        StateID::new(state as usize).ok()
    }
}

impl DecodingAutomaton for RegexDfaAutomaton {
    fn start_state(&self) -> AutomatonState {
        self.start.as_usize() as u32
    }

    fn fill_allowed(&self, state: AutomatonState, mask: &mut PackedBitmask, row: usize) {
        let Some(sid) = self.state_id(state) else {
            return;
        };
        if let Some(packed) = self.allowed_rows.get(&sid) {
            mask.load_row(row, packed);
        }
        // A state outside the precomputed set leaves the row as the
        // caller cleared it: nothing allowed.
    }

    fn next_state(&self, state: AutomatonState, token_id: u32) -> Option<AutomatonState> {
        let bytes = self.vocab.token_bytes(token_id);
        if bytes.is_empty() {
            return None;
        }
        let sid = self.state_id(state)?;
        walk_token(&self.dfa, sid, bytes).map(|next| next.as_usize() as u32)
    }

    fn forced_byte_chain(&self, state: AutomatonState) -> Vec<(u8, AutomatonState)> {
        let Some(mut sid) = self.state_id(state) else {
            return Vec::new();
        };
        let mut chain = Vec::new();

        while chain.len() < MAX_FORCED_RUN {
            // Nothing is forced from a state where the match may end.
            if accepts_here(&self.dfa, sid) {
                break;
            }

            let mut sole = None;
            for byte in 0..=u8::MAX {
                let next = self.dfa.next_state(sid, byte);
                if self.dfa.is_dead_state(next) {
                    continue;
                }
                if sole.is_some() {
                    sole = None;
                    break;
                }
                sole = Some((byte, next));
            }

            let Some((byte, next)) = sole else { break };
            chain.push((byte, next.as_usize() as u32));
            sid = next;
        }

        chain
    }

    fn forced_symbol_run(&self, state: AutomatonState) -> (String, AutomatonState) {
        let chain = self.forced_byte_chain(state);
        let mut bytes = Vec::with_capacity(chain.len());
        let mut boundary = (0usize, state);

        for (byte, next) in chain {
            bytes.push(byte);
            if std::str::from_utf8(&bytes).is_ok() {
                boundary = (bytes.len(), next);
            }
        }

        bytes.truncate(boundary.0);
        match String::from_utf8(bytes) {
            Ok(text) => (text, boundary.1),
            Err(_) => (String::new(), state),
        }
    }

    fn is_accepting(&self, state: AutomatonState) -> bool {
        self.state_id(state)
            .is_some_and(|sid| accepts_here(&self.dfa, sid))
    }
}

/// Walk the DFA through one token's bytes; `None` if the walk dies.
fn walk_token(dfa: &DFA<Vec<u32>>, from: StateID, bytes: &[u8]) -> Option<StateID> {
    let mut state = from;
    for &byte in bytes {
        state = dfa.next_state(state, byte);
        if dfa.is_dead_state(state) {
            return None;
        }
    }
    Some(state)
}

/// Whether the match may end at this state.
fn accepts_here(dfa: &DFA<Vec<u32>>, state: StateID) -> bool {
    dfa.is_match_state(dfa.next_eoi_state(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::TokenizerWrapper;

    fn compile(pattern: &str, words: &[&str]) -> (TokenizerWrapper, RegexDfaAutomaton) {
        let tokenizer = TokenizerWrapper::for_testing(words);
        let index = VocabularyIndex::shared(&tokenizer);
        let eos = tokenizer.token_to_id("</s>").unwrap();
        let automaton = RegexDfaAutomaton::new(pattern, index, eos).unwrap();
        (tokenizer, automaton)
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let tokenizer = TokenizerWrapper::for_testing(&[]);
        let index = VocabularyIndex::shared(&tokenizer);
        assert!(RegexDfaAutomaton::new("[unclosed", index, 2).is_err());
    }

    #[test]
    fn empty_match_acceptance_depends_on_pattern() {
        let (_t, star) = compile("[a-z]*", &[]);
        assert!(star.is_accepting(star.start_state()));

        let (_t, plus) = compile("[a-z]+", &[]);
        assert!(!plus.is_accepting(plus.start_state()));
    }

    #[test]
    fn allowed_set_filters_vocabulary() {
        let (tokenizer, a) = compile("[a-z]+", &["hello", "world", "Hi"]);
        let mut mask = PackedBitmask::new(1, tokenizer.vocab_size());
        a.fill_allowed(a.start_state(), &mut mask, 0);

        let id = |s: &str| tokenizer.token_to_id(s).unwrap() as usize;
        assert!(mask.is_allowed(0, id("hello")));
        assert!(mask.is_allowed(0, id("world")));
        assert!(!mask.is_allowed(0, id("Hi")));

        let lower = tokenizer.token_for_byte(b'a').unwrap() as usize;
        assert!(mask.is_allowed(0, lower));
        let upper = tokenizer.token_for_byte(b'A').unwrap() as usize;
        assert!(!mask.is_allowed(0, upper));
    }

    #[test]
    fn eos_bit_tracks_accepting_states() {
        let (tokenizer, a) = compile("ab", &[]);
        let eos = tokenizer.token_to_id("</s>").unwrap() as usize;
        let mut mask = PackedBitmask::new(1, tokenizer.vocab_size());

        a.fill_allowed(a.start_state(), &mut mask, 0);
        assert!(!mask.is_allowed(0, eos));

        let s1 = a
            .next_state(a.start_state(), tokenizer.token_for_byte(b'a').unwrap())
            .unwrap();
        let s2 = a
            .next_state(s1, tokenizer.token_for_byte(b'b').unwrap())
            .unwrap();
        assert!(a.is_accepting(s2));

        mask.clear_row(0);
        a.fill_allowed(s2, &mut mask, 0);
        assert!(mask.is_allowed(0, eos));
    }

    #[test]
    fn next_state_rejects_grammar_violations() {
        let (tokenizer, a) = compile("[0-9]+", &["hello"]);

        let hello = tokenizer.token_to_id("hello").unwrap();
        assert!(a.next_state(a.start_state(), hello).is_none());

        // Special tokens have no bytes to walk.
        let eos = tokenizer.token_to_id("</s>").unwrap();
        assert!(a.next_state(a.start_state(), eos).is_none());

        let seven = tokenizer.token_for_byte(b'7').unwrap();
        assert!(a.next_state(a.start_state(), seven).is_some());
    }

    #[test]
    fn matching_runs_through_word_tokens() {
        let (tokenizer, a) = compile("hello world", &["hello", " world"]);

        let s1 = a
            .next_state(a.start_state(), tokenizer.token_to_id("hello").unwrap())
            .unwrap();
        let s2 = a
            .next_state(s1, tokenizer.token_to_id(" world").unwrap())
            .unwrap();
        assert!(a.is_accepting(s2));
    }

    #[test]
    fn forced_chain_follows_a_single_path() {
        let (_t, a) = compile("hello", &[]);
        let chain = a.forced_byte_chain(a.start_state());

        let bytes: Vec<u8> = chain.iter().map(|&(b, _)| b).collect();
        assert_eq!(bytes, b"hello");

        let &(_, last) = chain.last().unwrap();
        assert!(a.is_accepting(last));
    }

    #[test]
    fn forced_chain_stops_at_a_branch() {
        let (_t, a) = compile("a(b|c)d", &[]);
        let chain = a.forced_byte_chain(a.start_state());
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].0, b'a');
    }

    #[test]
    fn forced_chain_stops_where_the_match_may_end() {
        let (_t, a) = compile("ab?", &[]);
        let chain = a.forced_byte_chain(a.start_state());
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].0, b'a');
    }

    #[test]
    fn multibyte_chain_exposes_continuation_bytes() {
        let (_t, a) = compile("é", &[]);
        let chain = a.forced_byte_chain(a.start_state());
        let bytes: Vec<u8> = chain.iter().map(|&(b, _)| b).collect();
        assert_eq!(bytes, "é".as_bytes());

        // Resuming mid-codepoint: the remainder starts with a
        // continuation byte.
        let rest = a.forced_byte_chain(chain[0].1);
        assert_eq!(rest.len(), 1);
        assert!((0x80..0xC0).contains(&rest[0].0));
    }

    #[test]
    fn symbol_run_stops_at_character_boundaries() {
        let (_t, a) = compile("héllo[ab]", &[]);

        let (text, state) = a.forced_symbol_run(a.start_state());
        assert_eq!(text, "héllo");
        assert!(!a.is_accepting(state));

        // From inside a codepoint no whole character is forced.
        let chain = a.forced_byte_chain(a.start_state());
        let mid = chain[1].1;
        let (text, resumed) = a.forced_symbol_run(mid);
        assert_eq!(text, "");
        assert_eq!(resumed, mid);
    }

    #[test]
    fn unknown_state_allows_nothing() {
        let (tokenizer, a) = compile("[a-z]+", &[]);
        let mut mask = PackedBitmask::new(1, tokenizer.vocab_size());
        a.fill_allowed(u32::MAX, &mut mask, 0);

        for token in 0..tokenizer.vocab_size() {
            assert!(!mask.is_allowed(0, token));
        }
    }
}
