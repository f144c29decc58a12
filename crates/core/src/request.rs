use std::rc::Rc;

use serde::Serialize;
use tracing::warn;

use crate::grammar::{AutomatonState, DecodingAutomaton};
use crate::kv_cache::{NodeId, RadixCache, RowId, SlotId};
use crate::sampling::{SamplerState, SamplingParams};
use crate::tokenizer::TokenizerWrapper;

pub type RequestId = u64;

/// Tokens initially held between the surrogate and read cursors so that
/// characters spanning several tokens can finish decoding before any text
/// is released.
pub const DEFAULT_SURROGATE_WINDOW: usize = 5;

/// Why a request stopped. Terminal and sticky: the first reason set wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FinishReason {
    /// Reached the max-new-tokens limit.
    Length { length: usize },
    /// Sampled the EOS token or a configured stop token.
    StopToken { matched: u32 },
    /// Decoded text contains a configured stop string.
    StopString { matched: String },
    /// Cancelled from outside the scheduling loop.
    Abort,
}

impl FinishReason {
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort)
    }
}

/// One inference request and everything the scheduler tracks for it.
///
/// Fields are public in the manner of a record: the batch mutates them as
/// the request moves through admission, decode, retraction, and finish.
pub struct Req {
    pub rid: RequestId,
    /// Prompt text as submitted; recovered from the ids when absent.
    pub input_text: Option<String>,
    /// The prompt. Never changes after arrival.
    pub origin_input_ids: Vec<u32>,
    /// The admission sequence: prompt plus any output generated before a
    /// retraction. Frozen by `init_fill_ids` each time admission begins.
    pub fill_ids: Vec<u32>,
    /// Tokens generated so far, grown by sampling and by jump-forwards.
    pub output_ids: Vec<u32>,
    pub arrival_tick: u64,

    // Incremental detokenization cursor.
    pub decoded_text: String,
    pub surr_offset: Option<usize>,
    pub read_offset: Option<usize>,
    pub surr_window: usize,

    /// Sampled decode steps only; tokens inserted by jump-forwards are
    /// excluded so usage reporting reflects real model work.
    pub completion_tokens_wo_jump_forward: usize,

    // Prefix-match state while scheduled.
    pub extend_input_len: usize,
    /// Cache slots reused for the matched prefix at admission.
    pub prefix_slots: Vec<SlotId>,
    /// Radix node locked on behalf of this request.
    pub last_node: NodeId,
    /// Slot-table row held from admission until completion or requeue.
    pub row_id: Option<RowId>,

    pub sampling_params: SamplingParams,
    pub sampler_state: SamplerState,
    pub tokenizer: Rc<TokenizerWrapper>,
    pub eos_token_id: u32,
    pub finish_reason: Option<FinishReason>,

    // Logprob reporting.
    pub return_logprob: bool,
    pub logprob_start_len: usize,
    pub top_logprobs_num: usize,
    pub decode_token_logprobs: Vec<(u32, f32)>,
    pub decode_top_logprobs: Vec<Vec<(u32, f32)>>,
    /// Trailing output tokens whose logprobs a jump-forward left stale and
    /// the next forward pass must recompute.
    pub last_update_decode_tokens: usize,

    // Constrained decoding.
    pub automaton: Option<Rc<dyn DecodingAutomaton>>,
    pub automaton_state: AutomatonState,

    // Chunked prefill progress over `fill_ids`.
    pub num_cached_tokens: usize,
    pub num_inflight_tokens: usize,
}

impl Req {
    pub fn new(
        rid: RequestId,
        input_text: Option<String>,
        origin_input_ids: Vec<u32>,
        tokenizer: Rc<TokenizerWrapper>,
        eos_token_id: u32,
        arrival_tick: u64,
    ) -> Self {
        Self {
            rid,
            input_text,
            origin_input_ids,
            fill_ids: Vec::new(),
            output_ids: Vec::new(),
            arrival_tick,
            decoded_text: String::new(),
            surr_offset: None,
            read_offset: None,
            surr_window: DEFAULT_SURROGATE_WINDOW,
            completion_tokens_wo_jump_forward: 0,
            extend_input_len: 0,
            prefix_slots: Vec::new(),
            last_node: RadixCache::ROOT,
            row_id: None,
            sampling_params: SamplingParams::default(),
            sampler_state: SamplerState::new(None),
            tokenizer,
            eos_token_id,
            finish_reason: None,
            return_logprob: false,
            logprob_start_len: 0,
            top_logprobs_num: 0,
            decode_token_logprobs: Vec::new(),
            decode_top_logprobs: Vec::new(),
            last_update_decode_tokens: 0,
            automaton: None,
            automaton_state: 0,
            num_cached_tokens: 0,
            num_inflight_tokens: 0,
        }
    }

    /// Install sampling parameters, normalizing greedy settings and
    /// reseeding the request RNG.
    pub fn set_sampling_params(&mut self, mut params: SamplingParams) {
        params.normalize();
        self.sampler_state = SamplerState::new(params.seed);
        self.sampling_params = params;
    }

    /// Attach a decoding constraint, starting at its initial state.
    pub fn set_automaton(&mut self, automaton: Rc<dyn DecodingAutomaton>) {
        self.automaton_state = automaton.start_state();
        self.automaton = Some(automaton);
    }

    pub fn finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Cancel the request. A no-op once some finish reason is set.
    pub fn abort(&mut self) {
        if self.finish_reason.is_none() {
            self.finish_reason = Some(FinishReason::Abort);
        }
    }

    /// Prompt plus all output, the sequence the KV cache is keyed by.
    pub fn all_ids(&self) -> Vec<u32> {
        self.origin_input_ids
            .iter()
            .chain(&self.output_ids)
            .copied()
            .collect()
    }

    pub fn seq_len(&self) -> usize {
        self.origin_input_ids.len() + self.output_ids.len()
    }

    /// Prompt length in tokens, for caller-side usage accounting.
    pub fn prompt_tokens(&self) -> usize {
        self.origin_input_ids.len()
    }

    /// Completion length in tokens, jump-forward splices included.
    pub fn completion_tokens(&self) -> usize {
        self.output_ids.len()
    }

    /// Record one sampled decode token.
    pub fn append_sampled(&mut self, token_id: u32) {
        self.output_ids.push(token_id);
        self.completion_tokens_wo_jump_forward += 1;
    }

    /// Freeze the admission sequence. Output kept across a retraction is
    /// re-filled as part of the prompt.
    pub fn init_fill_ids(&mut self) {
        self.fill_ids = self.all_ids();
    }

    /// Drop scheduling state when the request goes back to the waiting
    /// queue after a retraction or a jump-forward; generated tokens and the
    /// detokenization cursor survive so progress is not re-streamed. The
    /// caller releases the slot-table row first.
    pub fn reset_for_requeue(&mut self) {
        debug_assert!(self.row_id.is_none(), "row must be freed before requeue");
        self.prefix_slots = Vec::new();
        self.last_node = RadixCache::ROOT;
        self.extend_input_len = 0;
        self.num_cached_tokens = 0;
        self.num_inflight_tokens = 0;
    }

    // ----- chunked prefill -----

    /// The token span the next step feeds to the model: a slice of the
    /// admission sequence while filling, or the single newest output token
    /// once the whole sequence is cached.
    pub fn inflight_token_ids(&self) -> Vec<u32> {
        let start = self.num_cached_tokens;
        if start >= self.fill_ids.len() {
            debug_assert_eq!(self.num_inflight_tokens, 1);
            debug_assert_eq!(start + 1, self.seq_len());
            return self.output_ids.last().copied().into_iter().collect();
        }
        self.fill_ids[start..start + self.num_inflight_tokens].to_vec()
    }

    /// Context length the next forward pass runs against.
    pub fn context_len(&self) -> usize {
        self.num_cached_tokens + self.num_inflight_tokens
    }

    pub fn update_after_step(&mut self) {
        self.num_cached_tokens += self.num_inflight_tokens;
        self.num_inflight_tokens = 0;
    }

    /// Sequence positions not yet covered by the cache counter.
    pub fn num_unfinished_tokens(&self) -> usize {
        self.seq_len() - self.num_cached_tokens
    }

    // ----- incremental detokenization -----

    fn detokenize_cursor(&self) -> (usize, usize) {
        match (self.surr_offset, self.read_offset) {
            (Some(surr), Some(read)) => (surr, read),
            _ => {
                let read = self.origin_input_ids.len();
                (read.saturating_sub(self.surr_window), read)
            }
        }
    }

    fn decode_delta(&self, surr: usize, read: usize) -> Option<(String, usize)> {
        let all_ids = self.all_ids();
        debug_assert!(read <= all_ids.len());
        let surr_text = self.tokenizer.decode(&all_ids[surr..read]).ok()?;
        let new_text = self.tokenizer.decode(&all_ids[surr..]).ok()?;

        // Text is released only once the tail decodes past the surrogate
        // window without ending inside an unfinished character.
        let surr_chars = surr_text.chars().count();
        if new_text.chars().count() > surr_chars
            && !new_text.ends_with(char::REPLACEMENT_CHARACTER)
        {
            let delta: String = new_text.chars().skip(surr_chars).collect();
            Some((delta, all_ids.len()))
        } else {
            None
        }
    }

    /// Advance the detokenization cursor, returning newly safe text.
    /// `None` withholds output until a later token completes the tail.
    pub fn detokenize_incrementally(&mut self) -> Option<String> {
        let (surr, read) = self.detokenize_cursor();
        self.surr_offset = Some(surr);
        self.read_offset = Some(read);

        let (delta, num_all_tokens) = self.decode_delta(surr, read)?;
        self.decoded_text.push_str(&delta);
        self.surr_offset = Some(read);
        self.read_offset = Some(num_all_tokens);
        Some(delta)
    }

    /// The text `detokenize_incrementally` would release, computed without
    /// moving the cursor. Used to probe a speculative output extension.
    pub fn preview_decode(&self) -> Option<String> {
        let (surr, read) = self.detokenize_cursor();
        self.decode_delta(surr, read).map(|(delta, _)| delta)
    }

    // ----- finish conditions -----

    /// Evaluate finish conditions: stop tokens, then the length cap, then
    /// stop strings. A stop token sampled on the last allowed step counts
    /// as a token match, not as running out of budget. Sticky: does
    /// nothing once a reason is set.
    pub fn check_finished(&mut self) {
        if self.finished() {
            return;
        }

        if let Some(&last) = self.output_ids.last() {
            if last == self.eos_token_id && !self.sampling_params.ignore_eos {
                self.finish_reason = Some(FinishReason::StopToken { matched: last });
                return;
            }
            if self.sampling_params.stop_token_ids.contains(&last) {
                self.finish_reason = Some(FinishReason::StopToken { matched: last });
                return;
            }
        }

        if self.output_ids.len() >= self.sampling_params.max_new_tokens {
            self.finish_reason = Some(FinishReason::Length {
                length: self.output_ids.len(),
            });
            return;
        }

        if self.output_ids.is_empty() {
            return;
        }

        if !self.sampling_params.stop_strs.is_empty() {
            let window = self.sampling_params.stop_str_max_len() + 1;
            let tail_start = self.output_ids.len().saturating_sub(window);
            let Ok(tail) = self.tokenizer.decode(&self.output_ids[tail_start..]) else {
                return;
            };
            for stop in &self.sampling_params.stop_strs {
                if tail.contains(stop.as_str()) || self.decoded_text.contains(stop.as_str()) {
                    self.finish_reason = Some(FinishReason::StopString {
                        matched: stop.clone(),
                    });
                    return;
                }
            }
        }
    }

    // ----- jump-forward -----

    /// Splice forced text into the output by re-encoding the whole
    /// sequence, then re-seat the detokenization cursor and constraint
    /// state.
    ///
    /// Fails (returning `false`, with the request untouched) when the
    /// re-encoded prompt boundary diverges from the original prompt ids;
    /// the caller falls back to normal decoding.
    pub fn jump_forward_and_retokenize(
        &mut self,
        jump_forward_str: &str,
        next_state: AutomatonState,
    ) -> bool {
        let input_text = match &self.input_text {
            Some(text) => text.clone(),
            None => match self.tokenizer.decode(&self.origin_input_ids) {
                Ok(text) => {
                    self.input_text = Some(text.clone());
                    text
                }
                Err(_) => return false,
            },
        };

        let all_text = format!("{}{}{}", input_text, self.decoded_text, jump_forward_str);
        let Ok(all_ids) = self.tokenizer.encode(&all_text) else {
            return false;
        };

        let prompt_tokens = self.origin_input_ids.len();
        if prompt_tokens == 0 || all_ids.len() < prompt_tokens {
            return false;
        }
        if all_ids[prompt_tokens - 1] != self.origin_input_ids[prompt_tokens - 1] {
            // Retokenizing fused the prompt tail with the output; the
            // cached prefix would no longer line up with the prompt ids.
            warn!(
                rid = self.rid,
                "token fusion between prompt and output, skipping jump-forward"
            );
            return false;
        }

        let old_output_ids =
            std::mem::replace(&mut self.output_ids, all_ids[prompt_tokens..].to_vec());
        self.decoded_text.push_str(jump_forward_str);
        // The jump landed on a text boundary, so the next decode window
        // can start flush at the read cursor.
        self.surr_offset = Some(all_ids.len());
        self.read_offset = Some(all_ids.len());
        self.automaton_state = next_state;

        if self.return_logprob {
            // Logprobs beyond the first re-tokenization divergence no
            // longer describe the tokens actually in the output.
            let keep = old_output_ids
                .iter()
                .zip(&self.output_ids)
                .take_while(|(old, new)| old == new)
                .count();
            self.decode_token_logprobs.truncate(keep);
            self.decode_top_logprobs.truncate(keep);
            self.logprob_start_len = prompt_tokens + keep;
            self.last_update_decode_tokens = self.output_ids.len() - keep;
        }

        true
    }
}

impl std::fmt::Debug for Req {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Req")
            .field("rid", &self.rid)
            .field("input_len", &self.origin_input_ids.len())
            .field("output_len", &self.output_ids.len())
            .field("finish_reason", &self.finish_reason)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_req(words: &[&str], prompt: &str) -> Req {
        let tokenizer = Rc::new(TokenizerWrapper::for_testing(words));
        let eos = tokenizer.token_to_id("</s>").unwrap();
        let ids = tokenizer.encode(prompt).unwrap();
        let mut req = Req::new(1, Some(prompt.to_string()), ids, tokenizer, eos, 0);
        req.set_sampling_params(SamplingParams {
            max_new_tokens: 100,
            ..Default::default()
        });
        req
    }

    fn word_id(req: &Req, word: &str) -> u32 {
        req.tokenizer.token_to_id(word).unwrap()
    }

    #[test]
    fn new_request_starts_waiting() {
        let req = test_req(&["hello"], "hello");
        assert!(!req.finished());
        assert_eq!(req.output_ids.len(), 0);
        assert_eq!(req.last_node, RadixCache::ROOT);
        assert_eq!(req.num_cached_tokens, 0);
        assert!(req.surr_offset.is_none());
    }

    #[test]
    fn detokenize_releases_whole_words() {
        let mut req = test_req(&["hello", " world"], "hello");
        let world = word_id(&req, " world");

        req.append_sampled(world);
        assert_eq!(req.detokenize_incrementally().as_deref(), Some(" world"));
        assert_eq!(req.decoded_text, " world");
        assert_eq!(req.surr_offset, Some(1));
        assert_eq!(req.read_offset, Some(2));
    }

    #[test]
    fn detokenize_withholds_partial_utf8() {
        // "é" is 0xC3 0xA9; after the first byte the tail decodes to a
        // replacement character and must be withheld.
        let mut req = test_req(&["hello"], "hello");
        let b0 = req.tokenizer.token_for_byte(0xC3).unwrap();
        let b1 = req.tokenizer.token_for_byte(0xA9).unwrap();

        req.append_sampled(b0);
        assert_eq!(req.detokenize_incrementally(), None);
        assert_eq!(req.decoded_text, "");

        req.append_sampled(b1);
        assert_eq!(req.detokenize_incrementally().as_deref(), Some("é"));
        assert_eq!(req.decoded_text, "é");
    }

    #[test]
    fn preview_does_not_move_the_cursor() {
        let mut req = test_req(&["hello", " world"], "hello");
        let world = word_id(&req, " world");
        req.append_sampled(world);

        assert_eq!(req.preview_decode().as_deref(), Some(" world"));
        assert_eq!(req.preview_decode().as_deref(), Some(" world"));
        assert_eq!(req.decoded_text, "");
        assert!(req.surr_offset.is_none());
    }

    #[test]
    fn length_limit_finishes_request() {
        let mut req = test_req(&["a", "b"], "a");
        req.sampling_params.max_new_tokens = 2;
        let b = word_id(&req, "b");

        req.append_sampled(b);
        req.check_finished();
        assert!(!req.finished());

        req.append_sampled(b);
        req.check_finished();
        assert_eq!(req.finish_reason, Some(FinishReason::Length { length: 2 }));

        // Sticky: later checks never replace the reason.
        req.append_sampled(b);
        req.check_finished();
        assert_eq!(req.finish_reason, Some(FinishReason::Length { length: 2 }));
    }

    #[test]
    fn eos_finishes_unless_ignored() {
        let mut req = test_req(&["a"], "a");
        let eos = req.eos_token_id;
        req.append_sampled(eos);
        req.check_finished();
        assert_eq!(req.finish_reason, Some(FinishReason::StopToken { matched: eos }));

        let mut req = test_req(&["a"], "a");
        req.sampling_params.ignore_eos = true;
        req.append_sampled(req.eos_token_id);
        req.check_finished();
        assert!(!req.finished());
    }

    #[test]
    fn configured_stop_token_finishes() {
        let mut req = test_req(&["a", "b"], "a");
        let b = word_id(&req, "b");
        req.sampling_params.stop_token_ids = vec![b];

        req.append_sampled(b);
        req.check_finished();
        assert_eq!(req.finish_reason, Some(FinishReason::StopToken { matched: b }));
    }

    #[test]
    fn stop_string_matches_decoded_tail() {
        let mut req = test_req(&["hi", " world"], "hi");
        req.sampling_params.stop_strs = vec!["world".to_string()];
        let world = word_id(&req, " world");

        req.append_sampled(world);
        req.check_finished();
        assert_eq!(
            req.finish_reason,
            Some(FinishReason::StopString {
                matched: "world".to_string()
            })
        );
    }

    #[test]
    fn stop_token_wins_when_length_coincides() {
        // EOS landing exactly on the last allowed step is a token match.
        let mut req = test_req(&["a", "b"], "a");
        req.sampling_params.max_new_tokens = 3;
        let eos = req.eos_token_id;
        let b = word_id(&req, "b");
        for id in [b, b, eos] {
            req.append_sampled(id);
            req.check_finished();
        }
        assert_eq!(req.finish_reason, Some(FinishReason::StopToken { matched: eos }));
    }

    #[test]
    fn abort_sets_reason_once() {
        let mut req = test_req(&["a"], "a");
        req.abort();
        assert_eq!(req.finish_reason, Some(FinishReason::Abort));
        assert!(req.finish_reason.as_ref().unwrap().is_abort());

        req.sampling_params.max_new_tokens = 0;
        req.check_finished();
        assert_eq!(req.finish_reason, Some(FinishReason::Abort));
    }

    #[test]
    fn chunked_counters_walk_the_fill_sequence() {
        let mut req = test_req(&["a"], "a");
        req.origin_input_ids = (100..110).collect();
        req.init_fill_ids();
        assert_eq!(req.fill_ids.len(), 10);

        req.num_inflight_tokens = 4;
        assert_eq!(req.inflight_token_ids(), (100..104).collect::<Vec<_>>());
        assert_eq!(req.context_len(), 4);
        req.update_after_step();
        assert_eq!(req.num_cached_tokens, 4);

        req.num_inflight_tokens = 6;
        assert_eq!(req.inflight_token_ids(), (104..110).collect::<Vec<_>>());
        req.update_after_step();
        assert_eq!(req.num_cached_tokens, 10);
        assert_eq!(req.num_unfinished_tokens(), 0);
    }

    #[test]
    fn inflight_switches_to_decode_after_fill() {
        let mut req = test_req(&["a"], "a");
        req.origin_input_ids = vec![7, 8, 9];
        req.init_fill_ids();
        req.num_cached_tokens = 3;

        req.append_sampled(42);
        req.num_inflight_tokens = 1;
        assert_eq!(req.inflight_token_ids(), vec![42]);
        assert_eq!(req.context_len(), 4);
        assert_eq!(req.num_unfinished_tokens(), 1);
    }

    #[test]
    fn retraction_keeps_progress() {
        let mut req = test_req(&["a", "b"], "a");
        let b = word_id(&req, "b");
        req.append_sampled(b);
        req.prefix_slots = vec![3, 4, 5];
        req.last_node = 9;
        req.num_cached_tokens = 4;

        req.reset_for_requeue();
        assert!(req.prefix_slots.is_empty());
        assert_eq!(req.last_node, RadixCache::ROOT);
        assert_eq!(req.num_cached_tokens, 0);
        assert_eq!(req.output_ids, vec![b]);

        req.init_fill_ids();
        assert_eq!(req.fill_ids.len(), req.seq_len());
    }

    #[test]
    fn jump_forward_retokenizes_the_output() {
        let mut req = test_req(&["hello", " wor", "ld!", " world!"], "hello");
        let wor = word_id(&req, " wor");
        req.append_sampled(wor);
        req.detokenize_incrementally().unwrap();
        assert_eq!(req.decoded_text, " wor");

        assert!(req.jump_forward_and_retokenize("ld!", 17));
        // "hello world!" re-encodes the output as the single " world!" piece.
        let world = word_id(&req, " world!");
        assert_eq!(req.output_ids, vec![world]);
        assert_eq!(req.decoded_text, " world!");
        assert_eq!(req.automaton_state, 17);
        assert_eq!(req.surr_offset, req.read_offset);

        // The cursor lands past the spliced text; nothing is re-released.
        assert_eq!(req.detokenize_incrementally(), None);
    }

    #[test]
    fn jump_forward_rejects_prompt_fusion() {
        // "ab" + "c" re-encodes to the single token "abc", breaking the
        // prompt boundary.
        let mut req = test_req(&["ab", "abc", "c"], "ab");
        let before = req.output_ids.clone();

        assert!(!req.jump_forward_and_retokenize("c", 5));
        assert_eq!(req.output_ids, before);
        assert_eq!(req.automaton_state, 0);
        assert_eq!(req.decoded_text, "");
    }

    #[test]
    fn jump_forward_truncates_stale_logprobs() {
        let mut req = test_req(&["x", " y", " z", " y z!"], "x");
        req.return_logprob = true;
        let y = word_id(&req, " y");
        let z = word_id(&req, " z");
        req.append_sampled(y);
        req.detokenize_incrementally().unwrap();
        req.append_sampled(z);
        req.detokenize_incrementally().unwrap();
        req.decode_token_logprobs = vec![(y, -0.1), (z, -0.2)];
        req.decode_top_logprobs = vec![vec![(y, -0.1)], vec![(z, -0.2)]];

        assert!(req.jump_forward_and_retokenize("!", 3));
        // " y z!" becomes one piece; no old output token survives.
        assert_eq!(req.output_ids, vec![word_id(&req, " y z!")]);
        assert!(req.decode_token_logprobs.is_empty());
        assert!(req.decode_top_logprobs.is_empty());
        assert_eq!(req.logprob_start_len, 1);
        assert_eq!(req.last_update_decode_tokens, 1);
    }

    #[test]
    fn sampled_tokens_count_toward_completion_usage() {
        let mut req = test_req(&["hello", " wor", "ld!", " world!"], "hello");
        let wor = word_id(&req, " wor");
        req.append_sampled(wor);
        req.detokenize_incrementally().unwrap();
        assert_eq!(req.completion_tokens_wo_jump_forward, 1);
        assert_eq!(req.prompt_tokens(), 1);
        assert_eq!(req.completion_tokens(), 1);

        // Jump-forward splices tokens without touching the sampled-token
        // counter; completion usage follows the spliced output.
        assert!(req.jump_forward_and_retokenize("ld!", 0));
        assert_eq!(req.completion_tokens_wo_jump_forward, 1);
        assert_eq!(req.completion_tokens(), 1);
    }

    #[test]
    fn finish_reason_serializes_with_detail() {
        let reason = FinishReason::StopString {
            matched: "done".to_string(),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["reason"], "stop_string");
        assert_eq!(json["matched"], "done");

        let json = serde_json::to_value(FinishReason::Length { length: 8 }).unwrap();
        assert_eq!(json["reason"], "length");
        assert_eq!(json["length"], 8);
    }
}
