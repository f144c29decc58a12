//! Batched request scheduling over shared cache state.
//!
//! A [`Batch`] groups the requests one scheduler step runs together and
//! owns the cache bookkeeping around that step: admission (prefix match,
//! row claim, slot allocation), decode growth, memory-pressure recovery
//! (eviction, retraction), jump-forward splicing, and sampling. Each
//! `prepare_*` call rebuilds a fresh [`ForwardPassDescriptor`] for the
//! injected [`AttentionBackend`]; per-request columns are never patched
//! in place across steps.
//!
//! The step loop a caller drives looks like:
//!
//! ```text
//! extend:  prepare_for_extend -> forward -> sample -> filter_finished
//! decode:  check_decode_mem (else retract_decode) -> prepare_for_decode
//!          -> forward -> sample -> filter_finished -> check_for_jump_forward
//! ```

use std::cell::RefCell;
use std::cmp::Reverse;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::forward::{AttentionBackend, ForwardMode, ForwardPassDescriptor, OutputPlacement};
use crate::grammar::PackedBitmask;
use crate::kv_cache::{CacheError, RadixCache, ReqSlotTable, RowId, SlotId, TokenSlotPool};
use crate::request::Req;
use crate::sampling::sample_row;

#[derive(Debug, Error)]
pub enum BatchError {
    /// Admission could not fit even after evicting every unlocked prefix.
    #[error("admission rejected: {requested} slots requested, {available} free after eviction")]
    AdmissionRejected { requested: usize, available: usize },

    #[error("prompt of {len} tokens exceeds the max context of {max_context}")]
    PromptTooLong { len: usize, max_context: usize },

    #[error("no prepared step to run")]
    NoPreparedStep,

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Per-step token allowance for chunked prefill.
#[derive(Debug, Clone)]
pub struct SchedulingBudget {
    pub max_tokens: usize,
    pub scheduled_tokens: usize,
}

impl SchedulingBudget {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            scheduled_tokens: 0,
        }
    }

    pub fn remaining_token_budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.scheduled_tokens)
    }

    pub fn schedule_new_tokens(&mut self, n: usize) {
        debug_assert!(n <= self.remaining_token_budget());
        self.scheduled_tokens += n;
    }
}

fn claimed_row(req: &Req) -> RowId {
    req.row_id.expect("scheduled request holds a slot-table row")
}

/// Victim order for retraction: oldest arrivals keep running longest,
/// and among same-tick arrivals the request with the most output is
/// kept. Victims are popped from the end.
fn retraction_order(reqs: &[Req]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..reqs.len()).collect();
    order.sort_by_key(|&i| (reqs[i].arrival_tick, Reverse(reqs[i].output_ids.len())));
    order
}

pub struct Batch {
    pub reqs: Vec<Req>,
    slot_table: Rc<RefCell<ReqSlotTable>>,
    token_pool: Rc<RefCell<TokenSlotPool>>,
    tree_cache: Rc<RefCell<RadixCache>>,
    backend: Rc<RefCell<dyn AttentionBackend>>,

    /// Row-covered context length per request, index-aligned with `reqs`.
    pub seq_lens: Vec<usize>,
    /// Position shift per request, carried through merges and filters.
    pub position_offsets: Vec<usize>,
    pub top_logprobs_nums: Vec<usize>,
    pub return_logprob: bool,

    forward_desc: Option<ForwardPassDescriptor>,
}

impl Batch {
    pub fn init_new(
        reqs: Vec<Req>,
        slot_table: Rc<RefCell<ReqSlotTable>>,
        token_pool: Rc<RefCell<TokenSlotPool>>,
        tree_cache: Rc<RefCell<RadixCache>>,
        backend: Rc<RefCell<dyn AttentionBackend>>,
    ) -> Self {
        let return_logprob = reqs.iter().any(|r| r.return_logprob);
        let top_logprobs_nums = reqs.iter().map(|r| r.top_logprobs_num).collect();
        Self {
            reqs,
            slot_table,
            token_pool,
            tree_cache,
            backend,
            seq_lens: Vec::new(),
            position_offsets: Vec::new(),
            top_logprobs_nums,
            return_logprob,
            forward_desc: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.reqs.len()
    }

    pub fn forward_descriptor(&self) -> Option<&ForwardPassDescriptor> {
        self.forward_desc.as_ref()
    }

    // ----- admission -----

    /// Admit the whole fill sequence of every request in one extend step.
    pub fn prepare_for_extend(&mut self) -> Result<(), BatchError> {
        self.prepare_extend_inner(None)
    }

    /// Admit up to `budget` fill tokens across the batch, front requests
    /// first. Requests left without a span this step idle and continue on
    /// the next call.
    pub fn prepare_for_extend_chunked(
        &mut self,
        budget: &mut SchedulingBudget,
    ) -> Result<(), BatchError> {
        self.prepare_extend_inner(Some(budget))
    }

    fn prepare_extend_inner(
        &mut self,
        mut budget: Option<&mut SchedulingBudget>,
    ) -> Result<(), BatchError> {
        let bs = self.reqs.len();
        debug_assert!(bs > 0, "prepare on an empty batch");

        let max_context = self.slot_table.borrow().max_context_len();
        for req in &self.reqs {
            let len = req.seq_len();
            if len > max_context {
                return Err(BatchError::PromptTooLong { len, max_context });
            }
        }

        // Claim rows for requests entering the table before any tree lock
        // is taken, so a full table fails without cleanup.
        let entering: Vec<usize> = self
            .reqs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.row_id.is_none())
            .map(|(i, _)| i)
            .collect();
        let rows = self.slot_table.borrow_mut().alloc_rows(entering.len())?;
        {
            let mut cache = self.tree_cache.borrow_mut();
            let mut table = self.slot_table.borrow_mut();
            for (&i, &row) in entering.iter().zip(&rows) {
                let req = &mut self.reqs[i];
                req.init_fill_ids();
                debug_assert!(!req.fill_ids.is_empty());
                // Leave at least one token uncached so the forward pass
                // has an input position to produce logits from.
                let match_len = req.fill_ids.len() - 1;
                let (prefix, node) = cache.match_prefix(&req.fill_ids[..match_len]);
                cache.inc_lock_ref(node);
                table.write_slots(row, 0, &prefix)?;
                req.num_cached_tokens = prefix.len();
                req.prefix_slots = prefix;
                req.last_node = node;
                req.row_id = Some(row);
            }
        }

        // This step's span per request.
        let mut extend_tokens = 0usize;
        for req in &mut self.reqs {
            let remaining = req.fill_ids.len() - req.num_cached_tokens;
            let span = match budget {
                Some(ref mut b) => {
                    let span = remaining.min(b.remaining_token_budget());
                    b.schedule_new_tokens(span);
                    span
                }
                None => remaining,
            };
            req.num_inflight_tokens = span;
            req.extend_input_len = span;
            extend_tokens += span;
        }

        let out_slots = match self.alloc_with_evict(extend_tokens) {
            Some(slots) => slots,
            None => {
                let available = self.token_pool.borrow().available_size();
                self.rollback_admission(&entering);
                warn!(
                    requested = extend_tokens,
                    available, "admission rejected, token pool exhausted after eviction"
                );
                return Err(BatchError::AdmissionRejected {
                    requested: extend_tokens,
                    available,
                });
            }
        };

        {
            let mut table = self.slot_table.borrow_mut();
            let mut pt = 0usize;
            for req in &self.reqs {
                let span = req.num_inflight_tokens;
                if span == 0 {
                    continue;
                }
                table.write_slots(claimed_row(req), req.num_cached_tokens, &out_slots[pt..pt + span])?;
                pt += span;
            }
        }

        if self.position_offsets.len() != bs {
            self.position_offsets = vec![0; bs];
        }
        let mut input_ids = Vec::with_capacity(extend_tokens);
        let mut positions = Vec::with_capacity(extend_tokens);
        let mut row_ids = Vec::with_capacity(bs);
        let mut seq_lens = Vec::with_capacity(bs);
        let mut prefix_lens = Vec::with_capacity(bs);
        let mut extend_start_loc = Vec::with_capacity(bs);
        let mut extend_seq_lens = Vec::with_capacity(bs);
        let mut start = 0usize;
        for (i, req) in self.reqs.iter().enumerate() {
            let span = req.num_inflight_tokens;
            let cached = req.num_cached_tokens;
            if span > 0 {
                input_ids.extend(req.inflight_token_ids());
            }
            let offset = self.position_offsets[i];
            positions.extend((cached..cached + span).map(|p| p + offset));
            row_ids.push(claimed_row(req));
            seq_lens.push(req.context_len());
            prefix_lens.push(cached);
            extend_start_loc.push(start);
            extend_seq_lens.push(span);
            start += span;
        }
        let extend_no_prefix = prefix_lens.iter().all(|&p| p == 0);
        self.seq_lens = seq_lens.clone();
        self.top_logprobs_nums = self.reqs.iter().map(|r| r.top_logprobs_num).collect();
        self.return_logprob = self.reqs.iter().any(|r| r.return_logprob);
        self.forward_desc = Some(ForwardPassDescriptor {
            mode: ForwardMode::Extend,
            batch_size: bs,
            total_num_tokens: extend_tokens,
            input_ids,
            row_ids,
            seq_lens,
            prefix_lens,
            positions,
            extend_start_loc,
            extend_seq_lens,
            extend_no_prefix,
            placement: OutputPlacement::Scattered(out_slots),
        });
        Ok(())
    }

    /// Allocate `need` slots, evicting unlocked cached prefixes once if
    /// the free list is short.
    fn alloc_with_evict(&mut self, need: usize) -> Option<Vec<SlotId>> {
        let mut pool = self.token_pool.borrow_mut();
        if let Ok(slots) = pool.alloc(need) {
            return Some(slots);
        }
        debug!(
            requested = need,
            available = pool.available_size(),
            "token pool short, evicting cached prefixes"
        );
        let mut cache = self.tree_cache.borrow_mut();
        cache.evict(need, &mut |s: &[SlotId]| pool.dec_ref(s));
        pool.alloc(need).ok()
    }

    /// Undo first-touch state after a failed admission. Requests holding
    /// rows from earlier chunks keep them; only this step's claims go.
    fn rollback_admission(&mut self, entering: &[usize]) {
        let mut cache = self.tree_cache.borrow_mut();
        let mut table = self.slot_table.borrow_mut();
        for &i in entering {
            let req = &mut self.reqs[i];
            cache.dec_lock_ref(req.last_node);
            if let Some(row) = req.row_id.take() {
                table.free_row(row);
            }
            req.reset_for_requeue();
        }
        for req in &mut self.reqs {
            req.num_inflight_tokens = 0;
            req.extend_input_len = 0;
        }
    }

    // ----- decode -----

    /// Whether one decode token per request fits, evicting unlocked
    /// prefixes if it does not at first.
    pub fn check_decode_mem(&mut self) -> bool {
        let bs = self.reqs.len();
        let mut pool = self.token_pool.borrow_mut();
        if pool.available_size() >= bs {
            return true;
        }
        let mut cache = self.tree_cache.borrow_mut();
        cache.evict(bs, &mut |s: &[SlotId]| pool.dec_ref(s));
        pool.available_size() >= bs
    }

    /// Grow every sequence by one position and stage the newest token as
    /// next input. Prefers one contiguous slot run for the whole batch.
    pub fn prepare_for_decode(&mut self) -> Result<(), BatchError> {
        let bs = self.reqs.len();
        debug_assert!(bs > 0, "prepare on an empty batch");

        let mut input_ids = Vec::with_capacity(bs);
        for (i, req) in self.reqs.iter_mut().enumerate() {
            let id = req
                .output_ids
                .last()
                .or_else(|| req.fill_ids.last())
                .copied()
                .unwrap_or(0);
            input_ids.push(id);
            debug_assert_eq!(req.num_cached_tokens + 1, req.seq_len());
            req.num_inflight_tokens = 1;
            self.seq_lens[i] += 1;
        }

        let max_context = self.slot_table.borrow().max_context_len();
        if let Some((i, &needed)) = self
            .seq_lens
            .iter()
            .enumerate()
            .find(|&(_, &s)| s > max_context)
        {
            return Err(BatchError::Cache(CacheError::ContextOverflow {
                row: claimed_row(&self.reqs[i]),
                needed,
                max_context,
            }));
        }

        let placement = {
            let mut pool = self.token_pool.borrow_mut();
            match pool.alloc_contiguous(bs) {
                Some((_, start, end)) => OutputPlacement::Contiguous { start, end },
                None => OutputPlacement::Scattered(pool.alloc(bs)?),
            }
        };
        {
            let mut table = self.slot_table.borrow_mut();
            for (i, req) in self.reqs.iter().enumerate() {
                table.write_slot(claimed_row(req), self.seq_lens[i] - 1, placement.slot(i))?;
            }
        }

        if self.position_offsets.len() != bs {
            self.position_offsets = vec![0; bs];
        }
        let positions: Vec<usize> = self
            .seq_lens
            .iter()
            .zip(&self.position_offsets)
            .map(|(&s, &off)| s - 1 + off)
            .collect();
        self.forward_desc = Some(ForwardPassDescriptor {
            mode: ForwardMode::Decode,
            batch_size: bs,
            total_num_tokens: bs,
            input_ids,
            row_ids: self.reqs.iter().map(claimed_row).collect(),
            seq_lens: self.seq_lens.clone(),
            prefix_lens: self.seq_lens.iter().map(|&s| s - 1).collect(),
            positions,
            extend_start_loc: (0..bs).collect(),
            extend_seq_lens: vec![1; bs],
            extend_no_prefix: false,
            placement,
        });
        Ok(())
    }

    /// Push the worst-placed requests back to the waiting queue until the
    /// survivors fit one decode step. Returns the retracted requests with
    /// their generated tokens intact.
    pub fn retract_decode(&mut self) -> Vec<Req> {
        let mut order = retraction_order(&self.reqs);
        let mut retracted_idx: Vec<usize> = Vec::new();
        loop {
            if self.token_pool.borrow().available_size() >= order.len() {
                break;
            }
            let Some(idx) = order.pop() else { break };
            let req = &mut self.reqs[idx];
            let Some(row) = req.row_id.take() else {
                continue;
            };
            let covered = self.seq_lens[idx];
            let uncached: Vec<SlotId> = self
                .slot_table
                .borrow()
                .row_slots(row, covered)[req.prefix_slots.len()..]
                .to_vec();
            self.token_pool.borrow_mut().dec_ref(&uncached);
            self.tree_cache.borrow_mut().dec_lock_ref(req.last_node);
            self.slot_table.borrow_mut().free_row(row);
            req.reset_for_requeue();
            retracted_idx.push(idx);
        }
        if retracted_idx.is_empty() {
            return Vec::new();
        }
        warn!(
            retracted = retracted_idx.len(),
            remaining = order.len(),
            "retracted decode requests under memory pressure"
        );
        retracted_idx.sort_unstable();
        let keep: Vec<usize> = (0..self.reqs.len())
            .filter(|i| retracted_idx.binary_search(i).is_err())
            .collect();
        self.filter_batch(&keep)
    }

    // ----- forward and sampling -----

    /// Run the prepared step through the backend. One logits row comes
    /// back per request.
    pub fn forward(&mut self) -> Result<Vec<Vec<f32>>, BatchError> {
        let desc = self.forward_desc.as_ref().ok_or(BatchError::NoPreparedStep)?;
        let logits = match desc.mode {
            ForwardMode::Extend => self.backend.borrow_mut().extend(desc),
            ForwardMode::Decode => self.backend.borrow_mut().decode(desc),
        }?;
        if logits.len() != self.reqs.len() {
            return Err(BatchError::Backend(anyhow::anyhow!(
                "backend returned {} logits rows for a batch of {}",
                logits.len(),
                self.reqs.len()
            )));
        }
        Ok(logits)
    }

    /// Sample one token per eligible request and settle the step: grammar
    /// masks apply before the draw, automaton states advance on the
    /// realized token, and finish conditions are checked.
    ///
    /// A request still filling its admission sequence, or idle under a
    /// chunk budget, gets `None` this step.
    pub fn sample(&mut self, logits: &[Vec<f32>]) -> Vec<Option<u32>> {
        debug_assert_eq!(logits.len(), self.reqs.len());
        let mut sampled = Vec::with_capacity(self.reqs.len());
        for (i, req) in self.reqs.iter_mut().enumerate() {
            let ready = !req.finished()
                && req.num_inflight_tokens > 0
                && req.context_len() >= req.fill_ids.len();
            if !ready {
                req.update_after_step();
                sampled.push(None);
                continue;
            }

            let mut row = logits[i].clone();
            let automaton = req.automaton.clone();
            if let Some(a) = &automaton {
                let mut mask = PackedBitmask::new(1, row.len());
                a.fill_allowed(req.automaton_state, &mut mask, 0);
                mask.apply_to_logits(&mut row, 0);
            }
            let want_logprobs = req.return_logprob.then_some(req.top_logprobs_num);
            let result = sample_row(
                &mut row,
                &req.sampling_params,
                &req.output_ids,
                &mut req.sampler_state,
                want_logprobs,
            );
            req.append_sampled(result.token_id);
            if let Some(a) = &automaton {
                match a.next_state(req.automaton_state, result.token_id) {
                    Some(next) => req.automaton_state = next,
                    None => {
                        warn!(
                            rid = req.rid,
                            token = result.token_id,
                            "sampled token leaves the constraint automaton, aborting"
                        );
                        req.abort();
                    }
                }
            }
            if req.return_logprob {
                req.decode_token_logprobs.push((result.token_id, result.logprob));
                if req.top_logprobs_num > 0 {
                    req.decode_top_logprobs
                        .push(result.top_logprobs.unwrap_or_default());
                }
            }
            req.update_after_step();
            req.check_finished();
            sampled.push(Some(result.token_id));
        }
        sampled
    }

    // ----- membership -----

    /// Remove finished requests, moving their computed KV into the radix
    /// tree as a reusable prefix and releasing their rows and locks.
    pub fn filter_finished(&mut self) -> Vec<Req> {
        let mut keep = Vec::with_capacity(self.reqs.len());
        for i in 0..self.reqs.len() {
            if self.reqs[i].finished() {
                self.release_finished_req(i);
            } else {
                keep.push(i);
            }
        }
        self.filter_batch(&keep)
    }

    fn release_finished_req(&mut self, idx: usize) {
        let Some(row) = self.reqs[idx].row_id.take() else {
            return;
        };
        let covered = self.seq_lens[idx];
        let all_ids = self.reqs[idx].all_ids();
        debug_assert!(covered <= all_ids.len());
        let row_slots: Vec<SlotId> = self.slot_table.borrow().row_slots(row, covered).to_vec();
        {
            let mut pool = self.token_pool.borrow_mut();
            let mut cache = self.tree_cache.borrow_mut();
            let mut dec = |s: &[SlotId]| pool.dec_ref(s);
            cache.cache_req(
                &all_ids[..covered],
                self.reqs[idx].prefix_slots.len(),
                &row_slots,
                &mut dec,
            );
            cache.dec_lock_ref(self.reqs[idx].last_node);
        }
        self.slot_table.borrow_mut().free_row(row);
        debug!(
            rid = self.reqs[idx].rid,
            prompt_tokens = self.reqs[idx].prompt_tokens(),
            completion_tokens = self.reqs[idx].completion_tokens(),
            "finished request released"
        );
    }

    /// Keep only `keep` (ascending batch indices), rebuilding every
    /// column, and hand back the removed requests in batch order. The
    /// prepared descriptor does not survive a membership change.
    pub fn filter_batch(&mut self, keep: &[usize]) -> Vec<Req> {
        debug_assert!(keep.windows(2).all(|w| w[0] < w[1]));
        if keep.len() == self.reqs.len() {
            return Vec::new();
        }
        let mut keep_mask = vec![false; self.reqs.len()];
        for &i in keep {
            keep_mask[i] = true;
        }
        self.seq_lens = keep.iter().map(|&i| self.seq_lens[i]).collect();
        self.position_offsets = keep.iter().map(|&i| self.position_offsets[i]).collect();
        self.top_logprobs_nums = keep.iter().map(|&i| self.top_logprobs_nums[i]).collect();

        let mut kept = Vec::with_capacity(keep.len());
        let mut removed = Vec::new();
        for (i, req) in std::mem::take(&mut self.reqs).into_iter().enumerate() {
            if keep_mask[i] {
                kept.push(req);
            } else {
                removed.push(req);
            }
        }
        self.reqs = kept;
        self.return_logprob = self.reqs.iter().any(|r| r.return_logprob);
        self.forward_desc = None;
        removed
    }

    /// Append another batch's rows and columns, keeping every column
    /// index-aligned. The prepared descriptor does not survive a
    /// membership change.
    pub fn concat(&mut self, mut other: Batch) {
        self.reqs.append(&mut other.reqs);
        self.seq_lens.append(&mut other.seq_lens);
        self.position_offsets.append(&mut other.position_offsets);
        self.top_logprobs_nums.append(&mut other.top_logprobs_nums);
        self.return_logprob = self.return_logprob || other.return_logprob;
        self.forward_desc = None;
    }

    /// Absorb a freshly admitted batch into the running one. Both must
    /// run over the same shared pool, table and cache.
    pub fn merge(&mut self, other: Batch) {
        debug_assert!(Rc::ptr_eq(&self.token_pool, &other.token_pool));
        debug_assert!(Rc::ptr_eq(&self.slot_table, &other.slot_table));
        debug!(
            absorbed = other.batch_size(),
            running = self.batch_size(),
            "merging admitted batch into the running batch"
        );
        self.concat(other);
    }

    /// Move the requests at `indices` (ascending) into a new batch over
    /// the same shared state.
    pub fn split_off(&mut self, indices: &[usize]) -> Batch {
        debug_assert!(indices.windows(2).all(|w| w[0] < w[1]));
        let take_col = |col: &[usize]| -> Vec<usize> {
            if col.is_empty() {
                Vec::new()
            } else {
                indices.iter().map(|&i| col[i]).collect()
            }
        };
        let seq_lens = take_col(&self.seq_lens);
        let position_offsets = take_col(&self.position_offsets);
        let top_logprobs_nums = take_col(&self.top_logprobs_nums);
        let keep: Vec<usize> = (0..self.reqs.len())
            .filter(|i| indices.binary_search(i).is_err())
            .collect();
        let reqs = self.filter_batch(&keep);
        let return_logprob = reqs.iter().any(|r| r.return_logprob);
        Batch {
            reqs,
            slot_table: Rc::clone(&self.slot_table),
            token_pool: Rc::clone(&self.token_pool),
            tree_cache: Rc::clone(&self.tree_cache),
            backend: Rc::clone(&self.backend),
            seq_lens,
            position_offsets,
            top_logprobs_nums,
            return_logprob,
            forward_desc: None,
        }
    }

    // ----- jump-forward -----

    /// Splice grammar-forced continuations into any constrained request
    /// whose automaton forces more than one byte, then pull the request
    /// out of the batch for re-admission through the extend path. Its
    /// computed KV moves into the tree first, so the re-admission is a
    /// prefix hit.
    pub fn check_for_jump_forward(&mut self) -> Vec<Req> {
        let mut jumped_idx: Vec<usize> = Vec::new();
        for i in 0..self.reqs.len() {
            if self.reqs[i].finished() {
                continue;
            }
            let Some(automaton) = self.reqs[i].automaton.clone() else {
                continue;
            };
            let chain = automaton.forced_byte_chain(self.reqs[i].automaton_state);
            // A single forced byte is left to ordinary decoding; the jump
            // would not save a step.
            if chain.len() <= 1 {
                continue;
            }

            // Continuation bytes at the head belong to a character some
            // sampled token already started. Emit them as byte tokens so
            // the text boundary is whole before retokenizing.
            let mut cur_state = self.reqs[i].automaton_state;
            let mut consumed = 0usize;
            for &(byte, next) in &chain {
                if (0x80..0xC0).contains(&byte) {
                    cur_state = next;
                    consumed += 1;
                } else {
                    break;
                }
            }
            let Some(suffix_ids) = self.byte_token_ids(i, &chain[..consumed]) else {
                continue;
            };

            let covered = self.seq_lens[i];
            let req = &mut self.reqs[i];
            let saved_output = req.output_ids.clone();
            let all_ids = req.all_ids();
            debug_assert_eq!(covered + 1, all_ids.len());
            let cur_all_ids: Vec<u32> = all_ids[..covered].to_vec();

            req.output_ids.extend_from_slice(&suffix_ids);
            // Pending text the cursor has not released yet joins the jump;
            // with nothing pending and no spliced bytes the preview is
            // empty rather than withheld.
            let new_text = match req.preview_decode() {
                Some(text) => text,
                None if suffix_ids.is_empty() => String::new(),
                None => {
                    req.output_ids = saved_output;
                    continue;
                }
            };
            let (symbol_text, next_state) = automaton.forced_symbol_run(cur_state);
            let jump_str = format!("{new_text}{symbol_text}");
            if jump_str.is_empty() {
                req.output_ids = saved_output;
                continue;
            }
            if !req.jump_forward_and_retokenize(&jump_str, next_state) {
                req.output_ids = saved_output;
                continue;
            }

            let Some(row) = req.row_id.take() else {
                continue;
            };
            let prefix_len = req.prefix_slots.len();
            let last_node = req.last_node;
            debug!(rid = req.rid, jump = %jump_str, "jump-forward spliced, requeueing");
            let row_slots: Vec<SlotId> = self.slot_table.borrow().row_slots(row, covered).to_vec();
            {
                let mut pool = self.token_pool.borrow_mut();
                let mut cache = self.tree_cache.borrow_mut();
                let mut dec = |s: &[SlotId]| pool.dec_ref(s);
                cache.cache_req(&cur_all_ids, prefix_len, &row_slots, &mut dec);
                cache.dec_lock_ref(last_node);
            }
            self.slot_table.borrow_mut().free_row(row);
            self.reqs[i].reset_for_requeue();
            jumped_idx.push(i);
        }
        if jumped_idx.is_empty() {
            return Vec::new();
        }
        let keep: Vec<usize> = (0..self.reqs.len())
            .filter(|i| jumped_idx.binary_search(i).is_err())
            .collect();
        self.filter_batch(&keep)
    }

    /// Byte-fallback token per forced continuation byte, or `None` when
    /// the vocabulary cannot spell one of them.
    fn byte_token_ids(&self, idx: usize, bytes: &[(u8, u32)]) -> Option<Vec<u32>> {
        let req = &self.reqs[idx];
        let mut ids = Vec::with_capacity(bytes.len());
        for &(byte, _) in bytes {
            match req.tokenizer.token_for_byte(byte) {
                Some(id) => ids.push(id),
                None => {
                    debug!(rid = req.rid, byte, "no byte token in vocabulary, skipping jump-forward");
                    return None;
                }
            }
        }
        Some(ids)
    }
}
