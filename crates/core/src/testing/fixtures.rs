use std::cell::RefCell;
use std::rc::Rc;

use crate::config::CoreConfig;
use crate::kv_cache::{RadixCache, ReqSlotTable, TokenSlotPool};
use crate::request::{Req, RequestId};
use crate::sampling::SamplingParams;
use crate::tokenizer::TokenizerWrapper;

/// Fresh shared cache state: slot table, token pool, and radix tree.
pub fn shared_state(
    pool_capacity: usize,
    max_requests: usize,
    max_context_len: usize,
) -> (
    Rc<RefCell<ReqSlotTable>>,
    Rc<RefCell<TokenSlotPool>>,
    Rc<RefCell<RadixCache>>,
) {
    let (table, pool, cache) =
        CoreConfig::new(pool_capacity, max_requests, max_context_len).build_state();
    (
        Rc::new(RefCell::new(table)),
        Rc::new(RefCell::new(pool)),
        Rc::new(RefCell::new(cache)),
    )
}

/// A request over `prompt` with greedy sampling, so scripted logits
/// determine its output exactly.
pub fn make_req(
    rid: RequestId,
    prompt: &str,
    tokenizer: &Rc<TokenizerWrapper>,
    arrival_tick: u64,
) -> Req {
    let ids = tokenizer.encode(prompt).expect("test prompt encodes");
    let eos = tokenizer.token_to_id("</s>").expect("test vocab has </s>");
    let mut req = Req::new(
        rid,
        Some(prompt.to_string()),
        ids,
        Rc::clone(tokenizer),
        eos,
        arrival_tick,
    );
    req.set_sampling_params(SamplingParams::greedy());
    req
}
