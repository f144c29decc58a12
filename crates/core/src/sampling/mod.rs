//! Per-request token sampling.
//!
//! Logits arrive one row per request. A row is scaled by temperature,
//! penalized, biased, converted to probabilities, filtered jointly by
//! top-p and top-k, renormalized, and drawn from with the request's own
//! seeded RNG. Constrained requests have their rows masked by the
//! decoding automaton before any of this runs.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Temperatures below this are treated as greedy.
pub const SAMPLING_EPS: f32 = 1e-6;

/// Per-request sampling configuration.
///
/// `normalize` must run once before the request is scheduled; it folds
/// greedy decoding into the regular pipeline as a top-1 filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Logit scale. Values under `SAMPLING_EPS` mean greedy.
    pub temperature: f32,
    /// Nucleus threshold in (0, 1]. 1.0 disables the filter.
    pub top_p: f32,
    /// Keep only the `top_k` most likely tokens. 0 disables the filter.
    pub top_k: usize,
    /// Subtracted per occurrence of a token in the output so far.
    pub frequency_penalty: f32,
    /// Subtracted once for any token present in the output so far.
    pub presence_penalty: f32,
    /// Added to logits after temperature scaling.
    pub logit_bias: Option<Vec<(u32, f32)>>,
    /// Decoded-text stop sequences.
    pub stop_strs: Vec<String>,
    /// Token ids that finish the request when sampled.
    pub stop_token_ids: Vec<u32>,
    pub max_new_tokens: usize,
    /// Keep generating past the end-of-sequence token.
    pub ignore_eos: bool,
    /// Seed for the request's RNG; entropy-seeded when absent.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            logit_bias: None,
            stop_strs: Vec::new(),
            stop_token_ids: Vec::new(),
            max_new_tokens: 16,
            ignore_eos: false,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    /// Rewrite greedy settings as ordinary sampling over a top-1 filter,
    /// so the sampler needs no argmax special case.
    pub fn normalize(&mut self) {
        if self.temperature < SAMPLING_EPS {
            self.temperature = 1.0;
            self.top_k = 1;
        }
    }

    /// Longest stop string in characters; bounds how many trailing
    /// tokens a finish check needs to decode.
    pub fn stop_str_max_len(&self) -> usize {
        self.stop_strs
            .iter()
            .map(|s| s.chars().count())
            .max()
            .unwrap_or(0)
    }
}

/// Per-request RNG.
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

impl std::fmt::Debug for SamplerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplerState").finish_non_exhaustive()
    }
}

/// One sampled token with optional logprob detail.
#[derive(Debug, Clone)]
pub struct SamplingResult {
    pub token_id: u32,
    /// Log probability of the sampled token under the full (pre-filter)
    /// distribution; `NEG_INFINITY` when logprobs were not requested.
    pub logprob: f32,
    pub top_logprobs: Option<Vec<(u32, f32)>>,
}

/// Sample one token from a logits row.
///
/// The row is mutated in place. Any constraint mask is expected to have
/// been applied already; `-inf` entries survive every later step.
/// `top_logprobs_num` of `Some(k)` also computes the chosen token's
/// logprob and the k best alternatives.
pub fn sample_row(
    logits: &mut [f32],
    params: &SamplingParams,
    output_ids: &[u32],
    state: &mut SamplerState,
    top_logprobs_num: Option<usize>,
) -> SamplingResult {
    if params.temperature != 1.0 {
        let inv_temp = 1.0 / params.temperature;
        for logit in logits.iter_mut() {
            *logit *= inv_temp;
        }
    }

    if params.frequency_penalty != 0.0 || params.presence_penalty != 0.0 {
        apply_frequency_presence_penalty(
            logits,
            output_ids,
            params.frequency_penalty,
            params.presence_penalty,
        );
    }

    if let Some(bias) = &params.logit_bias {
        apply_logit_bias(logits, bias);
    }

    let log_probs = top_logprobs_num.map(|_| log_softmax(logits));

    let mut probs = softmax(logits);
    let top_k = if params.top_k == 0 {
        usize::MAX
    } else {
        params.top_k
    };
    top_p_top_k(&mut probs, params.top_p, top_k);

    let total: f32 = probs.iter().sum();
    let token_id = if total > 0.0 {
        weighted_draw(&probs, total, &mut state.rng)
    } else {
        // Nothing survived the filters; fall back to the raw argmax.
        argmax(logits)
    };

    let (logprob, top_logprobs) = match (&log_probs, top_logprobs_num) {
        (Some(lp), Some(k)) => (lp[token_id as usize], Some(extract_top_logprobs(lp, k))),
        _ => (f32::NEG_INFINITY, None),
    };

    SamplingResult {
        token_id,
        logprob,
        top_logprobs,
    }
}

/// Subtract `frequency_penalty * count + presence_penalty` from every
/// token that already occurs in the output.
pub(crate) fn apply_frequency_presence_penalty(
    logits: &mut [f32],
    output_ids: &[u32],
    frequency_penalty: f32,
    presence_penalty: f32,
) {
    let mut counts = ahash::AHashMap::new();
    for &token_id in output_ids {
        *counts.entry(token_id).or_insert(0u32) += 1;
    }

    for (&token_id, &count) in &counts {
        let idx = token_id as usize;
        if idx < logits.len() {
            logits[idx] -= frequency_penalty * count as f32 + presence_penalty;
        }
    }
}

pub(crate) fn apply_logit_bias(logits: &mut [f32], bias: &[(u32, f32)]) {
    for &(token_id, value) in bias {
        let idx = token_id as usize;
        if idx < logits.len() {
            logits[idx] += value;
        }
    }
}

/// Joint nucleus and top-k filter over a probability row.
///
/// In descending probability order, a token is zeroed once the mass
/// strictly before it exceeds `top_p`, or its rank reaches `top_k`.
/// The most likely token always survives.
pub(crate) fn top_p_top_k(probs: &mut [f32], top_p: f32, top_k: usize) {
    if top_p >= 1.0 && top_k >= probs.len() {
        return;
    }

    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_unstable_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut mass_before = 0.0f32;
    for (rank, &idx) in order.iter().enumerate() {
        let p = probs[idx];
        if rank >= top_k || mass_before > top_p {
            probs[idx] = 0.0;
        }
        mass_before += p;
    }
}

pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max_logit == f32::NEG_INFINITY {
        return vec![0.0; logits.len()];
    }
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }
    probs
}

/// Numerically stable `x_i - max(x) - ln(sum(exp(x_j - max(x))))`.
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max_logit == f32::NEG_INFINITY {
        return vec![f32::NEG_INFINITY; logits.len()];
    }
    let exp_sum_ln = logits
        .iter()
        .map(|&x| (x - max_logit).exp())
        .sum::<f32>()
        .ln();
    logits.iter().map(|&x| x - max_logit - exp_sum_ln).collect()
}

fn extract_top_logprobs(log_probs: &[f32], k: usize) -> Vec<(u32, f32)> {
    if k == 0 {
        return Vec::new();
    }
    let mut indexed: Vec<(u32, f32)> = log_probs
        .iter()
        .enumerate()
        .map(|(i, &lp)| (i as u32, lp))
        .collect();
    indexed.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(k);
    indexed
}

fn argmax(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

fn weighted_draw(probs: &[f32], total: f32, rng: &mut StdRng) -> u32 {
    let r: f32 = rng.gen::<f32>() * total;
    let mut cumsum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i as u32;
        }
    }
    // Accumulation error can land just past the last positive entry.
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .unwrap_or(probs.len().saturating_sub(1)) as u32
}
