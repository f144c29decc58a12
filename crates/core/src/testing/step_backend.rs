use std::collections::VecDeque;

use anyhow::{bail, ensure};

use crate::forward::{AttentionBackend, ForwardPassDescriptor};

/// A backend whose "model" is a script.
///
/// Each forward step pops one token id per request and returns logits
/// rows peaked on those tokens, so a greedy sampler realizes the script
/// exactly. Requests with an empty span this step get a placeholder
/// empty row, matching what a real backend would skip.
pub struct StepBackend {
    vocab_size: usize,
    script: VecDeque<Vec<u32>>,
    pub extend_calls: usize,
    pub decode_calls: usize,
}

impl StepBackend {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            script: VecDeque::new(),
            extend_calls: 0,
            decode_calls: 0,
        }
    }

    /// Queue the per-request tokens the next step should realize.
    pub fn push_step(&mut self, tokens: Vec<u32>) {
        self.script.push_back(tokens);
    }

    fn rows(&mut self, desc: &ForwardPassDescriptor) -> anyhow::Result<Vec<Vec<f32>>> {
        let Some(tokens) = self.script.pop_front() else {
            bail!("scripted backend ran out of steps");
        };
        ensure!(
            tokens.len() == desc.batch_size,
            "script step has {} tokens for a batch of {}",
            tokens.len(),
            desc.batch_size
        );
        let rows = tokens
            .iter()
            .zip(&desc.extend_seq_lens)
            .map(|(&token, &span)| {
                if span == 0 {
                    return Vec::new();
                }
                let mut row = vec![0.0f32; self.vocab_size];
                row[token as usize] = 10.0;
                row
            })
            .collect();
        Ok(rows)
    }
}

impl AttentionBackend for StepBackend {
    fn extend(&mut self, desc: &ForwardPassDescriptor) -> anyhow::Result<Vec<Vec<f32>>> {
        self.extend_calls += 1;
        self.rows(desc)
    }

    fn decode(&mut self, desc: &ForwardPassDescriptor) -> anyhow::Result<Vec<Vec<f32>>> {
        self.decode_calls += 1;
        self.rows(desc)
    }
}
