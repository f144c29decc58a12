//! Forward-pass descriptors and the attention-backend seam.
//!
//! The scheduler prepares cache state and summarizes one step as a
//! [`ForwardPassDescriptor`]; an [`AttentionBackend`] consumes it and
//! returns one logits row per request. Model weights, attention math,
//! and device placement all live behind the trait.

use serde::Serialize;

use crate::kv_cache::{RowId, SlotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardMode {
    /// Run attention over newly admitted tokens (prompt or spliced text).
    Extend,
    /// Generate one token per request from cached context.
    Decode,
}

/// Where the step's newly computed KV entries land in the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputPlacement {
    /// One slot per new token, in flattened batch order.
    Scattered(Vec<SlotId>),
    /// The contiguous run `[start, end)`, one slot per request.
    Contiguous { start: SlotId, end: SlotId },
}

impl OutputPlacement {
    pub fn len(&self) -> usize {
        match self {
            Self::Scattered(slots) => slots.len(),
            Self::Contiguous { start, end } => end - start,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot receiving the i-th new token.
    pub fn slot(&self, i: usize) -> SlotId {
        match self {
            Self::Scattered(slots) => slots[i],
            Self::Contiguous { start, .. } => start + i,
        }
    }
}

/// Everything a backend needs to run one scheduler step.
///
/// Per-request arrays are index-aligned with the batch; `input_ids` is
/// flattened request-major, with `extend_start_loc[i]` marking where
/// request i's span begins.
#[derive(Debug, Clone)]
pub struct ForwardPassDescriptor {
    pub mode: ForwardMode,
    pub batch_size: usize,
    /// Sum of per-request new-token counts this step.
    pub total_num_tokens: usize,
    /// New input token ids, flattened request-major.
    pub input_ids: Vec<u32>,
    /// Slot-table row per request.
    pub row_ids: Vec<RowId>,
    /// Context length per request once this step's tokens land.
    pub seq_lens: Vec<usize>,
    /// Positions already cached per request (prefix reuse or earlier chunks).
    pub prefix_lens: Vec<usize>,
    /// Sequence position of each flattened input token.
    pub positions: Vec<usize>,
    /// Offset of each request's span within `input_ids`.
    pub extend_start_loc: Vec<usize>,
    /// New-token count per request.
    pub extend_seq_lens: Vec<usize>,
    /// True when no request in the batch reuses a cached prefix.
    pub extend_no_prefix: bool,
    pub placement: OutputPlacement,
}

/// One step of model execution over prepared cache state.
///
/// Returns one logits row per request, for the last position of that
/// request's new-token span. A request whose `extend_seq_lens` entry is
/// zero contributes no tokens this step; its row is a placeholder the
/// scheduler never samples from.
pub trait AttentionBackend {
    fn extend(&mut self, desc: &ForwardPassDescriptor) -> anyhow::Result<Vec<Vec<f32>>>;
    fn decode(&mut self, desc: &ForwardPassDescriptor) -> anyhow::Result<Vec<Vec<f32>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scattered_placement_indexes_its_slots() {
        let placement = OutputPlacement::Scattered(vec![9, 4, 7]);
        assert_eq!(placement.len(), 3);
        assert!(!placement.is_empty());
        assert_eq!(placement.slot(0), 9);
        assert_eq!(placement.slot(2), 7);
    }

    #[test]
    fn contiguous_placement_walks_the_run() {
        let placement = OutputPlacement::Contiguous { start: 10, end: 14 };
        assert_eq!(placement.len(), 4);
        assert_eq!(placement.slot(0), 10);
        assert_eq!(placement.slot(3), 13);
    }

    #[test]
    fn empty_placements() {
        assert!(OutputPlacement::Scattered(Vec::new()).is_empty());
        assert!(OutputPlacement::Contiguous { start: 5, end: 5 }.is_empty());
    }

    #[test]
    fn forward_mode_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(ForwardMode::Extend).unwrap(),
            serde_json::json!("extend")
        );
        assert_eq!(
            serde_json::to_value(ForwardMode::Decode).unwrap(),
            serde_json::json!("decode")
        );
    }
}
