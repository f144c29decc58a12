//! Packed allowed-token masks.
//!
//! One row per batch slot, each row `vocab_size.div_ceil(32)` i32 words.
//! Bit set = token allowed. Masking a logits row costs O(vocab/32) words
//! instead of O(vocab) individual tests.

/// Batched allowed-token bitmask.
///
/// Rows are index-aligned with the batch that fills them; a row is only
/// meaningful for requests under an active constraint, other rows are
/// simply never applied.
#[derive(Debug, Clone)]
pub struct PackedBitmask {
    /// Row-major packed words: `[rows][words_per_row]`.
    words: Vec<i32>,
    words_per_row: usize,
    rows: usize,
    vocab_size: usize,
}

impl PackedBitmask {
    /// Create a mask with every bit cleared (no token allowed).
    pub fn new(rows: usize, vocab_size: usize) -> Self {
        let words_per_row = vocab_size.div_ceil(32);
        Self {
            words: vec![0i32; rows * words_per_row],
            words_per_row,
            rows,
            vocab_size,
        }
    }

    /// Clear every row.
    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Clear a single row.
    pub fn clear_row(&mut self, row: usize) {
        let start = row * self.words_per_row;
        self.words[start..start + self.words_per_row].fill(0);
    }

    /// Mark one token as allowed in the given row.
    #[inline]
    pub fn allow(&mut self, row: usize, token_id: usize) {
        debug_assert!(row < self.rows);
        debug_assert!(token_id < self.vocab_size);
        let word = row * self.words_per_row + token_id / 32;
        self.words[word] |= 1i32 << (token_id % 32);
    }

    #[inline]
    pub fn is_allowed(&self, row: usize, token_id: usize) -> bool {
        debug_assert!(row < self.rows);
        debug_assert!(token_id < self.vocab_size);
        let word = row * self.words_per_row + token_id / 32;
        (self.words[word] >> (token_id % 32)) & 1 != 0
    }

    /// Overwrite a row with a precomputed packed row.
    pub fn load_row(&mut self, row: usize, src: &[i32]) {
        debug_assert!(row < self.rows);
        debug_assert!(src.len() >= self.words_per_row);
        let start = row * self.words_per_row;
        self.words[start..start + self.words_per_row].copy_from_slice(&src[..self.words_per_row]);
    }

    /// Force disallowed tokens in `logits` to `-inf`, leaving allowed ones
    /// untouched. Whole words of 1s are skipped and whole words of 0s are
    /// masked without per-bit tests.
    pub fn apply_to_logits(&self, logits: &mut [f32], row: usize) {
        debug_assert!(row < self.rows);
        let start = row * self.words_per_row;
        let row_words = &self.words[start..start + self.words_per_row];

        for (chunk, &word) in logits.chunks_mut(32).zip(row_words) {
            if word == !0i32 {
                continue;
            }
            if word == 0 {
                for logit in chunk {
                    *logit = f32::NEG_INFINITY;
                }
                continue;
            }
            for (bit, logit) in chunk.iter_mut().enumerate() {
                if (word >> bit) & 1 == 0 {
                    *logit = f32::NEG_INFINITY;
                }
            }
        }
    }

    pub fn words_per_row(&self) -> usize {
        self.words_per_row
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}
