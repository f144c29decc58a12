//! Token-id to byte-sequence mapping for automaton walks.
//!
//! Built once per tokenizer and shared across compiled automata via
//! `Arc`. Byte-fallback pieces (`<0xNN>`) map to their raw byte rather
//! than to whatever replacement text a lone continuation byte would
//! decode to, so automata can walk token bytes exactly.

use std::sync::Arc;

use crate::tokenizer::TokenizerWrapper;

/// Byte representation of every token in a vocabulary.
#[derive(Debug, Clone)]
pub struct VocabularyIndex {
    /// `token_bytes[id]` is the byte sequence the token contributes to
    /// the output stream. Empty for special tokens and undecodable ids.
    token_bytes: Vec<Vec<u8>>,
    vocab_size: usize,
}

impl VocabularyIndex {
    pub fn from_tokenizer(tokenizer: &TokenizerWrapper) -> Self {
        let vocab_size = tokenizer.vocab_size();
        let mut token_bytes = Vec::with_capacity(vocab_size);

        for id in 0..vocab_size as u32 {
            let bytes = match tokenizer.id_to_token(id) {
                Some(piece) => match byte_piece_value(&piece) {
                    Some(byte) => vec![byte],
                    None => tokenizer
                        .decode(&[id])
                        .map(String::into_bytes)
                        .unwrap_or_default(),
                },
                None => Vec::new(),
            };
            token_bytes.push(bytes);
        }

        Self {
            token_bytes,
            vocab_size,
        }
    }

    /// Byte sequence for a token id; empty for out-of-range ids.
    #[inline]
    pub fn token_bytes(&self, token_id: u32) -> &[u8] {
        self.token_bytes
            .get(token_id as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    #[inline]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Iterate over all `(token_id, bytes)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.token_bytes
            .iter()
            .enumerate()
            .map(|(id, bytes)| (id as u32, bytes.as_slice()))
    }

    /// Shared index for handing to multiple automata.
    pub fn shared(tokenizer: &TokenizerWrapper) -> Arc<Self> {
        Arc::new(Self::from_tokenizer(tokenizer))
    }
}

/// Parse a byte-fallback piece like `<0x0A>` into its byte value.
fn byte_piece_value(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}
