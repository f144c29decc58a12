use std::path::Path;
use tokenizers::Tokenizer;

pub struct TokenizerWrapper {
    inner: Tokenizer,
}

impl TokenizerWrapper {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let inner =
            Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("tokenizer load: {e}"))?;
        Ok(Self { inner })
    }

    /// In-memory tokenizer with byte fallback, for tests.
    ///
    /// Vocab layout: `<unk>`, `<s>`, `</s>` (ids 0..=2), the 256 byte pieces
    /// `<0x00>`..`<0xFF>` (ids 3..=258), then `words` in order. Segmentation
    /// prefers the fewest pieces, so multi-character words win over their
    /// spellings and anything not covered falls back to byte pieces.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_testing(words: &[&str]) -> Self {
        use tokenizers::decoders::byte_fallback::ByteFallback;
        use tokenizers::models::unigram::Unigram;

        let mut vocab: Vec<(String, f64)> = vec![
            ("<unk>".to_string(), -100.0),
            ("<s>".to_string(), -100.0),
            ("</s>".to_string(), -100.0),
        ];
        for b in 0..=255u8 {
            vocab.push((format!("<0x{b:02X}>"), -10.0));
        }
        for w in words {
            vocab.push(((*w).to_string(), -1.0));
        }
        let model = Unigram::from(vocab, Some(0), true).expect("build test tokenizer model");
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_decoder(Some(ByteFallback::new()));
        // Reuses the model's ids; decode with skip_special_tokens drops these.
        tokenizer.add_special_tokens(&[
            tokenizers::AddedToken::from("<unk>", true),
            tokenizers::AddedToken::from("<s>", true),
            tokenizers::AddedToken::from("</s>", true),
        ]);
        Self { inner: tokenizer }
    }

    pub fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("encode: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32]) -> anyhow::Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| anyhow::anyhow!("decode: {e}"))
    }

    /// Vocabulary entry for a raw byte (`<0xXX>`, uppercase hex), if the
    /// vocabulary carries byte-level pieces.
    pub fn token_for_byte(&self, byte: u8) -> Option<u32> {
        self.inner.token_to_id(&format!("<0x{byte:02X}>"))
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    pub fn id_to_token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}
