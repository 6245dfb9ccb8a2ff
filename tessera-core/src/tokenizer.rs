//! Tokenizer contract and its HuggingFace `tokenizers` implementation.

use std::path::Path;

use anyhow::Result;
use tokenizers::Tokenizer;

/// Text <-> token id conversion as the pipelines need it.
pub trait TextTokenizer: Send + Sync {
    /// Encode text, adding the tokenizer's special tokens.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Encode a sequence pair such as (question, context).
    fn encode_pair(&self, first: &str, second: &str) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32], skip_special: bool) -> Result<String>;

    fn mask_token_id(&self) -> Option<u32>;

    fn eos_token_id(&self) -> Option<u32>;
}

/// Wraps a HuggingFace tokenizer with EOS and mask token tracking.
pub struct TokenizerWrapper {
    inner: Tokenizer,
    eos_token_id: Option<u32>,
    mask_token_id: Option<u32>,
}

impl TokenizerWrapper {
    /// Resolve EOS and mask ids from the vocabulary by their common spellings.
    pub fn new(tokenizer: Tokenizer) -> Self {
        let eos_token_id = ["</s>", "<|endoftext|>", "<|end|>", "<|im_end|>"]
            .iter()
            .find_map(|t| tokenizer.token_to_id(t));
        let mask_token_id = ["[MASK]", "<mask>"]
            .iter()
            .find_map(|t| tokenizer.token_to_id(t));
        Self {
            inner: tokenizer,
            eos_token_id,
            mask_token_id,
        }
    }

    /// Load a tokenizer from a local `tokenizer.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            anyhow::anyhow!("failed to load tokenizer from {}: {e}", path.display())
        })?;
        Ok(Self::new(tokenizer))
    }
}

impl TextTokenizer for TokenizerWrapper {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("tokenizer encode error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn encode_pair(&self, first: &str, second: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode((first, second), true)
            .map_err(|e| anyhow::anyhow!("tokenizer encode error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special)
            .map_err(|e| anyhow::anyhow!("tokenizer decode error: {e}"))
    }

    fn mask_token_id(&self) -> Option<u32> {
        self.mask_token_id
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }
}
