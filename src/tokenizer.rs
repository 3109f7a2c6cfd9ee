//! Byte-pair tokenizer adapter.
//!
//! Wraps the `cl100k_base` encoding and is the sole ruler for every token
//! budget in the crate: chunk sizes, prompt windows, node budgets and the
//! retrieval context budget all measure tokens through this adapter.

use crate::error::{FilingIndexError, Result};
use std::sync::Arc;
use tiktoken_rs::CoreBPE;

/// Deterministic BPE tokenizer, cheap to clone and share across tasks.
#[derive(Clone)]
pub struct Tokenizer {
    bpe: Arc<CoreBPE>,
}

impl Tokenizer {
    /// Create a tokenizer over the `cl100k_base` encoding.
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| FilingIndexError::Config(format!("Failed to load tokenizer: {}", e)))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }

    /// Count tokens in `text`.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Encode `text` into token ids.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_with_special_tokens(text)
    }

    /// Decode token ids back into text.
    ///
    /// Token slices produced by `encode` always decode; a slice cut at an
    /// arbitrary byte boundary may not, hence the fallible signature.
    pub fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.bpe
            .decode(tokens.to_vec())
            .map_err(|e| FilingIndexError::Serialization(format!("Token decode failed: {}", e)))
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("encoding", &"cl100k_base")
            .finish()
    }
}
