//! Token-aware text chunking for embedding.

use crate::config::ChunkingConfig;
use crate::tokenizer::Tokenizer;
use serde::{Deserialize, Serialize};

/// An embedding-ready fragment of a node's text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextChunk {
    /// Chunk text content.
    pub content: String,
    /// Exact token count of the content.
    pub token_count: usize,
}

/// Splits node text into overlapping token-bounded chunks.
#[derive(Clone)]
pub struct Chunker {
    tokenizer: Tokenizer,
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(tokenizer: Tokenizer, config: ChunkingConfig) -> Self {
        Self { tokenizer, config }
    }

    /// Split `text` into chunks of at most `max_tokens`, overlapping by
    /// `overlap_tokens`. Chunks shorter than `min_tokens` are discarded.
    /// Chunking the same text with the same parameters always yields the
    /// same chunks.
    pub fn chunk(&self, text: &str) -> Vec<TextChunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let max_tokens = self.config.max_tokens.max(1);
        let tokens = self.tokenizer.encode(text);
        let total = tokens.len();

        if total <= max_tokens {
            if total < self.config.min_tokens {
                return Vec::new();
            }
            return vec![TextChunk {
                content: text.trim().to_string(),
                token_count: total,
            }];
        }

        let step = if self.config.overlap_tokens < max_tokens {
            max_tokens - self.config.overlap_tokens
        } else {
            max_tokens
        };

        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < total {
            let end = (start + max_tokens).min(total);
            let window = &tokens[start..end];

            if window.len() >= self.config.min_tokens {
                if let Ok(content) = self.tokenizer.decode(window) {
                    chunks.push(TextChunk {
                        content: content.trim().to_string(),
                        token_count: window.len(),
                    });
                }
            }

            start += step;
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(max_tokens: usize, overlap: usize, min_tokens: usize) -> Chunker {
        Chunker::new(
            Tokenizer::new().unwrap(),
            ChunkingConfig {
                max_tokens,
                overlap_tokens: overlap,
                min_tokens,
            },
        )
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(chunker(512, 64, 32).chunk("   ").is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let c = chunker(512, 64, 1);
        let chunks = c.chunk("Total revenue was $4.2 billion for fiscal 2022.");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].token_count <= 512);
    }

    #[test]
    fn test_below_minimum_discarded() {
        let c = chunker(512, 64, 32);
        assert!(c.chunk("tiny").is_empty());
    }

    #[test]
    fn test_long_text_overlapping_windows() {
        let c = chunker(20, 5, 1);
        let text = "revenue ".repeat(100);
        let chunks = c.chunk(&text);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count <= 20);
        }

        // Step is max - overlap, so consecutive chunks share content.
        let reassembled: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert!(reassembled.matches("revenue").count() > 100);
    }

    #[test]
    fn test_chunking_is_idempotent() {
        let c = chunker(50, 10, 8);
        let text = "Operating income increased due to higher volumes. ".repeat(40);

        let a = c.chunk(&text);
        let b = c.chunk(&text);

        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.content, y.content);
            assert_eq!(x.token_count, y.token_count);
        }
    }

    #[test]
    fn test_short_tail_discarded() {
        let c = chunker(20, 0, 15);
        let text = "alpha beta gamma delta ".repeat(10);
        let chunks = c.chunk(&text);
        for chunk in &chunks {
            assert!(chunk.token_count >= 15);
        }
    }
}
