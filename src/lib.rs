//! Filing Index - hierarchical tree indexing and hybrid retrieval over
//! financial filings.
//!
//! The library answers natural-language questions over long filings
//! (20-F, 10-K) in two stages:
//! 1. **Ingest**: an LLM converts each PDF into a validated hierarchical tree
//!    of titled, page-ranged sections with summaries and text; node texts are
//!    chunked, embedded and stored in SQLite.
//! 2. **Retrieval**: queries are decomposed into sub-questions, matching
//!    documents are searched with embedding-cosine scoring and LLM tree
//!    reasoning in parallel, and the merged context feeds a cited answer.
//!
//! # Architecture
//!
//! - **Document**: page-based document representation
//! - **Tokenizer**: BPE token counting, the single ruler for all budgets
//! - **LlmClient / EmbeddingClient**: remote service adapters with retries
//! - **TreeBuilder / NodeEnricher**: tree generation and enrichment
//! - **Chunker**: token-bounded overlapping chunks
//! - **Store**: SQLite persistence with cascade deletes
//! - **IngestPipeline**: end-to-end document ingest
//! - **RetrievalOrchestrator**: decompose → search → merge → answer

pub mod api;
pub mod chunker;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod retrieval;
pub mod store;
pub mod tokenizer;
pub mod tree;

// Re-export commonly used types
pub use config::Config;
pub use document::Document;
pub use error::{FilingIndexError, Result};
pub use ingest::{IngestOptions, IngestPipeline, IngestResult};
pub use llm::LlmClient;
pub use retrieval::{Answer, RetrievalOrchestrator};
pub use store::Store;
pub use tokenizer::Tokenizer;
pub use tree::{DocumentTree, Node, TreeBuilder};
