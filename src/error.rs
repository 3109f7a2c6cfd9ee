//! Error types for the filing index.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our custom error.
pub type Result<T> = std::result::Result<T, FilingIndexError>;

/// Errors that can occur across ingest, storage and retrieval.
#[derive(Error, Debug)]
pub enum FilingIndexError {
    /// Error reading or writing files.
    #[error("I/O error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error during serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The document path does not exist.
    #[error("Document not found at '{0}'")]
    DocumentNotFound(PathBuf),

    /// No stored document with the given id.
    #[error("No document with id '{0}'")]
    UnknownDocument(String),

    /// A document with the same (ticker, fiscal_year, doc_type) already exists.
    #[error("Document for {ticker} {doc_type} {fiscal_year} already exists (doc_id {existing_id}); use force to overwrite")]
    DuplicateDocument {
        ticker: String,
        fiscal_year: i64,
        doc_type: String,
        existing_id: String,
    },

    /// Invalid user input or metadata.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// LLM API transport error (retryable).
    #[error("LLM API error: {0}")]
    LlmApi(String),

    /// LLM rate limit / capacity error (retryable with jitter).
    #[error("LLM capacity error: {0}")]
    LlmCapacity(String),

    /// LLM response did not match the required shape after retries.
    #[error("Failed to parse LLM response: {0}")]
    LlmShape(String),

    /// Embedding service transport error (retryable).
    #[error("Embedding service error: {0}")]
    Embedding(String),

    /// Embedding dimension did not match the configured dimension (fatal).
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    EmbeddingDimension { expected: usize, actual: usize },

    /// HTTP request error.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Durable storage error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Tree structure violated an invariant.
    #[error("Tree structure error: {0}")]
    TreeError(String),
}

impl FilingIndexError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a bounded retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LlmApi(_) | Self::LlmCapacity(_) | Self::Embedding(_) | Self::Http(_)
        )
    }
}

impl From<reqwest::Error> for FilingIndexError {
    fn from(err: reqwest::Error) -> Self {
        FilingIndexError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for FilingIndexError {
    fn from(err: serde_json::Error) -> Self {
        FilingIndexError::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for FilingIndexError {
    fn from(err: rusqlite::Error) -> Self {
        FilingIndexError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FilingIndexError::LlmApi("timeout".into()).is_transient());
        assert!(FilingIndexError::LlmCapacity("429".into()).is_transient());
        assert!(FilingIndexError::Embedding("connection refused".into()).is_transient());
        assert!(!FilingIndexError::LlmShape("bad json".into()).is_transient());
        assert!(!FilingIndexError::Validation("missing ticker".into()).is_transient());
        assert!(!FilingIndexError::EmbeddingDimension {
            expected: 768,
            actual: 384
        }
        .is_transient());
    }

    #[test]
    fn test_duplicate_message_names_key() {
        let err = FilingIndexError::DuplicateDocument {
            ticker: "INFY".into(),
            fiscal_year: 2022,
            doc_type: "20-F".into(),
            existing_id: "abc".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("INFY"));
        assert!(msg.contains("already exists"));
    }
}
