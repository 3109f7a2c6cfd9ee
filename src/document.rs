//! Document representation.
//!
//! Documents are a collection of pages, each with content, a 1-indexed page
//! number and an exact token count. Page boundaries come from the PDF; text
//! fixtures can be split on an explicit delimiter.

use crate::error::{FilingIndexError, Result};
use crate::tokenizer::Tokenizer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A single page in a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    /// 1-indexed page number.
    pub number: usize,
    /// Text content of the page.
    pub content: String,
    /// Exact token count of the content.
    pub token_count: usize,
}

impl Page {
    /// Create a new page, counting tokens with the given tokenizer.
    pub fn new(number: usize, content: String, tokenizer: &Tokenizer) -> Self {
        let token_count = tokenizer.count(&content);
        Self {
            number,
            content,
            token_count,
        }
    }

    /// Format page content with physical index tags for LLM processing.
    pub fn with_index_tags(&self) -> String {
        format!(
            "<physical_index_{}>\n{}\n<physical_index_{}>\n\n",
            self.number, self.content, self.number
        )
    }
}

/// A document consisting of one or more pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Document name/title.
    pub name: String,
    /// Original file path (if loaded from file).
    pub path: Option<PathBuf>,
    /// Pages in the document.
    pub pages: Vec<Page>,
}

impl Document {
    /// Create a new document with given name and pages.
    pub fn new(name: impl Into<String>, pages: Vec<Page>) -> Self {
        Self {
            name: name.into(),
            path: None,
            pages,
        }
    }

    /// Load a PDF as a page-per-page document.
    pub fn from_pdf(path: &Path, tokenizer: &Tokenizer) -> Result<Self> {
        if !path.exists() {
            return Err(FilingIndexError::DocumentNotFound(path.to_path_buf()));
        }

        let raw_pages = pdf_extract::extract_text_by_pages(path).map_err(|e| {
            FilingIndexError::Validation(format!(
                "Could not extract text from PDF '{}': {}",
                path.display(),
                e
            ))
        })?;

        let pages: Vec<Page> = raw_pages
            .into_iter()
            .enumerate()
            .map(|(i, content)| Page::new(i + 1, content, tokenizer))
            .collect();

        if pages.is_empty() {
            return Err(FilingIndexError::Validation(format!(
                "PDF '{}' contains no pages",
                path.display()
            )));
        }

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("untitled")
            .to_string();

        Ok(Self {
            name,
            path: Some(path.to_path_buf()),
            pages,
        })
    }

    /// Build a document from pre-split page texts (used by tests and fixtures).
    pub fn from_page_texts(
        name: impl Into<String>,
        page_texts: Vec<String>,
        tokenizer: &Tokenizer,
    ) -> Self {
        let pages = page_texts
            .into_iter()
            .enumerate()
            .map(|(i, content)| Page::new(i + 1, content, tokenizer))
            .collect();
        Self {
            name: name.into(),
            path: None,
            pages,
        }
    }

    /// Get total number of pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Get total token count across all pages.
    pub fn total_tokens(&self) -> usize {
        self.pages.iter().map(|p| p.token_count).sum()
    }

    /// Get a specific page by number (1-indexed).
    pub fn get_page(&self, number: usize) -> Option<&Page> {
        if number == 0 || number > self.pages.len() {
            None
        } else {
            Some(&self.pages[number - 1])
        }
    }

    /// Token count for an inclusive 1-indexed page range.
    pub fn token_count_range(&self, start: usize, end: usize) -> usize {
        self.pages
            .iter()
            .filter(|p| p.number >= start && p.number <= end)
            .map(|p| p.token_count)
            .sum()
    }

    /// Get content for a range of pages (1-indexed, inclusive) with index tags.
    pub fn content_range_tagged(&self, start: usize, end: usize) -> String {
        self.pages
            .iter()
            .filter(|p| p.number >= start && p.number <= end)
            .map(|p| p.with_index_tags())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Get raw content for a range of pages (1-indexed, inclusive), no tags.
    pub fn content_range(&self, start: usize, end: usize) -> String {
        self.pages
            .iter()
            .filter(|p| p.number >= start && p.number <= end)
            .map(|p| p.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
