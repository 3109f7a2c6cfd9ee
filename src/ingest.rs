//! Ingest pipeline: PDF → tree → enrichment → chunks → embeddings → storage.
//!
//! The pipeline owns the document lifecycle: a `processing` row is created up
//! front, every artefact is written in one transaction at the end, and any
//! failure leaves the row marked `failed` with its error message.

use crate::chunker::Chunker;
use crate::config::Config;
use crate::document::Document;
use crate::embedding::EmbeddingClient;
use crate::error::{FilingIndexError, Result};
use crate::llm::LlmClient;
use crate::store::{ChunkRecord, DocStatus, DocumentRecord, Store, TreeArtifacts};
use crate::tokenizer::Tokenizer;
use crate::tree::{
    flatten, node_map, strip_fields, DocumentTree, NodeEnricher, TreeBuilder, NO_TEXT_FIELDS,
};
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Metadata extracted from a filename like `INFY_20F_2022.pdf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMetadata {
    pub ticker: String,
    pub doc_type: String,
    pub fiscal_year: i64,
}

/// Try to extract metadata from a `TICKER_DOCTYPE_YEAR.pdf` filename.
pub fn parse_filename(filename: &str) -> Option<ParsedMetadata> {
    let re = Regex::new(r"(?i)^([A-Za-z0-9]+)_([A-Za-z0-9-]+)_(\d{4})\.pdf$").ok()?;
    let basename = Path::new(filename).file_name()?.to_str()?;
    let caps = re.captures(basename)?;

    Some(ParsedMetadata {
        ticker: caps[1].to_uppercase(),
        doc_type: normalize_doc_type(&caps[2]),
        fiscal_year: caps[3].parse().ok()?,
    })
}

/// Map short doc-type tokens to normalized forms.
fn normalize_doc_type(raw: &str) -> String {
    match raw.to_lowercase().as_str() {
        "20f" | "20-f" => "20-F".to_string(),
        "10k" | "10-k" => "10-K".to_string(),
        other => other.to_uppercase(),
    }
}

/// Caller-supplied ingest parameters.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub company: String,
    pub ticker: Option<String>,
    pub fiscal_year: Option<i64>,
    pub doc_type: Option<String>,
    pub force: bool,
}

/// Outcome of a successful ingest.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestResult {
    pub doc_id: String,
    pub status: DocStatus,
    pub chunks_created: usize,
    pub node_count: usize,
    pub page_count: usize,
}

/// Sequences the full ingest flow for one document at a time.
pub struct IngestPipeline {
    config: Arc<Config>,
    store: Arc<Store>,
    builder: TreeBuilder,
    enricher: NodeEnricher,
    chunker: Chunker,
    embedder: EmbeddingClient,
    tokenizer: Tokenizer,
}

impl IngestPipeline {
    pub fn new(config: Arc<Config>, store: Arc<Store>, tokenizer: Tokenizer) -> Self {
        let llm = LlmClient::new(config.llm.clone());
        Self {
            builder: TreeBuilder::new(llm.clone(), config.tree.clone()),
            enricher: NodeEnricher::new(llm, tokenizer.clone()),
            chunker: Chunker::new(tokenizer.clone(), config.chunking.clone()),
            embedder: EmbeddingClient::new(config.embedding.clone()),
            tokenizer,
            config,
            store,
        }
    }

    /// Ingest one PDF. Duplicate `(ticker, fiscal_year, doc_type)` keys are
    /// rejected unless `force` is set, in which case the prior document is
    /// deleted first (tree and chunks cascade).
    pub async fn ingest_pdf(&self, pdf_path: &Path, options: IngestOptions) -> Result<IngestResult> {
        let basename = pdf_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("upload.pdf")
            .to_string();

        // 1. Resolve metadata, falling back to the filename convention.
        let parsed = parse_filename(&basename);
        let ticker = options
            .ticker
            .clone()
            .or_else(|| parsed.as_ref().map(|p| p.ticker.clone()))
            .map(|t| t.to_uppercase())
            .ok_or_else(|| {
                FilingIndexError::Validation(
                    "Could not determine ticker from filename or arguments.".to_string(),
                )
            })?;
        let fiscal_year = options
            .fiscal_year
            .or_else(|| parsed.as_ref().map(|p| p.fiscal_year))
            .ok_or_else(|| {
                FilingIndexError::Validation(
                    "Could not determine fiscal year from filename or arguments.".to_string(),
                )
            })?;
        let doc_type = options
            .doc_type
            .clone()
            .map(|d| normalize_doc_type(&d))
            .or_else(|| parsed.as_ref().map(|p| p.doc_type.clone()))
            .unwrap_or_else(|| "20-F".to_string());

        if options.company.trim().is_empty() {
            return Err(FilingIndexError::Validation(
                "Company name is required.".to_string(),
            ));
        }

        // 2. Duplicate handling.
        if let Some(existing_id) = self.store.find_by_key(&ticker, fiscal_year, &doc_type)? {
            if !options.force {
                return Err(FilingIndexError::DuplicateDocument {
                    ticker,
                    fiscal_year,
                    doc_type,
                    existing_id,
                });
            }
            info!("Force re-ingest: deleting existing document {}", existing_id);
            self.store.delete_document(&existing_id)?;
        }

        // 3. Copy the PDF into the upload dir and create the processing row.
        let doc_id = Uuid::new_v4().to_string();
        let upload_dir = &self.config.storage.upload_dir;
        std::fs::create_dir_all(upload_dir).map_err(|e| FilingIndexError::io(upload_dir, e))?;
        let dest_path = upload_dir.join(format!("{}.pdf", doc_id));
        std::fs::copy(pdf_path, &dest_path).map_err(|e| FilingIndexError::io(pdf_path, e))?;

        let record = DocumentRecord {
            id: doc_id.clone(),
            company: options.company.clone(),
            ticker,
            fiscal_year,
            doc_type,
            filename: basename.clone(),
            page_count: None,
            total_tokens: None,
            node_count: 0,
            chunk_count: 0,
            status: DocStatus::Processing,
            error_message: None,
            ingest_timestamp: chrono::Utc::now().to_rfc3339(),
        };
        self.store.insert_processing(&record)?;

        // 4. Run the heavy phases; any failure marks the document failed.
        match self.process(&doc_id, &dest_path, &basename).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!("Ingest failed for {}: {}", basename, e);
                self.store.mark_failed(&doc_id, &e.to_string())?;
                Err(e)
            }
        }
    }

    /// Tree build, enrichment, chunking, embedding and the final write.
    async fn process(&self, doc_id: &str, pdf_path: &Path, basename: &str) -> Result<IngestResult> {
        info!("Extracting text from {}", basename);
        let document = Document::from_pdf(pdf_path, &self.tokenizer)?;

        info!(
            "Building tree for {} ({} pages, ~{} tokens)",
            basename,
            document.page_count(),
            document.total_tokens()
        );
        let mut roots = self.builder.build(&document).await?;

        info!("Enriching {} nodes", roots.iter().map(|n| n.node_count()).sum::<usize>());
        self.enricher.attach_text(&mut roots, &document);
        self.enricher.summarize(&mut roots).await?;

        let mut tree = DocumentTree::new(basename, roots, document.page_count());
        tree.description = self.enricher.describe_document(&tree.nodes).await;
        if let Some(description) = &tree.description {
            info!("Document description for {}: {}", basename, description);
        }

        // Derived structures.
        let tree_json = tree.to_value()?;
        let tree_no_text = strip_fields(&tree_json, NO_TEXT_FIELDS);
        let map = node_map(&tree.nodes);
        let node_map_json = serde_json::to_value(&map)?;

        let flat = flatten(&tree.nodes);
        let node_count = flat.len();
        let total_tokens: usize = flat
            .iter()
            .filter_map(|n| n.text.as_deref())
            .map(|t| self.tokenizer.count(t))
            .sum();

        // Chunk node texts.
        info!("Chunking {} nodes", node_count);
        let mut chunks: Vec<ChunkRecord> = Vec::new();
        for node in &flat {
            let Some(text) = node.text.as_deref() else {
                continue;
            };
            let Some(node_id) = node.node_id.clone() else {
                continue;
            };
            for (index, chunk) in self.chunker.chunk(text).into_iter().enumerate() {
                chunks.push(ChunkRecord {
                    node_id: node_id.clone(),
                    chunk_index: index as i64,
                    content: chunk.content,
                    token_count: chunk.token_count as i64,
                    start_page: Some(node.start_index as i64),
                    end_page: Some(node.end_index as i64),
                    embedding: Vec::new(),
                });
            }
        }

        // Embed chunk contents in batches.
        info!("Embedding {} chunks", chunks.len());
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        for (chunk, vector) in chunks.iter_mut().zip(vectors) {
            chunk.embedding = vector;
        }

        // 5. Single logical write.
        info!("Writing {} to storage", doc_id);
        let artifacts = TreeArtifacts {
            tree_json,
            tree_no_text,
            node_map_json,
        };
        self.store.complete_ingest(
            doc_id,
            &artifacts,
            &chunks,
            document.page_count() as i64,
            total_tokens as i64,
            node_count as i64,
        )?;

        info!("Ingest complete: {} → {}", basename, doc_id);
        Ok(IngestResult {
            doc_id: doc_id.to_string(),
            status: DocStatus::Completed,
            chunks_created: chunks.len(),
            node_count,
            page_count: document.page_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;

    /// Pipeline wired to unreachable remote services and a tempdir upload
    /// location; only paths that fail before any remote call are exercised.
    fn test_pipeline(store: Arc<Store>, workdir: &Path) -> IngestPipeline {
        let mut config = Config::default();
        config.llm = LlmConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            api_key: "test".to_string(),
            model: "test".to_string(),
            retries: 1,
            timeout_secs: 2,
            ..Default::default()
        };
        config.embedding.url = "http://127.0.0.1:1".to_string();
        config.storage.database_path = workdir.join("filing_index.db");
        config.storage.upload_dir = workdir.join("uploads");
        IngestPipeline::new(Arc::new(config), store, Tokenizer::new().unwrap())
    }

    fn prior_record(id: &str) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            company: "Infosys Ltd".to_string(),
            ticker: "INFY".to_string(),
            fiscal_year: 2022,
            doc_type: "20-F".to_string(),
            filename: "INFY_20F_2022.pdf".to_string(),
            page_count: None,
            total_tokens: None,
            node_count: 0,
            chunk_count: 0,
            status: DocStatus::Processing,
            error_message: None,
            ingest_timestamp: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_without_force_returns_existing_id() {
        let dir = tempfile::tempdir().unwrap();
        let pdf_path = dir.path().join("INFY_20F_2022.pdf");
        std::fs::write(&pdf_path, b"%PDF stub").unwrap();

        let store = Arc::new(Store::open_in_memory().unwrap());
        store.insert_processing(&prior_record("prior-id")).unwrap();

        let pipeline = test_pipeline(store.clone(), dir.path());
        let err = pipeline
            .ingest_pdf(
                &pdf_path,
                IngestOptions {
                    company: "Infosys Ltd".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        match err {
            FilingIndexError::DuplicateDocument { existing_id, .. } => {
                assert_eq!(existing_id, "prior-id");
            }
            other => panic!("expected duplicate error, got {}", other),
        }

        // Rejection left the corpus untouched: no new row, no upload copy.
        assert_eq!(store.list_documents().unwrap().len(), 1);
        assert!(store.get_document("prior-id").unwrap().is_some());
        assert!(!dir.path().join("uploads").exists());
    }

    #[tokio::test]
    async fn test_force_reingest_replaces_prior_document() {
        let dir = tempfile::tempdir().unwrap();
        let pdf_path = dir.path().join("INFY_20F_2022.pdf");
        std::fs::write(&pdf_path, b"%PDF stub").unwrap();

        let store = Arc::new(Store::open_in_memory().unwrap());
        store.insert_processing(&prior_record("prior-id")).unwrap();

        let pipeline = test_pipeline(store.clone(), dir.path());
        let result = pipeline
            .ingest_pdf(
                &pdf_path,
                IngestOptions {
                    company: "Infosys Ltd".to_string(),
                    force: true,
                    ..Default::default()
                },
            )
            .await;

        // The stub PDF cannot be parsed, so processing fails after the force
        // path already deleted the prior row and staged the new document.
        assert!(result.is_err());
        assert!(store.get_document("prior-id").unwrap().is_none());

        let docs = store.list_documents().unwrap();
        assert_eq!(docs.len(), 1);
        let new_doc = &docs[0];
        assert_ne!(new_doc.id, "prior-id");
        assert_eq!(new_doc.ticker, "INFY");
        assert_eq!(new_doc.status, DocStatus::Failed);
        assert!(new_doc.error_message.is_some());

        // The upload copy landed under the new doc id.
        let uploaded = dir.path().join("uploads").join(format!("{}.pdf", new_doc.id));
        assert!(uploaded.exists());
    }

    #[tokio::test]
    async fn test_missing_metadata_fails_before_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let pdf_path = dir.path().join("annual_report.pdf");
        std::fs::write(&pdf_path, b"%PDF stub").unwrap();

        let store = Arc::new(Store::open_in_memory().unwrap());
        let pipeline = test_pipeline(store.clone(), dir.path());

        let err = pipeline
            .ingest_pdf(
                &pdf_path,
                IngestOptions {
                    company: "Unknown Co".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FilingIndexError::Validation(_)));
        assert!(store.list_documents().unwrap().is_empty());
        assert!(!dir.path().join("uploads").exists());
    }

    #[test]
    fn test_parse_filename_standard() {
        let parsed = parse_filename("INFY_20F_2022.pdf").unwrap();
        assert_eq!(parsed.ticker, "INFY");
        assert_eq!(parsed.doc_type, "20-F");
        assert_eq!(parsed.fiscal_year, 2022);
    }

    #[test]
    fn test_parse_filename_case_and_path() {
        let parsed = parse_filename("/tmp/uploads/aapl_10k_2023.PDF").unwrap();
        assert_eq!(parsed.ticker, "AAPL");
        assert_eq!(parsed.doc_type, "10-K");
        assert_eq!(parsed.fiscal_year, 2023);
    }

    #[test]
    fn test_parse_filename_rejects_non_matching() {
        assert!(parse_filename("annual_report.pdf").is_none());
        assert!(parse_filename("INFY_20F_22.pdf").is_none());
        assert!(parse_filename("INFY_20F_2022.txt").is_none());
    }

    #[test]
    fn test_normalize_doc_type() {
        assert_eq!(normalize_doc_type("20f"), "20-F");
        assert_eq!(normalize_doc_type("10-K"), "10-K");
        assert_eq!(normalize_doc_type("def14a"), "DEF14A");
    }
}
