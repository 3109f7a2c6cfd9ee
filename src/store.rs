//! SQLite storage for documents, trees and chunks.
//!
//! One logical transaction per ingest: the tree artefacts, chunks and the
//! final document update land together or not at all. Deleting a document
//! cascades to its tree and chunks.

use crate::embedding::{blob_to_vector, vector_to_blob};
use crate::error::{FilingIndexError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id              TEXT PRIMARY KEY,
    company         TEXT NOT NULL,
    ticker          TEXT NOT NULL,
    fiscal_year     INTEGER NOT NULL,
    doc_type        TEXT NOT NULL DEFAULT '20-F',
    filename        TEXT NOT NULL,
    page_count      INTEGER,
    total_tokens    INTEGER,
    node_count      INTEGER DEFAULT 0,
    chunk_count     INTEGER DEFAULT 0,
    status          TEXT NOT NULL DEFAULT 'processing',
    error_message   TEXT,
    ingest_timestamp TEXT NOT NULL,
    UNIQUE(ticker, fiscal_year, doc_type)
);

CREATE TABLE IF NOT EXISTS trees (
    doc_id          TEXT PRIMARY KEY REFERENCES documents(id) ON DELETE CASCADE,
    tree_json       TEXT NOT NULL,
    tree_no_text    TEXT NOT NULL,
    node_map_json   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id          TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    node_id         TEXT NOT NULL,
    chunk_index     INTEGER NOT NULL,
    content         TEXT NOT NULL,
    token_count     INTEGER NOT NULL,
    start_page      INTEGER,
    end_page        INTEGER,
    embedding       BLOB NOT NULL,
    UNIQUE(doc_id, node_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id);
CREATE INDEX IF NOT EXISTS idx_chunks_node ON chunks(doc_id, node_id);
"#;

/// Document lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    Processing,
    Completed,
    Failed,
}

impl DocStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocStatus::Processing => "processing",
            DocStatus::Completed => "completed",
            DocStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => DocStatus::Completed,
            "failed" => DocStatus::Failed,
            _ => DocStatus::Processing,
        }
    }
}

/// A row in the `documents` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub company: String,
    pub ticker: String,
    pub fiscal_year: i64,
    pub doc_type: String,
    pub filename: String,
    pub page_count: Option<i64>,
    pub total_tokens: Option<i64>,
    pub node_count: i64,
    pub chunk_count: i64,
    pub status: DocStatus,
    pub error_message: Option<String>,
    pub ingest_timestamp: String,
}

/// A chunk ready for persistence.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub node_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub token_count: i64,
    pub start_page: Option<i64>,
    pub end_page: Option<i64>,
    pub embedding: Vec<f32>,
}

/// A chunk embedding loaded for value search.
#[derive(Debug, Clone)]
pub struct ChunkEmbedding {
    pub node_id: String,
    pub content: String,
    pub vector: Vec<f32>,
}

/// The tree artefacts written at the end of a successful ingest.
#[derive(Debug, Clone)]
pub struct TreeArtifacts {
    pub tree_json: Value,
    pub tree_no_text: Value,
    pub node_map_json: Value,
}

/// SQLite-backed store. Writes are serialized behind a mutex; readers share
/// the same connection.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open a file-backed store, creating the schema if absent.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|e| FilingIndexError::io(dir, e))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store (used by tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; propagating the
        // panic is the only sound option.
        self.conn.lock().expect("store mutex poisoned")
    }

    /// Find an existing document id for the unique metadata key.
    pub fn find_by_key(
        &self,
        ticker: &str,
        fiscal_year: i64,
        doc_type: &str,
    ) -> Result<Option<String>> {
        let conn = self.lock();
        let id = conn
            .query_row(
                "SELECT id FROM documents WHERE ticker=?1 AND fiscal_year=?2 AND doc_type=?3",
                params![ticker, fiscal_year, doc_type],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Insert a new document row with `status=processing`.
    pub fn insert_processing(&self, record: &DocumentRecord) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO documents
             (id, company, ticker, fiscal_year, doc_type, filename, status, ingest_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.company,
                record.ticker,
                record.fiscal_year,
                record.doc_type,
                record.filename,
                DocStatus::Processing.as_str(),
                record.ingest_timestamp,
            ],
        )?;
        Ok(())
    }

    /// Write the full ingest result in one transaction and mark the document
    /// completed. Nothing of the document is visible half-written.
    pub fn complete_ingest(
        &self,
        doc_id: &str,
        artifacts: &TreeArtifacts,
        chunks: &[ChunkRecord],
        page_count: i64,
        total_tokens: i64,
        node_count: i64,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO trees (doc_id, tree_json, tree_no_text, node_map_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                doc_id,
                artifacts.tree_json.to_string(),
                artifacts.tree_no_text.to_string(),
                artifacts.node_map_json.to_string(),
            ],
        )?;

        for chunk in chunks {
            tx.execute(
                "INSERT INTO chunks
                 (doc_id, node_id, chunk_index, content, token_count, start_page, end_page, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    doc_id,
                    chunk.node_id,
                    chunk.chunk_index,
                    chunk.content,
                    chunk.token_count,
                    chunk.start_page,
                    chunk.end_page,
                    vector_to_blob(&chunk.embedding),
                ],
            )?;
        }

        tx.execute(
            "UPDATE documents SET
             page_count=?1, total_tokens=?2, node_count=?3, chunk_count=?4, status=?5
             WHERE id=?6",
            params![
                page_count,
                total_tokens,
                node_count,
                chunks.len() as i64,
                DocStatus::Completed.as_str(),
                doc_id,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Mark a document failed, preserving the error message.
    pub fn mark_failed(&self, doc_id: &str, error: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE documents SET status=?1, error_message=?2 WHERE id=?3",
            params![DocStatus::Failed.as_str(), error, doc_id],
        )?;
        Ok(())
    }

    /// Delete a document; tree and chunks cascade. Returns whether a row
    /// existed.
    pub fn delete_document(&self, doc_id: &str) -> Result<bool> {
        let conn = self.lock();
        let affected = conn.execute("DELETE FROM documents WHERE id=?1", params![doc_id])?;
        Ok(affected > 0)
    }

    /// List all documents, ordered by ticker then fiscal year.
    pub fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, company, ticker, fiscal_year, doc_type, filename, page_count,
                    total_tokens, node_count, chunk_count, status, error_message, ingest_timestamp
             FROM documents ORDER BY ticker, fiscal_year",
        )?;
        let rows = stmt.query_map([], row_to_document)?;
        let mut documents = Vec::new();
        for row in rows {
            documents.push(row?);
        }
        Ok(documents)
    }

    /// Fetch one document by id.
    pub fn get_document(&self, doc_id: &str) -> Result<Option<DocumentRecord>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT id, company, ticker, fiscal_year, doc_type, filename, page_count,
                        total_tokens, node_count, chunk_count, status, error_message, ingest_timestamp
                 FROM documents WHERE id=?1",
                params![doc_id],
                row_to_document,
            )
            .optional()?;
        Ok(record)
    }

    /// Load the text-stripped tree used for LLM retrieval prompts.
    pub fn load_tree_no_text(&self, doc_id: &str) -> Result<Option<Value>> {
        self.load_tree_column(doc_id, "tree_no_text")
    }

    /// Load the full tree with text.
    pub fn load_tree_json(&self, doc_id: &str) -> Result<Option<Value>> {
        self.load_tree_column(doc_id, "tree_json")
    }

    /// Load the flat `node_id → node` map.
    pub fn load_node_map(&self, doc_id: &str) -> Result<Option<Value>> {
        self.load_tree_column(doc_id, "node_map_json")
    }

    fn load_tree_column(&self, doc_id: &str, column: &str) -> Result<Option<Value>> {
        let conn = self.lock();
        let sql = format!("SELECT {} FROM trees WHERE doc_id=?1", column);
        let raw: Option<String> = conn
            .query_row(&sql, params![doc_id], |row| row.get(0))
            .optional()?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Load every chunk embedding for a document, in (node_id, chunk_index)
    /// order.
    pub fn load_chunk_embeddings(&self, doc_id: &str) -> Result<Vec<ChunkEmbedding>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT node_id, content, embedding FROM chunks
             WHERE doc_id=?1 ORDER BY node_id, chunk_index",
        )?;
        let rows = stmt.query_map(params![doc_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut chunks = Vec::new();
        for row in rows {
            let (node_id, content, blob) = row?;
            chunks.push(ChunkEmbedding {
                node_id,
                content,
                vector: blob_to_vector(&blob)?,
            });
        }
        Ok(chunks)
    }

    /// Number of chunk rows for a document.
    pub fn chunk_count(&self, doc_id: &str) -> Result<i64> {
        let conn = self.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE doc_id=?1",
            params![doc_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Total number of documents (health endpoint).
    pub fn document_count(&self) -> Result<i64> {
        let conn = self.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentRecord> {
    let status: String = row.get(10)?;
    Ok(DocumentRecord {
        id: row.get(0)?,
        company: row.get(1)?,
        ticker: row.get(2)?,
        fiscal_year: row.get(3)?,
        doc_type: row.get(4)?,
        filename: row.get(5)?,
        page_count: row.get(6)?,
        total_tokens: row.get(7)?,
        node_count: row.get(8)?,
        chunk_count: row.get(9)?,
        status: DocStatus::parse(&status),
        error_message: row.get(11)?,
        ingest_timestamp: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, ticker: &str, year: i64) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            company: "Infosys Ltd".to_string(),
            ticker: ticker.to_string(),
            fiscal_year: year,
            doc_type: "20-F".to_string(),
            filename: format!("{}_20F_{}.pdf", ticker, year),
            page_count: None,
            total_tokens: None,
            node_count: 0,
            chunk_count: 0,
            status: DocStatus::Processing,
            error_message: None,
            ingest_timestamp: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn artifacts() -> TreeArtifacts {
        TreeArtifacts {
            tree_json: json!([{"node_id": "0000", "title": "A", "start_index": 1, "end_index": 2, "text": "body"}]),
            tree_no_text: json!([{"node_id": "0000", "title": "A"}]),
            node_map_json: json!({"0000": {"node_id": "0000", "title": "A", "start_index": 1, "end_index": 2, "text": "body"}}),
        }
    }

    fn chunk(node_id: &str, index: i64) -> ChunkRecord {
        ChunkRecord {
            node_id: node_id.to_string(),
            chunk_index: index,
            content: format!("chunk {}", index),
            token_count: 10,
            start_page: Some(1),
            end_page: Some(2),
            embedding: vec![0.1, 0.2, 0.3],
        }
    }

    #[test]
    fn test_insert_and_get() {
        let store = Store::open_in_memory().unwrap();
        store.insert_processing(&record("d1", "INFY", 2022)).unwrap();

        let fetched = store.get_document("d1").unwrap().unwrap();
        assert_eq!(fetched.ticker, "INFY");
        assert_eq!(fetched.status, DocStatus::Processing);
        assert!(store.get_document("missing").unwrap().is_none());
    }

    #[test]
    fn test_unique_key_lookup() {
        let store = Store::open_in_memory().unwrap();
        store.insert_processing(&record("d1", "INFY", 2022)).unwrap();

        assert_eq!(
            store.find_by_key("INFY", 2022, "20-F").unwrap(),
            Some("d1".to_string())
        );
        assert_eq!(store.find_by_key("INFY", 2023, "20-F").unwrap(), None);
    }

    #[test]
    fn test_duplicate_key_rejected_by_schema() {
        let store = Store::open_in_memory().unwrap();
        store.insert_processing(&record("d1", "INFY", 2022)).unwrap();
        assert!(store.insert_processing(&record("d2", "INFY", 2022)).is_err());
    }

    #[test]
    fn test_complete_ingest_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store.insert_processing(&record("d1", "INFY", 2022)).unwrap();

        let chunks = vec![chunk("0000", 0), chunk("0000", 1)];
        store
            .complete_ingest("d1", &artifacts(), &chunks, 2, 100, 1)
            .unwrap();

        let doc = store.get_document("d1").unwrap().unwrap();
        assert_eq!(doc.status, DocStatus::Completed);
        assert_eq!(doc.page_count, Some(2));
        assert_eq!(doc.node_count, 1);
        assert_eq!(doc.chunk_count, 2);
        assert_eq!(store.chunk_count("d1").unwrap(), 2);

        let tree = store.load_tree_json("d1").unwrap().unwrap();
        assert!(tree.to_string().contains("body"));
        let no_text = store.load_tree_no_text("d1").unwrap().unwrap();
        assert!(!no_text.to_string().contains("body"));

        let embeddings = store.load_chunk_embeddings("d1").unwrap();
        assert_eq!(embeddings.len(), 2);
        assert_eq!(embeddings[0].vector, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_duplicate_chunk_index_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.insert_processing(&record("d1", "INFY", 2022)).unwrap();

        let chunks = vec![chunk("0000", 0), chunk("0000", 0)];
        assert!(store
            .complete_ingest("d1", &artifacts(), &chunks, 2, 100, 1)
            .is_err());
        // The failed transaction left nothing behind.
        assert_eq!(store.chunk_count("d1").unwrap(), 0);
        assert!(store.load_tree_json("d1").unwrap().is_none());
    }

    #[test]
    fn test_mark_failed() {
        let store = Store::open_in_memory().unwrap();
        store.insert_processing(&record("d1", "INFY", 2022)).unwrap();
        store.mark_failed("d1", "tree generation failed").unwrap();

        let doc = store.get_document("d1").unwrap().unwrap();
        assert_eq!(doc.status, DocStatus::Failed);
        assert_eq!(doc.error_message.as_deref(), Some("tree generation failed"));
    }

    #[test]
    fn test_delete_cascades() {
        let store = Store::open_in_memory().unwrap();
        store.insert_processing(&record("d1", "INFY", 2022)).unwrap();
        store
            .complete_ingest("d1", &artifacts(), &[chunk("0000", 0)], 2, 100, 1)
            .unwrap();

        assert!(store.delete_document("d1").unwrap());
        assert!(!store.delete_document("d1").unwrap());
        assert!(store.get_document("d1").unwrap().is_none());
        assert!(store.load_tree_json("d1").unwrap().is_none());
        assert_eq!(store.chunk_count("d1").unwrap(), 0);
    }

    #[test]
    fn test_list_orders_by_ticker_and_year() {
        let store = Store::open_in_memory().unwrap();
        store.insert_processing(&record("d2", "INFY", 2023)).unwrap();
        store.insert_processing(&record("d1", "AAPL", 2022)).unwrap();
        store.insert_processing(&record("d3", "INFY", 2022)).unwrap();

        let docs = store.list_documents().unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d3", "d2"]);
    }
}
