//! HTTP surface: ingest, query, corpus and health endpoints.

use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::error::FilingIndexError;
use crate::ingest::{IngestOptions, IngestPipeline, IngestResult};
use crate::llm::LlmClient;
use crate::retrieval::{Answer, RetrievalOrchestrator};
use crate::store::Store;
use crate::tokenizer::Tokenizer;
use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub pipeline: Arc<IngestPipeline>,
    pub orchestrator: Arc<RetrievalOrchestrator>,
    pub llm: LlmClient,
    pub embedder: EmbeddingClient,
}

impl AppState {
    pub fn new(config: Arc<Config>, store: Arc<Store>, tokenizer: Tokenizer) -> Self {
        Self {
            pipeline: Arc::new(IngestPipeline::new(
                config.clone(),
                store.clone(),
                tokenizer.clone(),
            )),
            orchestrator: Arc::new(RetrievalOrchestrator::new(
                config.clone(),
                store.clone(),
                tokenizer,
            )),
            llm: LlmClient::new(config.llm.clone()),
            embedder: EmbeddingClient::new(config.embedding.clone()),
            config,
            store,
        }
    }
}

/// Build the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ingest", post(ingest_handler))
        .route("/query", post(query_handler))
        .route("/corpus", get(corpus_handler))
        .route("/corpus/:doc_id", delete(delete_handler))
        .route("/health", get(health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn to_api_error(err: FilingIndexError) -> ApiError {
    let status = match &err {
        FilingIndexError::DuplicateDocument { .. } => StatusCode::CONFLICT,
        FilingIndexError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        FilingIndexError::UnknownDocument(_) | FilingIndexError::DocumentNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Request failed: {}", err);
    }
    (status, Json(json!({"error": err.to_string()})))
}

// ── POST /ingest ─────────────────────────────────────────────────────────────

async fn ingest_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<IngestResult>, ApiError> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename = "upload.pdf".to_string();
    let mut options = IngestOptions::default();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("Malformed multipart body: {}", e)})),
        )
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                if let Some(fname) = field.file_name() {
                    filename = fname.to_string();
                }
                let bytes = field.bytes().await.map_err(|e| {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"error": format!("Failed to read file field: {}", e)})),
                    )
                })?;
                file_bytes = Some(bytes.to_vec());
            }
            "company" => options.company = field.text().await.unwrap_or_default(),
            "ticker" => {
                let text = field.text().await.unwrap_or_default();
                if !text.is_empty() {
                    options.ticker = Some(text);
                }
            }
            "fiscal_year" => {
                options.fiscal_year = field.text().await.ok().and_then(|t| t.parse().ok())
            }
            "doc_type_hint" => {
                let text = field.text().await.unwrap_or_default();
                if !text.is_empty() {
                    options.doc_type = Some(text);
                }
            }
            "force" => {
                let text = field.text().await.unwrap_or_default();
                options.force = matches!(text.to_lowercase().as_str(), "true" | "1" | "yes");
            }
            _ => {}
        }
    }

    let Some(bytes) = file_bytes else {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": "Missing 'file' field"})),
        ));
    };

    // Stage the upload under a unique temp directory so the original
    // filename survives for metadata detection.
    let staging = std::env::temp_dir().join(format!("filing-index-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&staging)
        .map_err(|e| to_api_error(FilingIndexError::io(&staging, e)))?;
    let staged_path = staging.join(sanitize_filename(&filename));
    std::fs::write(&staged_path, &bytes)
        .map_err(|e| to_api_error(FilingIndexError::io(&staged_path, e)))?;

    let result = state.pipeline.ingest_pdf(&staged_path, options).await;
    let _ = std::fs::remove_dir_all(&staging);

    result.map(Json).map_err(to_api_error)
}

/// Keep only the basename and drop path separators from client filenames.
fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("upload.pdf")
        .trim();
    if base.is_empty() {
        "upload.pdf".to_string()
    } else {
        base.to_string()
    }
}

// ── POST /query ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    companies: Vec<String>,
    #[serde(default)]
    years: Vec<i64>,
}

async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<Answer>, ApiError> {
    state
        .orchestrator
        .answer(&request.query, &request.companies, &request.years)
        .await
        .map(Json)
        .map_err(to_api_error)
}

// ── GET /corpus ──────────────────────────────────────────────────────────────

async fn corpus_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let documents = state.store.list_documents().map_err(to_api_error)?;
    Ok(Json(json!({ "documents": documents })))
}

// ── DELETE /corpus/{doc_id} ──────────────────────────────────────────────────

async fn delete_handler(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.store.delete_document(&doc_id).map_err(to_api_error)?;
    if !deleted {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("No document with id '{}'", doc_id)})),
        ));
    }
    Ok(Json(json!({ "deleted": doc_id })))
}

// ── GET /health ──────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let embedding_ok = state.embedder.health().await;
    let llm_ok = state.llm.test_connection().await.is_ok();
    let documents = state.store.document_count().unwrap_or(0);

    Json(json!({
        "status": if embedding_ok && llm_ok { "ok" } else { "degraded" },
        "embedding": embedding_ok,
        "llm": llm_ok,
        "documents": documents,
    }))
}
