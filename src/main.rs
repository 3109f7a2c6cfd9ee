//! Filing Index CLI
//!
//! Ingest financial filings, query the corpus, and serve the HTTP API.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use filing_index::{
    api::{create_router, AppState},
    config::Config,
    embedding::EmbeddingClient,
    ingest::{IngestOptions, IngestPipeline},
    llm::LlmClient,
    retrieval::RetrievalOrchestrator,
    store::Store,
    tokenizer::Tokenizer,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Filing Index - LLM tree indexing and hybrid retrieval for filings
#[derive(Parser)]
#[command(name = "filing-index")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API server
    Serve,

    /// Ingest a PDF filing into the corpus
    Ingest {
        /// Path to the PDF file
        pdf: PathBuf,

        /// Company name (e.g. "Infosys Ltd")
        #[arg(short, long)]
        company: String,

        /// Ticker symbol; auto-detected from the filename if omitted
        #[arg(short, long)]
        ticker: Option<String>,

        /// Fiscal year; auto-detected from the filename if omitted
        #[arg(short = 'y', long)]
        fiscal_year: Option<i64>,

        /// Document type (e.g. 20-F, 10-K)
        #[arg(short, long)]
        doc_type: Option<String>,

        /// Overwrite an existing document with the same key
        #[arg(long)]
        force: bool,
    },

    /// Answer a question over the ingested corpus
    Query {
        /// The question
        query: String,

        /// Restrict to these companies (ticker or name)
        #[arg(short, long)]
        companies: Vec<String>,

        /// Restrict to these fiscal years
        #[arg(short, long)]
        years: Vec<i64>,
    },

    /// List ingested documents
    Corpus,

    /// Delete a document and its derived data
    Delete {
        /// Document id
        doc_id: String,
    },

    /// Test connectivity to the LLM and embedding services
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => cmd_serve().await,
        Commands::Ingest {
            pdf,
            company,
            ticker,
            fiscal_year,
            doc_type,
            force,
        } => {
            cmd_ingest(
                pdf,
                IngestOptions {
                    company,
                    ticker,
                    fiscal_year,
                    doc_type,
                    force,
                },
            )
            .await
        }
        Commands::Query {
            query,
            companies,
            years,
        } => cmd_query(query, companies, years).await,
        Commands::Corpus => cmd_corpus(),
        Commands::Delete { doc_id } => cmd_delete(doc_id),
        Commands::Test => cmd_test().await,
    }
}

fn load_validated_config() -> Result<Arc<Config>> {
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    Ok(Arc::new(config))
}

fn open_store(config: &Config) -> Result<Arc<Store>> {
    let store =
        Store::open(&config.storage.database_path).context("Failed to open database")?;
    Ok(Arc::new(store))
}

async fn cmd_serve() -> Result<()> {
    let config = load_validated_config()?;
    let store = open_store(&config)?;
    let tokenizer = Tokenizer::new().context("Failed to load tokenizer")?;

    let state = AppState::new(config.clone(), store, tokenizer);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server_addr))?;
    println!("Listening on http://{}", config.server_addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

async fn cmd_ingest(pdf: PathBuf, options: IngestOptions) -> Result<()> {
    let config = load_validated_config()?;
    let store = open_store(&config)?;
    let tokenizer = Tokenizer::new().context("Failed to load tokenizer")?;

    println!("Ingesting {} ...", pdf.display());
    let pipeline = IngestPipeline::new(config, store, tokenizer);
    let result = pipeline
        .ingest_pdf(&pdf, options)
        .await
        .context("Ingest failed")?;

    println!("Ingest complete:");
    println!("  doc_id:  {}", result.doc_id);
    println!("  pages:   {}", result.page_count);
    println!("  nodes:   {}", result.node_count);
    println!("  chunks:  {}", result.chunks_created);
    Ok(())
}

async fn cmd_query(query: String, companies: Vec<String>, years: Vec<i64>) -> Result<()> {
    let config = load_validated_config()?;
    let store = open_store(&config)?;
    let tokenizer = Tokenizer::new().context("Failed to load tokenizer")?;

    let orchestrator = RetrievalOrchestrator::new(config, store, tokenizer);
    let answer = orchestrator
        .answer(&query, &companies, &years)
        .await
        .context("Query failed")?;

    println!("{}", answer.answer);
    println!();
    println!(
        "Confidence: {:?} ({} sub-questions answered, {} source nodes)",
        answer.retrieval_confidence.label,
        answer.retrieval_confidence.answered_by_facts,
        answer.retrieval_confidence.answered_by_chunks
    );

    if !answer.unanswerable_sub_questions.is_empty() {
        println!("Unanswerable sub-questions:");
        for sq in &answer.unanswerable_sub_questions {
            println!("  - {}", sq);
        }
    }

    if !answer.conflicts_detected.is_empty() {
        println!("Conflicts detected:");
        for conflict in &answer.conflicts_detected {
            println!("  - {}", conflict);
        }
    }

    Ok(())
}

fn cmd_corpus() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    let store = Store::open(&config.storage.database_path).context("Failed to open database")?;

    let documents = store.list_documents().context("Failed to list documents")?;
    if documents.is_empty() {
        println!("No documents ingested yet.");
        return Ok(());
    }

    println!(
        "{:<38} {:<8} {:<6} {:<8} {:>6} {:>7} {:<10}",
        "id", "ticker", "year", "type", "nodes", "chunks", "status"
    );
    for doc in documents {
        println!(
            "{:<38} {:<8} {:<6} {:<8} {:>6} {:>7} {:<10}",
            doc.id,
            doc.ticker,
            doc.fiscal_year,
            doc.doc_type,
            doc.node_count,
            doc.chunk_count,
            doc.status.as_str()
        );
    }
    Ok(())
}

fn cmd_delete(doc_id: String) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    let store = Store::open(&config.storage.database_path).context("Failed to open database")?;

    if store.delete_document(&doc_id).context("Delete failed")? {
        println!("Deleted {}", doc_id);
    } else {
        println!("No document with id {}", doc_id);
    }
    Ok(())
}

async fn cmd_test() -> Result<()> {
    let config = load_validated_config()?;

    println!("Configuration:");
    println!("  LLM base URL:   {}", config.llm.base_url);
    println!("  LLM model:      {}", config.llm.model);
    println!("  Embedding URL:  {}", config.embedding.url);
    println!("  Embedding model: {} ({}d)", config.embedding.model, config.embedding.dim);
    println!();

    print!("LLM connection ... ");
    let llm = LlmClient::new(config.llm.clone());
    match llm.test_connection().await {
        Ok(()) => println!("ok"),
        Err(e) => println!("failed: {}", e),
    }

    print!("Embedding service ... ");
    let embedder = EmbeddingClient::new(config.embedding.clone());
    if embedder.health().await {
        println!("ok");
    } else {
        println!("failed or model missing");
    }

    Ok(())
}
