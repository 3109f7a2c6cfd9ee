//! Hybrid retrieval: query decomposition, document selection, parallel
//! per-document search fan-out, merge, context extraction and answer
//! generation.

mod answer;
mod llm_search;
mod merge;
mod value_search;

pub use answer::{
    Answer, AnswerGenerator, Citation, ConfidenceLabel, ContextBlock, RetrievalConfidence,
};
pub use llm_search::{sanitize_node_list, LlmSearch};
pub use merge::{merge_global, merge_hybrid, NodeRef};
pub use value_search::{aggregate_to_nodes, NodeScore, ValueSearch};

use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::error::{FilingIndexError, Result};
use crate::llm::{LlmClient, Prompts};
use crate::store::{ChunkEmbedding, DocStatus, DocumentRecord, Store};
use crate::tokenizer::Tokenizer;
use crate::tree::Node;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// An atomic sub-question produced by query decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQuestion {
    pub text: String,
    #[serde(default)]
    pub target_company: Option<String>,
    #[serde(default)]
    pub target_year: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DecomposeResponse {
    sub_questions: Vec<SubQuestion>,
}

/// Everything retrieval needs from one ingested document, immutable and
/// shared across concurrent search tasks.
struct DocData {
    record: DocumentRecord,
    tree_no_text: serde_json::Value,
    node_map: HashMap<String, Node>,
    known_ids: HashSet<String>,
    start_pages: HashMap<String, usize>,
    chunks: Vec<ChunkEmbedding>,
}

struct PairOutcome {
    doc_id: String,
    merged: Vec<String>,
    failed: bool,
}

/// Entry point for answering queries over the ingested corpus.
pub struct RetrievalOrchestrator {
    config: Arc<Config>,
    store: Arc<Store>,
    llm: LlmClient,
    embedder: EmbeddingClient,
    tokenizer: Tokenizer,
}

impl RetrievalOrchestrator {
    pub fn new(config: Arc<Config>, store: Arc<Store>, tokenizer: Tokenizer) -> Self {
        Self {
            llm: LlmClient::new(config.llm.clone()),
            embedder: EmbeddingClient::new(config.embedding.clone()),
            tokenizer,
            config,
            store,
        }
    }

    /// Answer a query, optionally constrained to companies and fiscal years.
    pub async fn answer(
        &self,
        query: &str,
        companies: &[String],
        years: &[i64],
    ) -> Result<Answer> {
        if query.trim().is_empty() {
            return Err(FilingIndexError::Validation(
                "Query must not be empty.".to_string(),
            ));
        }

        // 1. Decompose into atomic sub-questions.
        let sub_questions = self.decompose(query).await;
        info!("Query decomposed into {} sub-questions", sub_questions.len());

        // 2. Candidate documents: completed only, user filters are hard.
        let candidates: Vec<DocumentRecord> = self
            .store
            .list_documents()?
            .into_iter()
            .filter(|d| d.status == DocStatus::Completed)
            .filter(|d| companies.is_empty() || matches_any_company(d, companies))
            .filter(|d| years.is_empty() || years.contains(&d.fiscal_year))
            .collect();

        // 3. Per-sub-question selection, narrowed by sub-question tags.
        let selections: Vec<Vec<usize>> = sub_questions
            .iter()
            .map(|sq| {
                candidates
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| {
                        sq.target_company
                            .as_deref()
                            .map_or(true, |c| matches_company(d, c))
                    })
                    .filter(|(_, d)| sq.target_year.map_or(true, |y| d.fiscal_year == y))
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();

        // 4. Load shared per-document data once across all sub-questions.
        let mut doc_data: HashMap<usize, Arc<DocData>> = HashMap::new();
        for &idx in selections.iter().flatten() {
            if doc_data.contains_key(&idx) {
                continue;
            }
            match self.load_doc_data(&candidates[idx]) {
                Ok(data) => {
                    doc_data.insert(idx, Arc::new(data));
                }
                Err(e) => {
                    warn!(
                        "Skipping document {}: failed to load artefacts: {}",
                        candidates[idx].id, e
                    );
                }
            }
        }

        // 5. Concurrent hybrid search per (sub-question, document) pair,
        //    throttled by the configured concurrency cap.
        let semaphore = Arc::new(Semaphore::new(self.config.retrieval.concurrency.max(1)));
        let value_search = Arc::new(ValueSearch::new(
            self.embedder.clone(),
            self.config.retrieval.value_search_top_k,
        ));
        let llm_search = Arc::new(LlmSearch::new(self.llm.clone()));

        let mut pair_futures = Vec::new();
        for (sq_idx, sq) in sub_questions.iter().enumerate() {
            for &doc_idx in &selections[sq_idx] {
                let Some(data) = doc_data.get(&doc_idx).cloned() else {
                    continue;
                };
                let semaphore = semaphore.clone();
                let value_search = value_search.clone();
                let llm_search = llm_search.clone();
                let question = sq.text.clone();

                pair_futures.push(async move {
                    // Closed only on shutdown; treat as a failed pair.
                    let Ok(_permit) = semaphore.acquire().await else {
                        return (
                            sq_idx,
                            PairOutcome {
                                doc_id: data.record.id.clone(),
                                merged: Vec::new(),
                                failed: true,
                            },
                        );
                    };

                    let (value_result, llm_ids) = tokio::join!(
                        value_search.search(&question, &data.chunks, &data.start_pages),
                        llm_search.search(&question, &data.tree_no_text, &data.known_ids),
                    );

                    let (value_scores, value_failed) = match value_result {
                        Ok(scores) => (scores, false),
                        Err(e) => {
                            warn!(
                                "Value search failed for document {}: {}",
                                data.record.id, e
                            );
                            (Vec::new(), true)
                        }
                    };

                    // LLM-search results precede value-search results by
                    // construction, regardless of completion order.
                    let merged = merge_hybrid(&llm_ids, &value_scores);
                    let failed = merged.is_empty() && value_failed;

                    (
                        sq_idx,
                        PairOutcome {
                            doc_id: data.record.id.clone(),
                            merged,
                            failed,
                        },
                    )
                });
            }
        }

        let mut outcomes: Vec<Vec<PairOutcome>> = (0..sub_questions.len()).map(|_| Vec::new()).collect();
        for (sq_idx, outcome) in futures::future::join_all(pair_futures).await {
            outcomes[sq_idx].push(outcome);
        }

        // Sub-questions whose every pair failed outright are unanswerable.
        let mut failed_sub_questions: Vec<String> = Vec::new();
        for (sq_idx, sq_outcomes) in outcomes.iter().enumerate() {
            if !sq_outcomes.is_empty() && sq_outcomes.iter().all(|o| o.failed) {
                failed_sub_questions.push(sub_questions[sq_idx].text.clone());
            }
        }

        // 6. Global merge in (sub-question order, document order).
        let per_pair: Vec<(String, Vec<String>)> = outcomes
            .into_iter()
            .flatten()
            .map(|o| (o.doc_id, o.merged))
            .collect();
        let merged_refs = merge_global(per_pair);
        info!("Merged retrieval produced {} candidate nodes", merged_refs.len());

        // 7. Context extraction under the token budget; a node is included
        //    entirely or skipped.
        let doc_by_id: HashMap<&str, &Arc<DocData>> = doc_data
            .values()
            .map(|d| (d.record.id.as_str(), d))
            .collect();
        let blocks = self.extract_context(&merged_refs, &doc_by_id);

        // 8. Answer generation.
        let sub_question_texts: Vec<String> =
            sub_questions.iter().map(|sq| sq.text.clone()).collect();
        let generator = AnswerGenerator::new(self.llm.clone());
        let mut answer = generator
            .generate(query, &sub_question_texts, &blocks)
            .await?;

        for failed in failed_sub_questions {
            if !answer.unanswerable_sub_questions.contains(&failed) {
                answer.unanswerable_sub_questions.push(failed);
            }
        }

        Ok(answer)
    }

    /// Decompose the query; a persistent shape failure degrades to a single
    /// atomic sub-question.
    async fn decompose(&self, query: &str) -> Vec<SubQuestion> {
        let prompt = Prompts::decompose_query().replace("{query}", query);
        match self
            .llm
            .complete_json::<DecomposeResponse>(Some(Prompts::system_document_analyzer()), &prompt)
            .await
        {
            Ok(response) if !response.sub_questions.is_empty() => response
                .sub_questions
                .into_iter()
                .filter(|sq| !sq.text.trim().is_empty())
                .collect(),
            Ok(_) => vec![single_question(query)],
            Err(e) => {
                warn!("Query decomposition failed ({}); treating as atomic", e);
                vec![single_question(query)]
            }
        }
    }

    fn load_doc_data(&self, record: &DocumentRecord) -> Result<DocData> {
        let tree_no_text = self
            .store
            .load_tree_no_text(&record.id)?
            .ok_or_else(|| FilingIndexError::UnknownDocument(record.id.clone()))?;
        let node_map_json = self
            .store
            .load_node_map(&record.id)?
            .ok_or_else(|| FilingIndexError::UnknownDocument(record.id.clone()))?;

        let node_map: HashMap<String, Node> = serde_json::from_value(node_map_json)?;
        let known_ids: HashSet<String> = node_map.keys().cloned().collect();
        let start_pages: HashMap<String, usize> = node_map
            .iter()
            .map(|(id, n)| (id.clone(), n.start_index))
            .collect();
        let chunks = self.store.load_chunk_embeddings(&record.id)?;

        Ok(DocData {
            record: record.clone(),
            tree_no_text,
            node_map,
            known_ids,
            start_pages,
            chunks,
        })
    }

    /// Walk the merged node order, appending whole nodes until the token
    /// budget is reached. Oversized nodes are skipped, never truncated.
    fn extract_context(
        &self,
        refs: &[NodeRef],
        doc_by_id: &HashMap<&str, &Arc<DocData>>,
    ) -> Vec<ContextBlock> {
        let budget = self.config.retrieval.context_budget_tokens;
        let mut used = 0usize;
        let mut blocks = Vec::new();

        for node_ref in refs {
            let Some(data) = doc_by_id.get(node_ref.doc_id.as_str()) else {
                continue;
            };
            let Some(node) = data.node_map.get(&node_ref.node_id) else {
                warn!(
                    "Merged node {} missing from node map of {}",
                    node_ref.node_id, node_ref.doc_id
                );
                continue;
            };
            let Some(text) = node.text.as_deref().filter(|t| !t.trim().is_empty()) else {
                continue;
            };

            let tokens = self.tokenizer.count(text);
            if used + tokens > budget {
                continue;
            }
            used += tokens;

            blocks.push(ContextBlock {
                company: data.record.company.clone(),
                ticker: data.record.ticker.clone(),
                fiscal_year: data.record.fiscal_year,
                doc_id: data.record.id.clone(),
                node_id: node_ref.node_id.clone(),
                title: node.title.clone(),
                start_page: node.start_index,
                end_page: node.end_index,
                text: text.to_string(),
            });
        }

        blocks
    }
}

fn single_question(query: &str) -> SubQuestion {
    SubQuestion {
        text: query.to_string(),
        target_company: None,
        target_year: None,
    }
}

fn matches_company(doc: &DocumentRecord, filter: &str) -> bool {
    let filter = filter.to_lowercase();
    doc.ticker.to_lowercase() == filter || doc.company.to_lowercase().contains(&filter)
}

fn matches_any_company(doc: &DocumentRecord, filters: &[String]) -> bool {
    filters.iter().any(|f| matches_company(doc, f))
}
