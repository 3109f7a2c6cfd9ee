//! Answer generation: token-budgeted context packing, cited synthesis and
//! confidence labelling.

use crate::error::{FilingIndexError, Result};
use crate::llm::{LlmClient, Prompts};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Attempts to obtain an answer with a parsable citation block.
const ANSWER_RETRIES: u32 = 3;

/// One retrieved node presented to the answer LLM.
#[derive(Debug, Clone)]
pub struct ContextBlock {
    pub company: String,
    pub ticker: String,
    pub fiscal_year: i64,
    pub doc_id: String,
    pub node_id: String,
    pub title: String,
    pub start_page: usize,
    pub end_page: usize,
    pub text: String,
}

/// A structured citation resolved from the answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub company: String,
    #[serde(default)]
    pub ticker: String,
    pub fiscal_year: i64,
    pub node_id: String,
    #[serde(default)]
    pub section_path: String,
    #[serde(default)]
    pub page: i64,
    #[serde(default)]
    pub content_preview: String,
}

/// Coarse retrieval-quality label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceLabel {
    High,
    Medium,
    Low,
}

/// Confidence summary attached to every answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfidence {
    pub label: ConfidenceLabel,
    /// Sub-questions that produced at least one cited claim.
    pub answered_by_facts: usize,
    /// Distinct source nodes cited in the answer.
    pub answered_by_chunks: usize,
    /// Sub-questions without any cited claim.
    pub unanswered: usize,
}

/// The full answer payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub retrieval_confidence: RetrievalConfidence,
    pub resolved_citations: Vec<Citation>,
    pub unanswerable_sub_questions: Vec<String>,
    pub conflicts_detected: Vec<String>,
}

/// The trailing JSON block the answer prompt demands.
#[derive(Debug, Deserialize)]
struct AnswerMeta {
    #[serde(default)]
    citations: Vec<Citation>,
    #[serde(default)]
    sub_question_coverage: Vec<CoverageEntry>,
    #[serde(default)]
    conflicts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CoverageEntry {
    sub_question: String,
    answered: bool,
}

/// Synthesizes the final cited answer. Does not re-rank context.
pub struct AnswerGenerator {
    client: LlmClient,
}

impl AnswerGenerator {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }

    /// Generate a cited answer from the ordered context blocks.
    ///
    /// An empty context produces an explicit insufficient-context answer with
    /// LOW confidence rather than an error. A response whose citation block
    /// never parses is a critical failure.
    pub async fn generate(
        &self,
        query: &str,
        sub_questions: &[String],
        blocks: &[ContextBlock],
    ) -> Result<Answer> {
        if blocks.is_empty() {
            return Ok(Answer {
                answer: "Insufficient context: no relevant sections were retrieved for this query."
                    .to_string(),
                retrieval_confidence: RetrievalConfidence {
                    label: ConfidenceLabel::Low,
                    answered_by_facts: 0,
                    answered_by_chunks: 0,
                    unanswered: sub_questions.len(),
                },
                resolved_citations: Vec::new(),
                unanswerable_sub_questions: sub_questions.to_vec(),
                conflicts_detected: Vec::new(),
            });
        }

        let context = format_context(blocks);
        let sub_question_listing = sub_questions
            .iter()
            .map(|q| format!("- {}", q))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = Prompts::answer_with_citations()
            .replace("{query}", query)
            .replace("{sub_questions}", &sub_question_listing)
            .replace("{context}", &context);

        let mut last_err = String::new();
        for attempt in 0..ANSWER_RETRIES {
            let response = self
                .client
                .complete(Some(Prompts::system_financial_analyst()), &prompt)
                .await?;

            match parse_answer_response(&response) {
                Some((visible, meta)) => {
                    return Ok(self.assemble(visible, meta, sub_questions));
                }
                None => {
                    warn!(
                        "Answer response missing citation block (attempt {})",
                        attempt + 1
                    );
                    last_err = format!(
                        "No parsable citation block in answer: {}",
                        &response[..response.len().min(200)]
                    );
                }
            }
        }

        Err(FilingIndexError::LlmShape(last_err))
    }

    fn assemble(
        &self,
        answer: String,
        meta: AnswerMeta,
        sub_questions: &[String],
    ) -> Answer {
        let answered = meta
            .sub_question_coverage
            .iter()
            .filter(|c| c.answered)
            .count()
            .min(sub_questions.len());

        let distinct_nodes = distinct_cited_nodes(&meta.citations);
        let total = sub_questions.len();
        let unanswered = total.saturating_sub(answered);

        let unanswerable: Vec<String> = meta
            .sub_question_coverage
            .iter()
            .filter(|c| !c.answered)
            .map(|c| c.sub_question.clone())
            .collect();

        Answer {
            answer,
            retrieval_confidence: RetrievalConfidence {
                label: compute_confidence(answered, total, distinct_nodes),
                answered_by_facts: answered,
                answered_by_chunks: distinct_nodes,
                unanswered,
            },
            resolved_citations: meta.citations,
            unanswerable_sub_questions: unanswerable,
            conflicts_detected: meta.conflicts,
        }
    }
}

/// Format the ordered context blocks for the answer prompt.
fn format_context(blocks: &[ContextBlock]) -> String {
    blocks
        .iter()
        .map(|b| {
            format!(
                "=== [{}, {}, node {}, \"{}\", pages {}-{}] ===\n{}",
                b.company, b.fiscal_year, b.node_id, b.title, b.start_page, b.end_page, b.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Count distinct cited source nodes across documents.
fn distinct_cited_nodes(citations: &[Citation]) -> usize {
    citations
        .iter()
        .map(|c| (c.ticker.as_str(), c.fiscal_year, c.node_id.as_str()))
        .collect::<std::collections::HashSet<_>>()
        .len()
}

/// Confidence rules:
/// - HIGH: every sub-question cited and at least 3 distinct source nodes.
/// - MEDIUM: more than half the sub-questions cited and at least 1 node.
/// - LOW: otherwise.
pub fn compute_confidence(answered: usize, total: usize, distinct_nodes: usize) -> ConfidenceLabel {
    if total > 0 && answered == total && distinct_nodes >= 3 {
        ConfidenceLabel::High
    } else if total > 0 && answered * 2 > total && distinct_nodes >= 1 {
        ConfidenceLabel::Medium
    } else {
        ConfidenceLabel::Low
    }
}

/// Split an answer response into the visible answer text and the trailing
/// JSON metadata block.
fn parse_answer_response(response: &str) -> Option<(String, AnswerMeta)> {
    let (visible, json_str) = split_trailing_json(response)?;
    let meta: AnswerMeta = serde_json::from_str(&json_str).ok()?;
    Some((visible.trim().to_string(), meta))
}

/// Locate the last fenced JSON block; fall back to a trailing bare object.
fn split_trailing_json(response: &str) -> Option<(String, String)> {
    if let Some(fence_start) = response.rfind("```json") {
        let after = &response[fence_start + "```json".len()..];
        if let Some(fence_end) = after.find("```") {
            let json_str = after[..fence_end].trim().to_string();
            let visible = response[..fence_start].to_string();
            return Some((visible, json_str));
        }
    }

    // Bare trailing object: scan back for a '{' that opens valid JSON.
    let mut search_end = response.len();
    while let Some(open) = response[..search_end].rfind('{') {
        let candidate = response[open..].trim();
        if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
            return Some((response[..open].to_string(), candidate.to_string()));
        }
        search_end = open;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_json(coverage: &[(&str, bool)], nodes: &[&str]) -> String {
        let citations: Vec<String> = nodes
            .iter()
            .map(|n| {
                format!(
                    r#"{{"company": "Apple Inc", "ticker": "AAPL", "fiscal_year": 2022, "node_id": "{}", "section_path": "Revenue", "page": 30, "content_preview": "..."}}"#,
                    n
                )
            })
            .collect();
        let coverage_entries: Vec<String> = coverage
            .iter()
            .map(|(q, a)| format!(r#"{{"sub_question": "{}", "answered": {}}}"#, q, a))
            .collect();
        format!(
            r#"{{"citations": [{}], "sub_question_coverage": [{}], "conflicts": []}}"#,
            citations.join(","),
            coverage_entries.join(",")
        )
    }

    #[test]
    fn test_compute_confidence_high() {
        assert_eq!(compute_confidence(3, 3, 3), ConfidenceLabel::High);
        assert_eq!(compute_confidence(1, 1, 5), ConfidenceLabel::High);
    }

    #[test]
    fn test_compute_confidence_medium_scenario() {
        // 4 sub-questions, 3 answered, 5 distinct nodes.
        assert_eq!(compute_confidence(3, 4, 5), ConfidenceLabel::Medium);
    }

    #[test]
    fn test_compute_confidence_low() {
        assert_eq!(compute_confidence(0, 2, 0), ConfidenceLabel::Low);
        assert_eq!(compute_confidence(1, 2, 1), ConfidenceLabel::Low);
        assert_eq!(compute_confidence(2, 2, 0), ConfidenceLabel::Low);
        assert_eq!(compute_confidence(0, 0, 0), ConfidenceLabel::Low);
    }

    #[test]
    fn test_confidence_high_requires_all_answered() {
        assert_eq!(compute_confidence(3, 4, 8), ConfidenceLabel::Medium);
    }

    #[test]
    fn test_split_trailing_json_fenced() {
        let response = format!(
            "Revenue grew 8% [Apple Inc, 2022, p30].\n\n```json\n{}\n```",
            meta_json(&[("q1", true)], &["0001"])
        );
        let (visible, json_str) = split_trailing_json(&response).unwrap();
        assert!(visible.contains("Revenue grew"));
        assert!(!visible.contains("```"));
        assert!(serde_json::from_str::<AnswerMeta>(&json_str).is_ok());
    }

    #[test]
    fn test_split_trailing_json_bare_object() {
        let response = format!(
            "The filing reports steady margins.\n{}",
            meta_json(&[("q1", true)], &["0001"])
        );
        let (visible, json_str) = split_trailing_json(&response).unwrap();
        assert!(visible.contains("steady margins"));
        let meta: AnswerMeta = serde_json::from_str(&json_str).unwrap();
        assert_eq!(meta.citations.len(), 1);
    }

    #[test]
    fn test_split_trailing_json_absent() {
        assert!(split_trailing_json("No JSON at all here.").is_none());
    }

    #[test]
    fn test_parse_answer_scenario_labelling() {
        let response = format!(
            "Answer body.\n\n```json\n{}\n```",
            meta_json(
                &[("q1", true), ("q2", true), ("q3", true), ("q4", false)],
                &["0001", "0002", "0003", "0004", "0005"]
            )
        );
        let (visible, meta) = parse_answer_response(&response).unwrap();
        let generator = AnswerGenerator::new(LlmClient::new(crate::config::LlmConfig::default()));
        let answer = generator.assemble(
            visible,
            meta,
            &[
                "q1".to_string(),
                "q2".to_string(),
                "q3".to_string(),
                "q4".to_string(),
            ],
        );

        assert_eq!(answer.retrieval_confidence.label, ConfidenceLabel::Medium);
        assert_eq!(answer.retrieval_confidence.answered_by_facts, 3);
        assert_eq!(answer.retrieval_confidence.answered_by_chunks, 5);
        assert_eq!(answer.retrieval_confidence.unanswered, 1);
        assert_eq!(answer.unanswerable_sub_questions, vec!["q4"]);
    }

    #[test]
    fn test_distinct_cited_nodes_dedups() {
        let citation = Citation {
            company: "Apple Inc".to_string(),
            ticker: "AAPL".to_string(),
            fiscal_year: 2022,
            node_id: "0001".to_string(),
            section_path: String::new(),
            page: 1,
            content_preview: String::new(),
        };
        let mut other = citation.clone();
        other.fiscal_year = 2023;
        assert_eq!(distinct_cited_nodes(&[citation.clone(), citation, other]), 2);
    }

    #[tokio::test]
    async fn test_generate_empty_context_is_insufficient() {
        let generator = AnswerGenerator::new(LlmClient::new(crate::config::LlmConfig::default()));
        let answer = generator
            .generate("What was revenue?", &["What was revenue?".to_string()], &[])
            .await
            .unwrap();

        assert_eq!(answer.retrieval_confidence.label, ConfidenceLabel::Low);
        assert!(answer.answer.to_lowercase().contains("insufficient context"));
        assert_eq!(answer.unanswerable_sub_questions.len(), 1);
    }

    #[test]
    fn test_format_context_carries_metadata() {
        let block = ContextBlock {
            company: "Apple Inc".to_string(),
            ticker: "AAPL".to_string(),
            fiscal_year: 2022,
            doc_id: "d1".to_string(),
            node_id: "0003".to_string(),
            title: "Revenue".to_string(),
            start_page: 30,
            end_page: 34,
            text: "Net sales were ...".to_string(),
        };
        let formatted = format_context(&[block]);
        assert!(formatted.contains("Apple Inc"));
        assert!(formatted.contains("node 0003"));
        assert!(formatted.contains("pages 30-34"));
    }
}
