//! LLM tree search: reason over the text-stripped tree to select node ids.

use crate::error::FilingIndexError;
use crate::llm::{LlmClient, Prompts};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct TreeSearchResponse {
    #[serde(default)]
    #[allow(dead_code)]
    thinking: Option<String>,
    node_list: Vec<String>,
}

/// LLM-reasoned node selection over `tree_no_text`.
pub struct LlmSearch {
    client: LlmClient,
}

impl LlmSearch {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }

    /// Return node ids the LLM judges relevant, in its preference order.
    ///
    /// Unknown ids are dropped with a warning and duplicates deduplicated
    /// preserving order. A response that never parses degrades to an empty
    /// list so value search alone still answers.
    pub async fn search(
        &self,
        query: &str,
        tree_no_text: &Value,
        known_ids: &HashSet<String>,
    ) -> Vec<String> {
        let prompt = Prompts::tree_search()
            .replace("{tree_structure}", &tree_no_text.to_string())
            .replace("{query}", query);

        match self
            .client
            .complete_json::<TreeSearchResponse>(
                Some(Prompts::system_document_analyzer()),
                &prompt,
            )
            .await
        {
            Ok(response) => sanitize_node_list(response.node_list, known_ids),
            Err(FilingIndexError::LlmShape(e)) => {
                warn!("Tree search returned no parsable node list: {}", e);
                Vec::new()
            }
            Err(e) => {
                warn!("Tree search failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Drop unknown node ids (with a warning) and deduplicate preserving order.
pub fn sanitize_node_list(node_list: Vec<String>, known_ids: &HashSet<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for node_id in node_list {
        if !known_ids.contains(&node_id) {
            warn!("Tree search returned unknown node_id '{}'", node_id);
            continue;
        }
        if seen.insert(node_id.clone()) {
            out.push(node_id);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sanitize_drops_unknown_ids() {
        let result = sanitize_node_list(
            vec!["0001".into(), "9999".into(), "0002".into()],
            &known(&["0001", "0002"]),
        );
        assert_eq!(result, vec!["0001", "0002"]);
    }

    #[test]
    fn test_sanitize_dedups_preserving_order() {
        let result = sanitize_node_list(
            vec!["0002".into(), "0001".into(), "0002".into()],
            &known(&["0001", "0002"]),
        );
        assert_eq!(result, vec!["0002", "0001"]);
    }

    #[test]
    fn test_sanitize_empty() {
        assert!(sanitize_node_list(Vec::new(), &known(&["0001"])).is_empty());
    }
}
