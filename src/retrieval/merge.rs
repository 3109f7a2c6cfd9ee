//! Hybrid merge: ordered union of LLM-search and value-search results.

use crate::retrieval::value_search::NodeScore;

/// A node reference that stays unambiguous across documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub doc_id: String,
    pub node_id: String,
}

/// Merge one (sub-question, document) pair: LLM-search ids first in their
/// returned order (precision-first), then value-search ids in score order,
/// skipping ids already present.
pub fn merge_hybrid(llm_ids: &[String], value_scores: &[NodeScore]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for id in llm_ids {
        if seen.insert(id.clone()) {
            out.push(id.clone());
        }
    }

    for score in value_scores {
        if seen.insert(score.node_id.clone()) {
            out.push(score.node_id.clone());
        }
    }

    out
}

/// Concatenate per-pair merged lists (already in sub-question order, then
/// document order) into one global list, deduplicating on (doc_id, node_id).
pub fn merge_global(per_pair: impl IntoIterator<Item = (String, Vec<String>)>) -> Vec<NodeRef> {
    let mut out: Vec<NodeRef> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (doc_id, node_ids) in per_pair {
        for node_id in node_ids {
            let node_ref = NodeRef {
                doc_id: doc_id.clone(),
                node_id,
            };
            if seen.insert(node_ref.clone()) {
                out.push(node_ref);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(node_id: &str, score: f32) -> NodeScore {
        NodeScore {
            node_id: node_id.to_string(),
            score,
        }
    }

    #[test]
    fn test_llm_ids_precede_value_ids() {
        // LLM returns ["0007", "0012"]; value returns [("0012", 0.9), ("0005", 0.7)].
        let merged = merge_hybrid(
            &["0007".to_string(), "0012".to_string()],
            &[score("0012", 0.9), score("0005", 0.7)],
        );
        assert_eq!(merged, vec!["0007", "0012", "0005"]);
    }

    #[test]
    fn test_overlapping_id_keeps_llm_position() {
        let merged = merge_hybrid(
            &["0003".to_string()],
            &[score("0001", 0.9), score("0003", 0.8)],
        );
        assert_eq!(merged, vec!["0003", "0001"]);
    }

    #[test]
    fn test_merge_with_empty_llm_list() {
        let merged = merge_hybrid(&[], &[score("0002", 0.5), score("0001", 0.4)]);
        assert_eq!(merged, vec!["0002", "0001"]);
    }

    #[test]
    fn test_merged_list_has_no_duplicates() {
        let merged = merge_hybrid(
            &["0001".to_string(), "0001".to_string()],
            &[score("0001", 0.9)],
        );
        assert_eq!(merged, vec!["0001"]);
    }

    #[test]
    fn test_global_merge_dedups_per_document() {
        let pairs = vec![
            ("docA".to_string(), vec!["0001".to_string(), "0002".to_string()]),
            // Same node id in another document is a different node.
            ("docB".to_string(), vec!["0001".to_string()]),
            // Repeat of an earlier pair entry is dropped.
            ("docA".to_string(), vec!["0002".to_string(), "0003".to_string()]),
        ];

        let merged = merge_global(pairs);
        assert_eq!(merged.len(), 4);
        assert_eq!(merged[0].doc_id, "docA");
        assert_eq!(merged[0].node_id, "0001");
        assert_eq!(merged[2].doc_id, "docB");
        assert_eq!(merged[3].node_id, "0003");
    }
}
