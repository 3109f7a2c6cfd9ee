//! Value search: embedding-cosine scoring aggregated from chunks to nodes.

use crate::embedding::{cosine_similarity, EmbeddingClient};
use crate::error::Result;
use crate::store::ChunkEmbedding;
use std::collections::HashMap;

/// A node's aggregated relevance for one sub-question.
#[derive(Debug, Clone)]
pub struct NodeScore {
    pub node_id: String,
    pub score: f32,
}

/// Embedding-similarity search over a document's chunk embeddings.
pub struct ValueSearch {
    embedder: EmbeddingClient,
    top_k: usize,
}

impl ValueSearch {
    pub fn new(embedder: EmbeddingClient, top_k: usize) -> Self {
        Self { embedder, top_k }
    }

    /// Score every chunk against the sub-question and aggregate to nodes.
    ///
    /// `node_start_pages` supplies each node's `start_index` for tie-breaking.
    pub async fn search(
        &self,
        query: &str,
        chunks: &[ChunkEmbedding],
        node_start_pages: &HashMap<String, usize>,
    ) -> Result<Vec<NodeScore>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed_one(query).await?;

        let chunk_scores: Vec<(&str, f32)> = chunks
            .iter()
            .map(|c| {
                (
                    c.node_id.as_str(),
                    cosine_similarity(&query_vector, &c.vector),
                )
            })
            .collect();

        Ok(aggregate_to_nodes(
            &chunk_scores,
            node_start_pages,
            self.top_k,
        ))
    }
}

/// Aggregate per-chunk scores into node scores:
/// `NodeScore(n) = (1 / sqrt(N_n + 1)) * sum(s)` for a node with `N_n`
/// chunks. The damping rewards multiple matching chunks without letting long
/// sections win on chunk count alone. Returns the top-k nodes by descending
/// score; ties break toward the earlier `start_index`.
pub fn aggregate_to_nodes(
    chunk_scores: &[(&str, f32)],
    node_start_pages: &HashMap<String, usize>,
    top_k: usize,
) -> Vec<NodeScore> {
    let mut sums: HashMap<&str, (f32, usize)> = HashMap::new();
    for (node_id, score) in chunk_scores {
        let entry = sums.entry(node_id).or_insert((0.0, 0));
        entry.0 += score;
        entry.1 += 1;
    }

    let mut scores: Vec<NodeScore> = sums
        .into_iter()
        .map(|(node_id, (sum, count))| NodeScore {
            node_id: node_id.to_string(),
            score: sum / ((count as f32) + 1.0).sqrt(),
        })
        .collect();

    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let pa = node_start_pages.get(&a.node_id).copied().unwrap_or(usize::MAX);
                let pb = node_start_pages.get(&b.node_id).copied().unwrap_or(usize::MAX);
                pa.cmp(&pb)
            })
            .then_with(|| a.node_id.cmp(&b.node_id))
    });

    scores.truncate(top_k);
    scores
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(entries: &[(&str, usize)]) -> HashMap<String, usize> {
        entries
            .iter()
            .map(|(id, p)| (id.to_string(), *p))
            .collect()
    }

    #[test]
    fn test_single_chunk_node_damping() {
        let scores = aggregate_to_nodes(&[("0001", 0.8)], &pages(&[("0001", 1)]), 10);
        assert_eq!(scores.len(), 1);
        // 0.8 / sqrt(2)
        assert!((scores[0].score - 0.8 / 2.0f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_multiple_matching_chunks_beat_single() {
        let chunk_scores = vec![("0001", 0.7), ("0001", 0.7), ("0002", 0.8)];
        let scores = aggregate_to_nodes(&chunk_scores, &pages(&[("0001", 1), ("0002", 5)]), 10);

        // 1.4/sqrt(3) ≈ 0.808 beats 0.8/sqrt(2) ≈ 0.566.
        assert_eq!(scores[0].node_id, "0001");
        assert_eq!(scores[1].node_id, "0002");
    }

    #[test]
    fn test_long_section_does_not_win_on_count_alone() {
        // Ten weak chunks vs one strong chunk.
        let mut chunk_scores: Vec<(&str, f32)> = (0..10).map(|_| ("0001", 0.1)).collect();
        chunk_scores.push(("0002", 0.9));
        let scores = aggregate_to_nodes(&chunk_scores, &pages(&[("0001", 1), ("0002", 5)]), 10);

        // 1.0/sqrt(11) ≈ 0.30 < 0.9/sqrt(2) ≈ 0.64.
        assert_eq!(scores[0].node_id, "0002");
    }

    #[test]
    fn test_tie_breaks_toward_earlier_start_page() {
        let chunk_scores = vec![("0005", 0.5), ("0002", 0.5)];
        let scores = aggregate_to_nodes(&chunk_scores, &pages(&[("0005", 20), ("0002", 3)]), 10);
        assert_eq!(scores[0].node_id, "0002");
    }

    #[test]
    fn test_top_k_truncation() {
        let chunk_scores = vec![("a", 0.9), ("b", 0.8), ("c", 0.7)];
        let scores = aggregate_to_nodes(
            &chunk_scores,
            &pages(&[("a", 1), ("b", 2), ("c", 3)]),
            2,
        );
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].node_id, "a");
    }

    #[test]
    fn test_verbatim_match_node_appears_in_top_k() {
        // A chunk identical to the query scores 1.0 after normalization;
        // its node must surface in the top-k.
        let mut chunk_scores: Vec<(&str, f32)> = (0..30)
            .map(|i| if i % 2 == 0 { ("noise_a", 0.2) } else { ("noise_b", 0.25) })
            .collect();
        chunk_scores.push(("target", 1.0));

        let scores = aggregate_to_nodes(
            &chunk_scores,
            &pages(&[("noise_a", 1), ("noise_b", 2), ("target", 3)]),
            3,
        );
        assert!(scores.iter().any(|s| s.node_id == "target"));
    }
}
