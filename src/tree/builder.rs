//! Tree builder: turns a per-page document into a validated node tree.
//!
//! The build runs in phases:
//! 1. ToC detection over the first pages, with transformation into outline
//!    items and page verification against the document text.
//! 2. If no reliable ToC exists, windowed LLM outlining over the whole text.
//! 3. Hierarchy lift from the flat outline.
//! 4. Recursive subdivision of oversized nodes, each proposal guarded by a
//!    coverage check; rejected or failing subdivisions keep the node as a
//!    flat leaf and never fail the ingest.
//! 5. Node-id assignment and invariant validation.

use crate::config::TreeConfig;
use crate::document::Document;
use crate::error::{FilingIndexError, Result};
use crate::llm::{extract_json, LlmClient, Prompts};
use crate::tree::{assign_node_ids, build_tree_from_outline, validate, Node, RawTocItem};
use serde::Deserialize;
use tracing::{info, warn};

/// Builds a validated document tree via multi-pass LLM coordination.
pub struct TreeBuilder {
    client: LlmClient,
    config: TreeConfig,
}

#[derive(Debug, Deserialize)]
struct TocDetectResponse {
    #[serde(default)]
    #[allow(dead_code)]
    thinking: Option<String>,
    toc_detected: String,
}

#[derive(Debug, Deserialize)]
struct TocTransformResponse {
    table_of_contents: Vec<RawTocItem>,
}

#[derive(Debug, Deserialize)]
struct CoverageResponse {
    #[serde(default)]
    #[allow(dead_code)]
    thinking: Option<String>,
    accuracy: f64,
}

/// A proposed child section from the subdivision prompt.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChildProposal {
    title: String,
    #[serde(alias = "page")]
    physical_index: serde_json::Value,
}

impl ChildProposal {
    fn page_number(&self) -> Option<usize> {
        RawTocItem {
            structure: None,
            title: self.title.clone(),
            physical_index: Some(self.physical_index.clone()),
        }
        .page_number()
    }
}

impl TreeBuilder {
    pub fn new(client: LlmClient, config: TreeConfig) -> Self {
        Self { client, config }
    }

    /// Build the node tree for a document.
    ///
    /// Outlining failures are critical and fail the document; subdivision
    /// failures degrade to flat leaves.
    pub async fn build(&self, document: &Document) -> Result<Vec<Node>> {
        let items = match self.toc_outline(document).await? {
            Some(items) => {
                info!(
                    "Using verified table of contents ({} entries) for '{}'",
                    items.len(),
                    document.name
                );
                items
            }
            None => {
                info!("No reliable ToC for '{}', outlining from text", document.name);
                self.outline_without_toc(document).await?
            }
        };

        // Outline items pointing outside the document cannot anchor a node.
        let items: Vec<RawTocItem> = items
            .into_iter()
            .filter(|item| {
                item.page_number()
                    .is_some_and(|p| p >= 1 && p <= document.page_count())
            })
            .collect();

        if items.is_empty() {
            return Err(FilingIndexError::TreeError(format!(
                "No sections could be extracted from '{}'",
                document.name
            )));
        }

        let mut roots = build_tree_from_outline(&items, document.page_count());
        self.subdivide_recursive(&mut roots, document).await;

        assign_node_ids(&mut roots);
        validate(&roots, document.page_count())?;
        Ok(roots)
    }

    // ── Phase 1: ToC detection and verification ─────────────────────────────

    /// Try to obtain a verified outline from the document's table of contents.
    /// Returns `None` when no ToC is detected or too few entries verify.
    async fn toc_outline(&self, document: &Document) -> Result<Option<Vec<RawTocItem>>> {
        let last_page = self.config.toc_check_pages.min(document.page_count());
        let head = document.content_range_tagged(1, last_page);

        let detect_prompt = Prompts::toc_detector().replace("{content}", &head);
        let detected: TocDetectResponse = match self
            .client
            .complete_json(Some(Prompts::system_document_analyzer()), &detect_prompt)
            .await
        {
            Ok(r) => r,
            Err(FilingIndexError::LlmShape(e)) => {
                warn!("ToC detection returned no usable answer: {}", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if detected.toc_detected.to_lowercase() != "yes" {
            return Ok(None);
        }

        let transform_prompt = format!("{}\n\nTable of contents text:\n{}", Prompts::toc_transformer(), head);
        let transformed: TocTransformResponse = match self
            .client
            .complete_json(Some(Prompts::system_document_analyzer()), &transform_prompt)
            .await
        {
            Ok(r) => r,
            Err(FilingIndexError::LlmShape(e)) => {
                warn!("ToC transformation failed, falling back to outlining: {}", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let total = transformed.table_of_contents.len();
        let verified = verify_toc_entries(
            &transformed.table_of_contents,
            document,
            self.config.toc_match_window,
        );

        // Too few survivors means the ToC pages lie (scanned ToC, offset
        // numbering); outline from text instead.
        if total == 0 || verified.len() * 2 < total {
            warn!(
                "Only {}/{} ToC entries verified for '{}', falling back to outlining",
                verified.len(),
                total,
                document.name
            );
            return Ok(None);
        }

        Ok(Some(dedupe_outline(verified)))
    }

    // ── Phase 2: ToC-less outlining ─────────────────────────────────────────

    /// Outline the document with a sliding window of token-bounded page
    /// batches. This phase is critical: errors propagate.
    async fn outline_without_toc(&self, document: &Document) -> Result<Vec<RawTocItem>> {
        let windows = window_pages(document, self.config.max_tokens_per_node);
        let mut items: Vec<RawTocItem> = Vec::new();

        for (start, end) in windows {
            let content = document.content_range_tagged(start, end);

            let response = if items.is_empty() {
                let prompt = format!(
                    "{}\nGiven text\n:{}",
                    Prompts::generate_outline_init(),
                    content
                );
                self.client
                    .complete(Some(Prompts::system_document_analyzer()), &prompt)
                    .await?
            } else {
                let previous = serde_json::to_string(&items)
                    .map_err(|e| FilingIndexError::Serialization(e.to_string()))?;
                let prompt = format!(
                    "{}\nGiven text\n:{}\nPrevious outline\n:{}",
                    Prompts::generate_outline_continue(),
                    content,
                    previous
                );
                self.client
                    .complete(Some(Prompts::system_document_analyzer()), &prompt)
                    .await?
            };

            let batch = parse_outline_response(&response)?;
            items.extend(batch);
        }

        Ok(dedupe_outline(items))
    }

    // ── Phase 4: recursive subdivision ──────────────────────────────────────

    /// Subdivide oversized leaves in place. Never fails: every error path
    /// keeps the node as a flat leaf with a warning.
    async fn subdivide_recursive(&self, nodes: &mut Vec<Node>, document: &Document) {
        for node in nodes.iter_mut() {
            self.subdivide_node_recursive(node, document).await;
        }
    }

    /// Boxed recursion: async fns cannot recurse without indirection.
    fn subdivide_node_recursive<'a>(
        &'a self,
        node: &'a mut Node,
        document: &'a Document,
    ) -> futures::future::BoxFuture<'a, ()> {
        Box::pin(async move {
            if node.nodes.is_empty() && self.is_oversized(node, document) && node.page_span() >= 2 {
                match self.subdivide_leaf(node, document).await {
                    Ok(_) => {}
                    Err(e) => {
                        warn!(
                            "Subdivision of '{}' failed ({}); keeping as flat leaf",
                            node.title, e
                        );
                    }
                }
            }

            for child in node.nodes.iter_mut() {
                self.subdivide_node_recursive(child, document).await;
            }
        })
    }

    fn is_oversized(&self, node: &Node, document: &Document) -> bool {
        node.page_span() > self.config.max_pages_per_node
            || document.token_count_range(node.start_index, node.end_index)
                > self.config.max_tokens_per_node
    }

    /// Ask the LLM to split one oversized leaf. Returns whether children were
    /// attached.
    async fn subdivide_leaf(&self, node: &mut Node, document: &Document) -> Result<bool> {
        let content = document.content_range_tagged(node.start_index, node.end_index);
        let prompt = format!("{}\nGiven text\n:{}", Prompts::subdivide_node(), content);

        let proposals: Vec<ChildProposal> = self
            .client
            .complete_json(Some(Prompts::system_document_analyzer()), &prompt)
            .await?;

        let children = children_from_proposals(node, &proposals);
        if children.len() < 2 {
            warn!(
                "Subdivision of '{}' produced {} usable child sections; keeping as flat leaf",
                node.title,
                children.len()
            );
            return Ok(false);
        }

        let accuracy = self.check_coverage(node, &children, &content).await;
        if accuracy < self.config.accuracy_threshold {
            warn!(
                "Subdivision of '{}' rejected: coverage score {:.2} below threshold {:.2}",
                node.title, accuracy, self.config.accuracy_threshold
            );
            return Ok(false);
        }

        node.nodes = children;
        Ok(true)
    }

    /// Score how faithfully the proposed children cover the parent.
    /// An unusable answer counts as a rejection.
    async fn check_coverage(&self, node: &Node, children: &[Node], content: &str) -> f64 {
        let listing = children
            .iter()
            .map(|c| format!("- \"{}\" starting page {}", c.title, c.start_index))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = Prompts::coverage_check()
            .replace("{start_page}", &node.start_index.to_string())
            .replace("{end_page}", &node.end_index.to_string())
            .replace("{children}", &listing)
            .replace("{content}", content);

        match self
            .client
            .complete_json::<CoverageResponse>(Some(Prompts::system_document_analyzer()), &prompt)
            .await
        {
            Ok(r) => r.accuracy.clamp(0.0, 1.0),
            Err(e) => {
                warn!("Coverage check for '{}' failed: {}", node.title, e);
                0.0
            }
        }
    }
}

/// Split a document into page windows whose token counts stay under `budget`.
/// Every window holds at least one page.
pub(crate) fn window_pages(document: &Document, budget: usize) -> Vec<(usize, usize)> {
    let mut windows = Vec::new();
    let mut start = 1usize;
    let mut tokens = 0usize;

    for page in &document.pages {
        if page.number > start && tokens + page.token_count > budget {
            windows.push((start, page.number - 1));
            start = page.number;
            tokens = 0;
        }
        tokens += page.token_count;
    }

    if start <= document.page_count() {
        windows.push((start, document.page_count()));
    }

    windows
}

/// Parse an outline response: either a bare array of items or an object with
/// a `table_of_contents` field.
pub(crate) fn parse_outline_response(response: &str) -> Result<Vec<RawTocItem>> {
    let json_str = extract_json(response);

    if let Ok(items) = serde_json::from_str::<Vec<RawTocItem>>(&json_str) {
        return Ok(items);
    }

    if let Ok(wrapper) = serde_json::from_str::<TocTransformResponse>(&json_str) {
        return Ok(wrapper.table_of_contents);
    }

    Err(FilingIndexError::LlmShape(format!(
        "Failed to parse outline response: {}",
        &response[..response.len().min(200)]
    )))
}

/// Keep ToC entries whose title actually appears near the declared page.
/// Matching is case- and whitespace-insensitive within `window` pages either
/// side of the declared page.
pub(crate) fn verify_toc_entries(
    items: &[RawTocItem],
    document: &Document,
    window: usize,
) -> Vec<RawTocItem> {
    items
        .iter()
        .filter(|item| {
            let Some(page) = item.page_number() else {
                warn!("Dropping ToC entry '{}' without a page number", item.title);
                return false;
            };
            if page == 0 || page > document.page_count() {
                warn!(
                    "Dropping ToC entry '{}' with out-of-range page {}",
                    item.title, page
                );
                return false;
            }

            let lo = page.saturating_sub(window).max(1);
            let hi = (page + window).min(document.page_count());
            let haystack = normalize(&document.content_range(lo, hi));
            let needle = normalize(&item.title);

            let found = !needle.is_empty() && haystack.contains(&needle);
            if !found {
                warn!(
                    "Dropping ToC entry '{}': title not found near page {}",
                    item.title, page
                );
            }
            found
        })
        .cloned()
        .collect()
}

/// Lowercase and collapse all whitespace runs to single spaces.
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Drop outline items without a usable page and de-overlap the rest by
/// preferring earlier-declared starts: any item whose page moves backwards,
/// or that repeats an already-seen (title, page), is discarded.
pub(crate) fn dedupe_outline(items: Vec<RawTocItem>) -> Vec<RawTocItem> {
    let mut seen = std::collections::HashSet::new();
    let mut out: Vec<RawTocItem> = Vec::new();
    let mut max_page = 0usize;

    for item in items {
        let Some(page) = item.page_number() else {
            warn!("Dropping outline item '{}' without a page number", item.title);
            continue;
        };

        let key = (normalize(&item.title), page);
        if !seen.insert(key) {
            continue;
        }

        if page < max_page {
            warn!(
                "Dropping outline item '{}' at page {}: declared after page {}",
                item.title, page, max_page
            );
            continue;
        }

        max_page = page;
        out.push(item);
    }

    out
}

/// Turn subdivision proposals into well-formed children of `node`: starts
/// clamped into the parent range, strictly increasing, each child closed by
/// the next child's start (the last by the parent's end).
pub(crate) fn children_from_proposals(node: &Node, proposals: &[ChildProposal]) -> Vec<Node> {
    let mut starts: Vec<(usize, String)> = Vec::new();
    let mut last_start = 0usize;

    for proposal in proposals {
        let Some(page) = proposal.page_number() else {
            continue;
        };
        if page < node.start_index || page > node.end_index {
            continue;
        }
        if page <= last_start {
            continue;
        }
        last_start = page;
        starts.push((page, proposal.title.clone()));
    }

    let mut children = Vec::with_capacity(starts.len());
    for (i, (start, title)) in starts.iter().enumerate() {
        let end = starts
            .get(i + 1)
            .map(|(next, _)| next - 1)
            .unwrap_or(node.end_index);
        children.push(Node::new(title, *start, end));
    }

    children
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::Tokenizer;
    use serde_json::json;

    fn tokenizer() -> Tokenizer {
        Tokenizer::new().unwrap()
    }

    fn item(title: &str, page: usize) -> RawTocItem {
        RawTocItem {
            structure: Some("1".to_string()),
            title: title.to_string(),
            physical_index: Some(json!(page)),
        }
    }

    #[test]
    fn test_window_pages_respects_budget() {
        let texts: Vec<String> = (0..6).map(|i| format!("page {} word word word", i)).collect();
        let doc = Document::from_page_texts("w", texts, &tokenizer());
        let per_page = doc.pages[0].token_count;

        let windows = window_pages(&doc, per_page * 2);
        assert!(windows.len() >= 3);
        assert_eq!(windows.first().unwrap().0, 1);
        assert_eq!(windows.last().unwrap().1, 6);

        // Windows tile the document without gaps.
        for pair in windows.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
    }

    #[test]
    fn test_window_pages_single_window_when_under_budget() {
        let doc = Document::from_page_texts(
            "w",
            vec!["a".to_string(), "b".to_string()],
            &tokenizer(),
        );
        let windows = window_pages(&doc, 100000);
        assert_eq!(windows, vec![(1, 2)]);
    }

    #[test]
    fn test_parse_outline_response_array() {
        let response = r#"[
            {"structure": "1", "title": "Chapter 1", "physical_index": 1},
            {"structure": "2", "title": "Chapter 2", "physical_index": 10}
        ]"#;

        let items = parse_outline_response(response).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Chapter 1");
    }

    #[test]
    fn test_parse_outline_response_wrapped() {
        let response = r#"{
            "table_of_contents": [
                {"structure": "1", "title": "Chapter 1", "page": 1}
            ]
        }"#;

        let items = parse_outline_response(response).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].page_number(), Some(1));
    }

    #[test]
    fn test_parse_outline_response_garbage() {
        assert!(parse_outline_response("no json here").is_err());
    }

    #[test]
    fn test_verify_toc_entries_fuzzy_match() {
        let doc = Document::from_page_texts(
            "filing",
            vec![
                "Cover page".to_string(),
                "ITEM 1.   BUSINESS\noverview of operations".to_string(),
                "Risk factors discussed here".to_string(),
            ],
            &tokenizer(),
        );

        let items = vec![
            item("Item 1. Business", 2),
            // Declared on page 1 but appears on page 3: inside the ±2 window.
            item("Risk Factors", 1),
            item("Not In Document", 2),
        ];

        let verified = verify_toc_entries(&items, &doc, 2);
        assert_eq!(verified.len(), 2);
        assert_eq!(verified[0].title, "Item 1. Business");
        assert_eq!(verified[1].title, "Risk Factors");
    }

    #[test]
    fn test_verify_toc_entries_drops_out_of_range() {
        let doc = Document::from_page_texts("d", vec!["text".to_string()], &tokenizer());
        let items = vec![item("text", 9)];
        assert!(verify_toc_entries(&items, &doc, 2).is_empty());
    }

    #[test]
    fn test_dedupe_outline_prefers_earlier_starts() {
        let items = vec![
            item("A", 1),
            item("B", 5),
            item("Backwards", 3),
            item("B", 5),
            item("C", 9),
        ];
        let deduped = dedupe_outline(items);
        let titles: Vec<&str> = deduped.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_children_from_proposals_closes_parent_range() {
        let node = Node::new("Big", 10, 49);
        let proposals = vec![
            ChildProposal {
                title: "Part 1".to_string(),
                physical_index: json!("<physical_index_10>"),
            },
            ChildProposal {
                title: "Part 2".to_string(),
                physical_index: json!(25),
            },
            ChildProposal {
                title: "Out of range".to_string(),
                physical_index: json!(60),
            },
        ];

        let children = children_from_proposals(&node, &proposals);
        assert_eq!(children.len(), 2);
        assert_eq!((children[0].start_index, children[0].end_index), (10, 24));
        assert_eq!((children[1].start_index, children[1].end_index), (25, 49));
    }

    #[test]
    fn test_children_from_proposals_allows_prefix() {
        let node = Node::new("Big", 10, 30);
        let proposals = vec![
            ChildProposal {
                title: "Late start".to_string(),
                physical_index: json!(13),
            },
            ChildProposal {
                title: "Part 2".to_string(),
                physical_index: json!(20),
            },
        ];

        let children = children_from_proposals(&node, &proposals);
        // Prefix pages 10-12 stay with the parent.
        assert_eq!(children[0].start_index, 13);
        assert_eq!(children.last().unwrap().end_index, 30);
    }

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize("  Item\n1.\t BUSINESS "), "item 1. business");
    }

    #[tokio::test]
    async fn test_failed_subdivision_keeps_flat_leaf() {
        // Unreachable LLM endpoint with a single retry: every subdivision
        // attempt errors and the oversized node must survive as a leaf.
        let llm_config = crate::config::LlmConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            api_key: "test".to_string(),
            model: "test".to_string(),
            retries: 1,
            timeout_secs: 2,
            ..Default::default()
        };
        let tree_config = TreeConfig {
            max_pages_per_node: 2,
            ..Default::default()
        };
        let builder = TreeBuilder::new(LlmClient::new(llm_config), tree_config);

        let doc = Document::from_page_texts(
            "d",
            (1..=6).map(|i| format!("page {} text", i)).collect(),
            &tokenizer(),
        );
        let mut roots = vec![Node::new("Oversized Section", 1, 6)];

        builder.subdivide_recursive(&mut roots, &doc).await;

        assert!(roots[0].nodes.is_empty());
        assert_eq!((roots[0].start_index, roots[0].end_index), (1, 6));
    }
}
