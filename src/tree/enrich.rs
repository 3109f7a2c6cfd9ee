//! Node enrichment: text attachment, summaries and document description.

use crate::document::Document;
use crate::error::Result;
use crate::llm::{LlmClient, Prompts};
use crate::tokenizer::Tokenizer;
use crate::tree::Node;
use futures::future::BoxFuture;
use tracing::warn;

/// Token budget for the text fed to a single summary prompt.
const SUMMARY_INPUT_TOKENS: usize = 6000;

/// Attempts before a summary falls back to the node title.
const SUMMARY_RETRIES: u32 = 3;

/// Attaches node text and generates summaries plus the document description.
pub struct NodeEnricher {
    client: LlmClient,
    tokenizer: Tokenizer,
}

impl NodeEnricher {
    pub fn new(client: LlmClient, tokenizer: Tokenizer) -> Self {
        Self { client, tokenizer }
    }

    /// Populate every node's `text` from its page range.
    ///
    /// A node with children keeps only its prefix span (pages before the
    /// first child) so child pages are never duplicated in the parent.
    pub fn attach_text(&self, roots: &mut [Node], document: &Document) {
        for node in roots.iter_mut() {
            Self::attach_node_text(node, document);
        }
    }

    fn attach_node_text(node: &mut Node, document: &Document) {
        if node.nodes.is_empty() {
            node.text = Some(document.content_range(node.start_index, node.end_index));
        } else {
            let first_child_start = node.nodes[0].start_index;
            if first_child_start > node.start_index {
                node.text =
                    Some(document.content_range(node.start_index, first_child_start - 1));
            }
            for child in &mut node.nodes {
                Self::attach_node_text(child, document);
            }
        }
    }

    /// Generate a summary for every node, post-order: leaves from their own
    /// text, internal nodes from their children's summaries.
    pub async fn summarize(&self, roots: &mut [Node]) -> Result<()> {
        for node in roots.iter_mut() {
            self.summarize_node(node).await?;
        }
        Ok(())
    }

    fn summarize_node<'a>(&'a self, node: &'a mut Node) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for child in node.nodes.iter_mut() {
                self.summarize_node(child).await?;
            }

            let source = if node.nodes.is_empty() {
                node.text.clone().unwrap_or_default()
            } else {
                node.nodes
                    .iter()
                    .map(|c| {
                        format!(
                            "{}: {}",
                            c.title,
                            c.summary.as_deref().unwrap_or("(no summary)")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            };

            node.summary = Some(self.summary_for(&node.title, &source).await);
            Ok(())
        })
    }

    /// Produce one content-bearing summary, retrying rejected outputs and
    /// defaulting to the node title.
    async fn summary_for(&self, title: &str, content: &str) -> String {
        if content.trim().is_empty() {
            return title.to_string();
        }

        let truncated = self.truncate_tokens(content, SUMMARY_INPUT_TOKENS);
        let prompt = Prompts::node_summary()
            .replace("{title}", title)
            .replace("{content}", &truncated);

        for attempt in 0..SUMMARY_RETRIES {
            match self
                .client
                .complete(Some(Prompts::system_document_analyzer()), &prompt)
                .await
            {
                Ok(response) => {
                    let summary = response.trim().to_string();
                    if is_content_bearing(&summary) {
                        return summary;
                    }
                    warn!(
                        "Rejected boilerplate summary for '{}' (attempt {})",
                        title,
                        attempt + 1
                    );
                }
                Err(e) => {
                    warn!(
                        "Summary generation for '{}' failed (attempt {}): {}",
                        title,
                        attempt + 1,
                        e
                    );
                }
            }
        }

        title.to_string()
    }

    /// Generate a whole-document description from the ordered root summaries.
    pub async fn describe_document(&self, roots: &[Node]) -> Option<String> {
        let summaries = roots
            .iter()
            .map(|n| {
                format!(
                    "{}: {}",
                    n.title,
                    n.summary.as_deref().unwrap_or("(no summary)")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        if summaries.trim().is_empty() {
            return None;
        }

        let prompt = Prompts::doc_description().replace("{summaries}", &summaries);
        match self
            .client
            .complete(Some(Prompts::system_document_analyzer()), &prompt)
            .await
        {
            Ok(response) => {
                let description = response.trim().to_string();
                if is_content_bearing(&description) {
                    Some(description)
                } else {
                    None
                }
            }
            Err(e) => {
                warn!("Document description failed: {}", e);
                None
            }
        }
    }

    /// Cut text to the first `budget` tokens.
    fn truncate_tokens(&self, text: &str, budget: usize) -> String {
        let tokens = self.tokenizer.encode(text);
        if tokens.len() <= budget {
            return text.to_string();
        }
        self.tokenizer
            .decode(&tokens[..budget])
            .unwrap_or_else(|_| text.chars().take(budget * 4).collect())
    }
}

/// Reject empty and boilerplate refusal outputs.
fn is_content_bearing(summary: &str) -> bool {
    if summary.len() < 20 {
        return false;
    }
    let lower = summary.to_lowercase();
    const BOILERPLATE: &[&str] = &[
        "i cannot",
        "i can't",
        "i'm sorry",
        "i am sorry",
        "as an ai",
        "no content",
        "n/a",
    ];
    !BOILERPLATE.iter().any(|b| lower.starts_with(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> Tokenizer {
        Tokenizer::new().unwrap()
    }

    fn doc() -> Document {
        Document::from_page_texts(
            "d",
            (1..=6).map(|i| format!("page {} body", i)).collect(),
            &tokenizer(),
        )
    }

    fn enricher() -> NodeEnricher {
        NodeEnricher::new(
            LlmClient::new(crate::config::LlmConfig::default()),
            tokenizer(),
        )
    }

    #[test]
    fn test_attach_text_leaf_gets_full_range() {
        let mut roots = vec![Node::new("A", 1, 3)];
        enricher().attach_text(&mut roots, &doc());

        let text = roots[0].text.as_deref().unwrap();
        assert!(text.contains("page 1 body"));
        assert!(text.contains("page 3 body"));
        assert!(!text.contains("page 4 body"));
    }

    #[test]
    fn test_attach_text_parent_keeps_prefix_only() {
        let mut parent = Node::new("A", 1, 6);
        parent.nodes.push(Node::new("A.1", 3, 4));
        parent.nodes.push(Node::new("A.2", 5, 6));
        let mut roots = vec![parent];

        enricher().attach_text(&mut roots, &doc());

        let parent_text = roots[0].text.as_deref().unwrap();
        assert!(parent_text.contains("page 1 body"));
        assert!(parent_text.contains("page 2 body"));
        // Child pages are not duplicated in the parent.
        assert!(!parent_text.contains("page 3 body"));
        assert!(roots[0].nodes[0].text.as_deref().unwrap().contains("page 3 body"));
    }

    #[test]
    fn test_attach_text_parent_without_prefix_has_no_text() {
        let mut parent = Node::new("A", 1, 6);
        parent.nodes.push(Node::new("A.1", 1, 6));
        let mut roots = vec![parent];

        enricher().attach_text(&mut roots, &doc());
        assert!(roots[0].text.is_none());
    }

    #[test]
    fn test_is_content_bearing() {
        assert!(is_content_bearing(
            "This section covers revenue recognition policies across segments."
        ));
        assert!(!is_content_bearing(""));
        assert!(!is_content_bearing("short"));
        assert!(!is_content_bearing(
            "I cannot summarize this section because it is empty."
        ));
        assert!(!is_content_bearing("As an AI, I am unable to comply here."));
    }

    #[test]
    fn test_truncate_tokens_is_noop_under_budget() {
        let e = enricher();
        let text = "brief section body";
        assert_eq!(e.truncate_tokens(text, 100), text);
    }

    #[test]
    fn test_truncate_tokens_cuts_long_text() {
        let e = enricher();
        let text = "word ".repeat(500);
        let cut = e.truncate_tokens(&text, 50);
        assert!(e.tokenizer.count(&cut) <= 50);
    }
}
