//! Hierarchical document tree.
//!
//! Each node owns a contiguous 1-indexed page range of the source document.
//! Node ids are assigned depth-first pre-order once the topology is final and
//! stay stable across retrieval use.

mod builder;
mod enrich;

pub use builder::TreeBuilder;
pub use enrich::NodeEnricher;

use crate::error::{FilingIndexError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A node in the document tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Zero-padded depth-first pre-order id (e.g. "0003"). Assigned once the
    /// final topology is fixed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// Verbatim section title.
    pub title: String,

    /// Starting page (1-indexed, inclusive).
    pub start_index: usize,

    /// Ending page (1-indexed, inclusive).
    pub end_index: usize,

    /// LLM-generated abstract of the node's content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Text of the node's own page span. For a node with children this holds
    /// only the prefix span before the first child; child pages are never
    /// duplicated in the parent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Ordered child nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,
}

impl Node {
    /// Create a new node covering the given page range.
    pub fn new(title: impl Into<String>, start_index: usize, end_index: usize) -> Self {
        Self {
            node_id: None,
            title: title.into(),
            start_index,
            end_index,
            summary: None,
            text: None,
            nodes: Vec::new(),
        }
    }

    /// Check if this node has children.
    pub fn has_children(&self) -> bool {
        !self.nodes.is_empty()
    }

    /// Number of pages covered.
    pub fn page_span(&self) -> usize {
        if self.end_index >= self.start_index {
            self.end_index - self.start_index + 1
        } else {
            0
        }
    }

    /// Recursively count all nodes in this subtree (including self).
    pub fn node_count(&self) -> usize {
        1 + self.nodes.iter().map(|n| n.node_count()).sum::<usize>()
    }

    /// Format the subtree for display.
    pub fn format_tree(&self, indent: usize) -> String {
        let prefix = "  ".repeat(indent);
        let id = self.node_id.as_deref().unwrap_or("----");
        let mut result = format!(
            "{}[{}] {} [pages {}-{}]\n",
            prefix, id, self.title, self.start_index, self.end_index
        );
        for child in &self.nodes {
            result.push_str(&child.format_tree(indent + 1));
        }
        result
    }
}

/// A complete document tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentTree {
    /// Document name.
    pub name: String,

    /// Root-level nodes.
    pub nodes: Vec<Node>,

    /// Total page count of the source document.
    pub total_pages: usize,

    /// Whole-document description derived from root summaries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DocumentTree {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>, total_pages: usize) -> Self {
        Self {
            name: name.into(),
            nodes,
            total_pages,
            description: None,
        }
    }

    /// Total node count.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().map(|n| n.node_count()).sum()
    }

    /// Format the entire tree for display.
    pub fn format(&self) -> String {
        let mut result = format!(
            "Document: {} ({} pages, {} sections)\n",
            self.name,
            self.total_pages,
            self.node_count()
        );
        for node in &self.nodes {
            result.push_str(&node.format_tree(0));
        }
        result
    }

    /// Convert to a JSON value (the `tree_json` artefact).
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(&self.nodes).map_err(Into::into)
    }
}

/// Assign depth-first pre-order node ids, zero-padded to a width that fits
/// the total node count (minimum 4 digits).
pub fn assign_node_ids(roots: &mut [Node]) {
    let total: usize = roots.iter().map(|n| n.node_count()).sum();
    let width = id_width(total);

    let mut counter = 0usize;
    for root in roots.iter_mut() {
        assign_ids_recursive(root, &mut counter, width);
    }
}

fn assign_ids_recursive(node: &mut Node, counter: &mut usize, width: usize) {
    node.node_id = Some(format!("{:0width$}", counter, width = width));
    *counter += 1;
    for child in &mut node.nodes {
        assign_ids_recursive(child, counter, width);
    }
}

/// Zero-pad width for `total` node ids: enough digits for the largest id,
/// never fewer than 4.
fn id_width(total: usize) -> usize {
    let mut width = 1;
    let mut n = total.max(1);
    while n >= 10 {
        width += 1;
        n /= 10;
    }
    width.max(4)
}

/// Flatten a tree into a pre-order node list. Children are stripped from the
/// flattened copies.
pub fn flatten(roots: &[Node]) -> Vec<Node> {
    let mut out = Vec::new();
    for root in roots {
        flatten_recursive(root, &mut out);
    }
    out
}

fn flatten_recursive(node: &Node, out: &mut Vec<Node>) {
    let mut flat = node.clone();
    flat.nodes = Vec::new();
    out.push(flat);
    for child in &node.nodes {
        flatten_recursive(child, out);
    }
}

/// Build the `node_id → node` map for O(1) lookup. Nodes without an id are
/// skipped (ids are always assigned before this is called in the pipeline).
pub fn node_map(roots: &[Node]) -> HashMap<String, Node> {
    flatten(roots)
        .into_iter()
        .filter_map(|n| n.node_id.clone().map(|id| (id, n)))
        .collect()
}

/// Deep-copy a JSON tree with the given fields removed at every level
/// (the `tree_no_text` artefact strips `text`, `start_index`, `end_index`).
pub fn strip_fields(value: &Value, fields: &[&str]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !fields.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), strip_fields(v, fields)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| strip_fields(v, fields)).collect())
        }
        other => other.clone(),
    }
}

/// Fields stripped from `tree_json` to produce `tree_no_text`.
pub const NO_TEXT_FIELDS: &[&str] = &["text", "start_index", "end_index"];

/// Validate the structural invariants of a document tree:
/// - top-level nodes partition the document pages contiguously (preface pages
///   before the first node are allowed);
/// - every child range nests inside its parent, children are contiguous and
///   the last child closes the parent's range;
/// - node ids are unique and appear in depth-first pre-order.
pub fn validate(roots: &[Node], total_pages: usize) -> Result<()> {
    if roots.is_empty() {
        return Err(FilingIndexError::TreeError(
            "tree has no root nodes".to_string(),
        ));
    }

    let mut prev_end: Option<usize> = None;
    for root in roots {
        if let Some(end) = prev_end {
            if root.start_index != end + 1 {
                return Err(FilingIndexError::TreeError(format!(
                    "root '{}' starts at page {} but previous root ends at {}",
                    root.title, root.start_index, end
                )));
            }
        }
        prev_end = Some(root.end_index);
        validate_node(root)?;
    }

    let last_end = prev_end.unwrap_or(0);
    if last_end != total_pages {
        return Err(FilingIndexError::TreeError(format!(
            "root nodes end at page {} but document has {} pages",
            last_end, total_pages
        )));
    }

    let flat = flatten(roots);
    let mut seen = std::collections::HashSet::new();
    let mut prev_id: Option<&str> = None;
    for node in &flat {
        if let Some(id) = node.node_id.as_deref() {
            if !seen.insert(id) {
                return Err(FilingIndexError::TreeError(format!(
                    "duplicate node_id '{}'",
                    id
                )));
            }
            if let Some(prev) = prev_id {
                if id <= prev {
                    return Err(FilingIndexError::TreeError(format!(
                        "node_id '{}' out of pre-order after '{}'",
                        id, prev
                    )));
                }
            }
            prev_id = Some(id);
        }
    }

    Ok(())
}

fn validate_node(node: &Node) -> Result<()> {
    if node.start_index == 0 || node.start_index > node.end_index {
        return Err(FilingIndexError::TreeError(format!(
            "node '{}' has invalid page range {}-{}",
            node.title, node.start_index, node.end_index
        )));
    }

    if node.nodes.is_empty() {
        return Ok(());
    }

    let first = &node.nodes[0];
    if first.start_index < node.start_index {
        return Err(FilingIndexError::TreeError(format!(
            "child '{}' starts before parent '{}'",
            first.title, node.title
        )));
    }

    let mut prev_end: Option<usize> = None;
    for child in &node.nodes {
        if child.end_index > node.end_index {
            return Err(FilingIndexError::TreeError(format!(
                "child '{}' ends after parent '{}'",
                child.title, node.title
            )));
        }
        if let Some(end) = prev_end {
            if child.start_index != end + 1 {
                return Err(FilingIndexError::TreeError(format!(
                    "children of '{}' are not contiguous at '{}'",
                    node.title, child.title
                )));
            }
        }
        prev_end = Some(child.end_index);
        validate_node(child)?;
    }

    if prev_end != Some(node.end_index) {
        return Err(FilingIndexError::TreeError(format!(
            "children of '{}' do not close the parent range",
            node.title
        )));
    }

    Ok(())
}

/// Raw outline item from an LLM response, before tree construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTocItem {
    /// Dotted hierarchy index (e.g. "1.2.3").
    pub structure: Option<String>,

    /// Section title.
    pub title: String,

    /// Physical page index; may be an integer or a "<physical_index_X>" tag.
    #[serde(alias = "page")]
    pub physical_index: Option<Value>,
}

impl RawTocItem {
    /// Extract the page number from the physical_index field.
    pub fn page_number(&self) -> Option<usize> {
        match &self.physical_index {
            Some(Value::Number(n)) => n.as_u64().map(|n| n as usize),
            Some(Value::String(s)) => {
                if s.starts_with("<physical_index_") {
                    s.trim_start_matches("<physical_index_")
                        .trim_end_matches('>')
                        .parse()
                        .ok()
                } else {
                    s.parse().ok()
                }
            }
            _ => None,
        }
    }

    /// Depth implied by the dotted structure index (1-based); items without a
    /// structure index are treated as top level.
    pub fn depth(&self) -> usize {
        self.structure
            .as_deref()
            .map(|s| s.split('.').filter(|p| !p.is_empty()).count().max(1))
            .unwrap_or(1)
    }
}

/// Lift a flat, page-ordered outline into a hierarchy using the dotted
/// structure indices for depth. End pages derive from the next item's start
/// (at any depth) minus one; parent ranges are then widened to enclose their
/// children.
pub fn build_tree_from_outline(items: &[RawTocItem], total_pages: usize) -> Vec<Node> {
    let mut roots: Vec<Node> = Vec::new();
    // Path of indices into the tree under construction, one per depth level.
    let mut stack: Vec<usize> = Vec::new();

    for (i, item) in items.iter().enumerate() {
        let start_index = item.page_number().unwrap_or(1).max(1);

        let end_index = items
            .get(i + 1)
            .and_then(|next| next.page_number())
            .map(|n| n.saturating_sub(1).max(start_index))
            .unwrap_or(total_pages)
            .min(total_pages);

        let node = Node::new(&item.title, start_index, end_index.max(start_index));
        let depth = item.depth();

        // A deeper item than the current path can only nest one level down.
        let target_depth = depth.min(stack.len() + 1);
        stack.truncate(target_depth - 1);

        if stack.is_empty() {
            roots.push(node);
            stack.push(roots.len() - 1);
        } else {
            let parent = node_at_path_mut(&mut roots, &stack);
            parent.nodes.push(node);
            let idx = parent.nodes.len() - 1;
            stack.push(idx);
        }
    }

    merge_same_start_siblings(&mut roots);
    for root in &mut roots {
        fix_end_indices(root);
    }

    roots
}

/// Two siblings declared on the same page cannot both hold a page range;
/// fold the later one (and its children) into the earlier, keeping the wider
/// end.
fn merge_same_start_siblings(nodes: &mut Vec<Node>) {
    let mut i = 1;
    while i < nodes.len() {
        if nodes[i].start_index <= nodes[i - 1].start_index {
            let dup = nodes.remove(i);
            let prev = &mut nodes[i - 1];
            if dup.end_index > prev.end_index {
                prev.end_index = dup.end_index;
            }
            prev.nodes.extend(dup.nodes);
        } else {
            i += 1;
        }
    }
    for node in nodes.iter_mut() {
        merge_same_start_siblings(&mut node.nodes);
    }
}

fn node_at_path_mut<'a>(roots: &'a mut [Node], path: &[usize]) -> &'a mut Node {
    let mut node = &mut roots[path[0]];
    for &idx in &path[1..] {
        node = &mut node.nodes[idx];
    }
    node
}

/// Widen parent ranges so they enclose all of their children.
fn fix_end_indices(node: &mut Node) {
    for child in &mut node.nodes {
        fix_end_indices(child);
    }

    if let Some(max_end) = node.nodes.iter().map(|n| n.end_index).max() {
        if max_end > node.end_index {
            node.end_index = max_end;
        }
    }
}
