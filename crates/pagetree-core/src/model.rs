//! Data model: flat TOC items, tree nodes, and the output envelope.
//!
//! A [`TocItem`] is the working representation between extraction and tree
//! building: a flat ordered list carrying dotted structure codes. A
//! [`TreeNode`] is the external contract returned to the caller.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::perf::PerformanceReport;

/// Input source for a pipeline run: a filesystem path or in-memory bytes.
#[derive(Debug, Clone)]
pub enum PdfSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl PdfSource {
    /// Display name used for the `source_file` field and title fallbacks.
    pub fn display_name(&self) -> String {
        match self {
            PdfSource::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            PdfSource::Bytes(_) => "document.pdf".to_string(),
        }
    }
}

impl From<PathBuf> for PdfSource {
    fn from(path: PathBuf) -> Self {
        PdfSource::Path(path)
    }
}

impl From<&str> for PdfSource {
    fn from(path: &str) -> Self {
        PdfSource::Path(PathBuf::from(path))
    }
}

impl From<Vec<u8>> for PdfSource {
    fn from(bytes: Vec<u8>) -> Self {
        PdfSource::Bytes(bytes)
    }
}

/// One entry of the flat ordered structure list produced by extraction and
/// consumed by the tree builder. Mutated in place by mapping and
/// verification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TocItem {
    /// Dotted hierarchical code such as `2.3.1`.
    pub structure: String,

    /// Display title, copied verbatim from the document.
    pub title: String,

    /// Page number as printed in the TOC source (may be logical).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,

    /// Resolved absolute 1-based page number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_index: Option<usize>,

    /// True iff the section begins mid-page rather than at the page top.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub appear_start: bool,

    /// Position in the flat sequence; verification writes back by this index,
    /// never by completion order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_index: Option<usize>,

    /// Outcome of mapping/verification for this item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_passed: Option<bool>,
}

impl TocItem {
    pub fn new(structure: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            structure: structure.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    /// 1-based depth derived from the structure code (`"2.3.1"` → 3).
    pub fn level(&self) -> usize {
        if self.structure.is_empty() {
            1
        } else {
            self.structure.split('.').count()
        }
    }
}

/// A node of the returned tree. Page indices are 1-based inclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeNode {
    pub title: String,

    pub start_index: usize,

    pub end_index: usize,

    /// Deterministic zero-padded id assigned in pre-order (`"0000"`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// Ordered children.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<TreeNode>,

    /// Concatenated page text for `[start_index, end_index]`, markers
    /// stripped. Present only when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// LLM-generated summary. Present only when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Marks nodes synthesized by the gap filler.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_gap_fill: bool,
}

impl TreeNode {
    pub fn new(title: impl Into<String>, start_index: usize, end_index: usize) -> Self {
        Self {
            title: title.into(),
            start_index,
            end_index,
            ..Default::default()
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total nodes in this subtree, including self.
    pub fn count_nodes(&self) -> usize {
        1 + self.nodes.iter().map(|c| c.count_nodes()).sum::<usize>()
    }

    /// Depth of this subtree, counting self as 1.
    pub fn depth(&self) -> usize {
        1 + self
            .nodes
            .iter()
            .map(|c| c.depth())
            .max()
            .unwrap_or(0)
    }

    /// Collect every leaf in pre-order.
    pub fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a TreeNode>) {
        if self.is_leaf() {
            out.push(self);
        } else {
            for child in &self.nodes {
                child.collect_leaves(out);
            }
        }
    }

    /// Visit every node in pre-order with a mutable closure.
    pub fn visit_mut(&mut self, f: &mut impl FnMut(&mut TreeNode)) {
        f(self);
        for child in &mut self.nodes {
            child.visit_mut(f);
        }
    }
}

/// Aggregate statistics for a finished tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreeStatistics {
    pub root_nodes: usize,
    pub total_nodes: usize,
    pub max_depth: usize,
}

impl TreeStatistics {
    pub fn compute(roots: &[TreeNode]) -> Self {
        Self {
            root_nodes: roots.len(),
            total_nodes: roots.iter().map(|n| n.count_nodes()).sum(),
            max_depth: roots.iter().map(|n| n.depth()).max().unwrap_or(0),
        }
    }
}

/// Coverage report from the gap filler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GapFillInfo {
    pub gaps_found: usize,
    /// Inclusive `[start, end]` ranges that were filled.
    pub gaps_filled: Vec<(usize, usize)>,
    /// Pre-fill coverage, formatted `covered/total`.
    pub original_coverage: String,
    /// Pre-fill coverage percentage.
    pub coverage_percentage: f64,
}

/// The externally observable result of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexOutput {
    pub source_file: String,
    pub total_pages: usize,
    pub structure: Vec<TreeNode>,
    pub statistics: TreeStatistics,
    /// Fraction of the verified cohort confirmed on its mapped page.
    pub verification_accuracy: f64,
    pub gap_fill_info: GapFillInfo,
    pub performance: PerformanceReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> TreeNode {
        let mut root = TreeNode::new("Ch 1", 1, 11);
        root.nodes.push(TreeNode::new("1.1", 3, 6));
        root.nodes.push(TreeNode::new("1.2", 7, 11));
        root
    }

    #[test]
    fn test_item_level_from_structure() {
        assert_eq!(TocItem::new("2", "Methods").level(), 1);
        assert_eq!(TocItem::new("2.3.1", "Detail").level(), 3);
        assert_eq!(TocItem::new("", "Untagged").level(), 1);
    }

    #[test]
    fn test_tree_counts() {
        let root = sample_tree();
        assert_eq!(root.count_nodes(), 3);
        assert_eq!(root.depth(), 2);
    }

    #[test]
    fn test_collect_leaves_preorder() {
        let root = sample_tree();
        let mut leaves = Vec::new();
        root.collect_leaves(&mut leaves);
        let titles: Vec<&str> = leaves.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["1.1", "1.2"]);
    }

    #[test]
    fn test_statistics_compute() {
        let roots = vec![sample_tree(), TreeNode::new("Ch 2", 12, 20)];
        let stats = TreeStatistics::compute(&roots);
        assert_eq!(stats.root_nodes, 2);
        assert_eq!(stats.total_nodes, 4);
        assert_eq!(stats.max_depth, 2);
    }

    #[test]
    fn test_node_serialization_skips_empty_fields() {
        let node = TreeNode::new("Intro", 1, 5);
        let value = serde_json::to_value(&node).unwrap();
        assert!(value.get("nodes").is_none());
        assert!(value.get("summary").is_none());
        assert!(value.get("is_gap_fill").is_none());
    }

    #[test]
    fn test_source_display_name() {
        let path: PdfSource = "/tmp/report-2024.pdf".into();
        assert_eq!(path.display_name(), "report-2024.pdf");
        let bytes: PdfSource = vec![0u8; 4].into();
        assert_eq!(bytes.display_name(), "document.pdf");
    }
}
